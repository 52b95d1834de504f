use crate::SECTOR_SIZE;

/// Largest geometry a VHD footer can describe (65535 cylinders, 16 heads, 255 sectors).
pub const VHD_MAX_GEOMETRY: u64 = 65535 * 16 * 255;

/// Cylinder/head/sector triple stored in the VHD footer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChsGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl ChsGeometry {
    pub fn total_sectors(&self) -> u64 {
        u64::from(self.cylinders) * u64::from(self.heads) * u64::from(self.sectors_per_track)
    }

    /// Capacity addressable through CHS. May be smaller than the virtual size.
    pub fn capacity_bytes(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE as u64
    }
}

/// Derives the CHS geometry for a disk of `total_size` bytes.
///
/// This is the bucketed algorithm from the VHD format specification; Virtual PC and
/// Hyper-V use the same one, so the result must not drift. It rounds down: the geometry
/// can address fewer sectors than the disk holds.
pub fn chs_geometry(total_size: u64) -> ChsGeometry {
    let total_sectors = (total_size / SECTOR_SIZE as u64).min(VHD_MAX_GEOMETRY);

    let (sectors_per_track, heads, cyl_times_heads) = if total_sectors >= 65535 * 16 * 63 {
        (255u64, 16u64, total_sectors / 255)
    } else {
        let mut spt = 17u64;
        let mut cth = total_sectors / spt;
        let mut heads = cth.div_ceil(1024).max(4);

        if cth >= heads * 1024 || heads > 16 {
            spt = 31;
            heads = 16;
            cth = total_sectors / spt;
        }
        if cth >= heads * 1024 {
            spt = 63;
            heads = 16;
            cth = total_sectors / spt;
        }
        (spt, heads, cth)
    };

    ChsGeometry {
        cylinders: (cyl_times_heads / heads).min(u64::from(u16::MAX)) as u16,
        heads: heads as u8,
        sectors_per_track: sectors_per_track as u8,
    }
}
