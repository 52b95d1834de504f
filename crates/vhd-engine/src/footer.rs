use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::checksum::{stamp_checksum, stored_checksum, vhd_checksum};
use crate::geometry::ChsGeometry;
use crate::util::{be_u16, be_u32, be_u64, put_be_u16, put_be_u32, put_be_u64};
use crate::{DiskError, Result};

pub const FOOTER_SIZE: usize = 512;
pub const VHD_FOOTER_COOKIE: [u8; 8] = *b"conectix";

/// Footer versions accepted on open. New images are written with `1.0`.
pub const VHD_VERSION_1_0: u32 = 0x0001_0000;
pub const VHD_VERSION_5_0: u32 = 0x0005_0000;

/// Bit 1 of `features` is reserved and must always be set.
pub const VHD_FEATURES_RESERVED: u32 = 0x0000_0002;

/// `data_offset` value for disks without a dynamic header.
pub const NO_DATA_OFFSET: u64 = u64::MAX;

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 00:00:00 UTC).
pub const VHD_EPOCH_UNIX_SECS: u64 = 946_684_800;

const CHECKSUM_FIELD: Range<usize> = 64..68;

/// VHD disk type as stored in the footer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiskType {
    None,
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            2 => Some(Self::Fixed),
            3 => Some(Self::Dynamic),
            4 => Some(Self::Differencing),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed => 2,
            Self::Dynamic => 3,
            Self::Differencing => 4,
        }
    }

    /// Dynamic and differencing disks carry a dynamic header and BAT.
    pub fn is_sparse(self) -> bool {
        matches!(self, Self::Dynamic | Self::Differencing)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fixed => "fixed",
            Self::Dynamic => "dynamic",
            Self::Differencing => "differencing",
        }
    }
}

/// The 512-byte VHD footer (also stored at offset 0 of dynamic and differencing images).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VhdFooter {
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: ChsGeometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub unique_id: Uuid,
    pub saved_state: bool,
}

impl VhdFooter {
    /// Decodes and validates a footer: cookie, version, disk type and checksum.
    pub fn parse(raw: &[u8; FOOTER_SIZE]) -> Result<Self> {
        if raw[..8] != VHD_FOOTER_COOKIE {
            return Err(DiskError::CorruptImage("vhd footer cookie mismatch"));
        }

        let version = be_u32(&raw[12..16]);
        if version != VHD_VERSION_1_0 && version != VHD_VERSION_5_0 {
            return Err(DiskError::CorruptImage("vhd footer version unsupported"));
        }

        let disk_type = DiskType::from_u32(be_u32(&raw[60..64]))
            .ok_or(DiskError::CorruptImage("vhd disk type invalid"))?;

        let checksum = stored_checksum(raw, CHECKSUM_FIELD);
        if checksum != vhd_checksum(raw, CHECKSUM_FIELD) {
            return Err(DiskError::CorruptImage("vhd footer checksum mismatch"));
        }

        let current_size = be_u64(&raw[48..56]);

        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&raw[68..84]);

        Ok(Self {
            features: be_u32(&raw[8..12]),
            version,
            data_offset: be_u64(&raw[16..24]),
            timestamp: be_u32(&raw[24..28]),
            creator_app: [raw[28], raw[29], raw[30], raw[31]],
            creator_version: be_u32(&raw[32..36]),
            creator_os: [raw[36], raw[37], raw[38], raw[39]],
            original_size: be_u64(&raw[40..48]),
            current_size,
            geometry: ChsGeometry {
                cylinders: be_u16(&raw[56..58]),
                heads: raw[58],
                sectors_per_track: raw[59],
            },
            disk_type,
            checksum,
            unique_id: Uuid::from_bytes(unique_id),
            saved_state: raw[84] != 0,
        })
    }

    /// Encodes the footer. The checksum is always recomputed; `self.checksum` is ignored.
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut raw = [0u8; FOOTER_SIZE];
        raw[..8].copy_from_slice(&VHD_FOOTER_COOKIE);
        put_be_u32(&mut raw, 8, self.features);
        put_be_u32(&mut raw, 12, self.version);
        put_be_u64(&mut raw, 16, self.data_offset);
        put_be_u32(&mut raw, 24, self.timestamp);
        raw[28..32].copy_from_slice(&self.creator_app);
        put_be_u32(&mut raw, 32, self.creator_version);
        raw[36..40].copy_from_slice(&self.creator_os);
        put_be_u64(&mut raw, 40, self.original_size);
        put_be_u64(&mut raw, 48, self.current_size);
        put_be_u16(&mut raw, 56, self.geometry.cylinders);
        raw[58] = self.geometry.heads;
        raw[59] = self.geometry.sectors_per_track;
        put_be_u32(&mut raw, 60, self.disk_type.as_u32());
        raw[68..84].copy_from_slice(self.unique_id.as_bytes());
        raw[84] = u8::from(self.saved_state);
        stamp_checksum(&mut raw, CHECKSUM_FIELD);
        raw
    }

    /// Encodes the footer and records the resulting checksum in `self`.
    pub fn seal(&mut self) -> [u8; FOOTER_SIZE] {
        let raw = self.to_bytes();
        self.checksum = stored_checksum(&raw, CHECKSUM_FIELD);
        raw
    }
}

/// Returns true if `raw` holds a footer that [`VhdFooter::parse`] accepts.
pub fn verify_footer(raw: &[u8; FOOTER_SIZE]) -> bool {
    VhdFooter::parse(raw).is_ok()
}

/// Converts a wall-clock time to VHD seconds, saturating at both ends of the `u32` range.
pub fn vhd_timestamp(time: SystemTime) -> u32 {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_UNIX_SECS)
        .min(u64::from(u32::MAX)) as u32
}
