use crate::util::checked_range;
use crate::{DiskError, Result};

pub const SECTOR_SIZE: usize = 512;

/// Byte-addressed virtual disk with sector helpers.
///
/// `read_at`/`write_at` accept any offset and length inside the capacity; the sector helpers
/// require whole sectors.
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;

    fn total_sectors(&self) -> u64 {
        self.capacity_bytes() / SECTOR_SIZE as u64
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let offset = sector_offset(lba, buf.len())?;
        checked_range(offset, buf.len(), self.capacity_bytes())?;
        self.read_at(offset, buf)
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        let offset = sector_offset(lba, buf.len())?;
        checked_range(offset, buf.len(), self.capacity_bytes())?;
        self.write_at(offset, buf)
    }
}

fn sector_offset(lba: u64, len: usize) -> Result<u64> {
    let offset = lba
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if !len.is_multiple_of(SECTOR_SIZE) {
        return Err(DiskError::Misaligned {
            offset,
            len,
            alignment: SECTOR_SIZE,
        });
    }
    Ok(offset)
}
