use crate::util::{align_up_u64, be_u32, try_alloc_zeroed};
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

/// On-disk marker for a block that has never been written.
pub const BAT_ENTRY_UNALLOCATED: u32 = 0xFFFF_FFFF;

// Hard cap to avoid absurd allocations from untrusted images.
pub const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB

/// One BAT slot: where a block's `[bitmap][data]` pair starts, if anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatEntry {
    Unallocated,
    /// Sector index (not byte offset) of the block's bitmap.
    Allocated(u32),
}

impl BatEntry {
    pub fn from_raw(raw: u32) -> Self {
        if raw == BAT_ENTRY_UNALLOCATED {
            Self::Unallocated
        } else {
            Self::Allocated(raw)
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Unallocated => BAT_ENTRY_UNALLOCATED,
            Self::Allocated(sector) => sector,
        }
    }

    pub fn sector(self) -> Option<u32> {
        match self {
            Self::Unallocated => None,
            Self::Allocated(sector) => Some(sector),
        }
    }
}

/// A sector-aligned virtual offset decomposed against the block grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorLocation {
    /// Absolute virtual sector number.
    pub sector: u64,
    pub block_index: usize,
    pub sector_in_block: u32,
}

/// In-memory Block Allocation Table.
#[derive(Clone, Debug)]
pub struct Bat {
    entries: Vec<BatEntry>,
    table_offset: u64,
    sectors_per_block: u32,
}

impl Bat {
    /// A table with every slot unallocated, as written for a freshly created image.
    pub fn new_unallocated(
        table_offset: u64,
        max_table_entries: u32,
        sectors_per_block: u32,
    ) -> Result<Self> {
        let count = max_table_entries as usize;
        Self::check_size(count)?;
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(count)
            .map_err(|_| DiskError::InsufficientResources(count * 4))?;
        entries.resize(count, BatEntry::Unallocated);
        Ok(Self {
            entries,
            table_offset,
            sectors_per_block,
        })
    }

    /// Reads `max_table_entries` big-endian slots from `table_offset`.
    pub fn load<B: StorageBackend>(
        backend: &mut B,
        table_offset: u64,
        max_table_entries: u32,
        sectors_per_block: u32,
    ) -> Result<Self> {
        let count = max_table_entries as usize;
        Self::check_size(count)?;
        let mut raw = try_alloc_zeroed(count * 4)?;
        match backend.read_at(table_offset, &mut raw) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("vhd bat truncated"));
            }
            Err(e) => return Err(e),
        }

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(count)
            .map_err(|_| DiskError::InsufficientResources(count * 4))?;
        entries.extend(raw.chunks_exact(4).map(|c| BatEntry::from_raw(be_u32(c))));
        Ok(Self {
            entries,
            table_offset,
            sectors_per_block,
        })
    }

    fn check_size(count: usize) -> Result<()> {
        if (count as u64) * 4 > MAX_BAT_BYTES {
            return Err(DiskError::Unsupported("vhd bat too large"));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    pub fn sectors_per_block(&self) -> u32 {
        self.sectors_per_block
    }

    /// Size of the table on disk, padded to whole sectors.
    pub fn size_on_disk(&self) -> Result<u64> {
        align_up_u64(self.entries.len() as u64 * 4, SECTOR_SIZE as u64)
    }

    pub fn entries(&self) -> &[BatEntry] {
        &self.entries
    }

    pub fn allocated_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, BatEntry::Allocated(_)))
            .count()
    }

    /// Splits a sector-aligned virtual byte offset into sector, block index and sector
    /// within that block.
    pub fn locate(&self, byte_offset: u64) -> Result<SectorLocation> {
        if !byte_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::Misaligned {
                offset: byte_offset,
                len: 0,
                alignment: SECTOR_SIZE,
            });
        }
        let sector = byte_offset / SECTOR_SIZE as u64;
        let spb = u64::from(self.sectors_per_block);
        let block_index: usize = (sector / spb)
            .try_into()
            .map_err(|_| DiskError::OffsetOverflow)?;
        if block_index >= self.entries.len() {
            return Err(DiskError::CorruptImage("vhd block index out of range"));
        }
        Ok(SectorLocation {
            sector,
            block_index,
            sector_in_block: (sector % spb) as u32,
        })
    }

    pub fn get(&self, block_index: usize) -> Result<BatEntry> {
        self.entries
            .get(block_index)
            .copied()
            .ok_or(DiskError::CorruptImage("vhd block index out of range"))
    }

    /// File offset of slot `block_index`.
    pub fn entry_offset(&self, block_index: usize) -> Result<u64> {
        (block_index as u64)
            .checked_mul(4)
            .and_then(|v| v.checked_add(self.table_offset))
            .ok_or(DiskError::OffsetOverflow)
    }

    /// Points slot `block_index` at `sector`, writing the big-endian entry to its slot on
    /// disk before updating memory.
    pub fn assign<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        block_index: usize,
        sector: u32,
    ) -> Result<()> {
        if sector == BAT_ENTRY_UNALLOCATED {
            return Err(DiskError::Unsupported("vhd block offset out of range"));
        }
        let current = self.get(block_index)?;
        if current != BatEntry::Unallocated {
            return Err(DiskError::CorruptImage("vhd block already allocated"));
        }
        let offset = self.entry_offset(block_index)?;
        backend.write_at(offset, &sector.to_be_bytes())?;
        self.entries[block_index] = BatEntry::Allocated(sector);
        Ok(())
    }

    /// Serialises the whole table, padded with unallocated markers to whole sectors.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let size: usize = self
            .size_on_disk()?
            .try_into()
            .map_err(|_| DiskError::Unsupported("vhd bat too large"))?;
        let mut raw = try_alloc_zeroed(size)?;
        raw.fill(0xFF);
        for (chunk, entry) in raw.chunks_exact_mut(4).zip(&self.entries) {
            chunk.copy_from_slice(&entry.to_raw().to_be_bytes());
        }
        Ok(raw)
    }
}
