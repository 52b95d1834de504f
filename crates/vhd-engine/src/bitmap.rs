use std::num::NonZeroUsize;
use std::ops::Range;

use lru::LruCache;

use crate::bat::BatEntry;
use crate::util::try_alloc_zeroed;
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

// Hard cap to avoid absurd allocations from untrusted images.
pub const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB

/// Sector-validity bitmap stored in front of every allocated block.
///
/// Bits are MSB-first: sector 0 of the block is bit 7 of byte 0. A set bit means the sector
/// holds data in this image. Padding bits past the end of the block are kept set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBitmap {
    bytes: Vec<u8>,
    sectors: u32,
}

impl BlockBitmap {
    /// Bitmap for a freshly allocated block: no sector valid yet.
    pub fn new_unwritten(sectors_per_block: u32, size: usize) -> Result<Self> {
        let mut bitmap = Self::from_bytes(try_alloc_zeroed(size)?, sectors_per_block)?;
        for pad in sectors_per_block as usize..size * 8 {
            bitmap.bytes[pad / 8] |= 0x80 >> (pad % 8);
        }
        Ok(bitmap)
    }

    pub fn from_bytes(bytes: Vec<u8>, sectors_per_block: u32) -> Result<Self> {
        if (bytes.len() as u64) * 8 < u64::from(sectors_per_block) {
            return Err(DiskError::CorruptImage("vhd bitmap too small"));
        }
        Ok(Self {
            bytes,
            sectors: sectors_per_block,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    pub fn is_set(&self, sector: u32) -> bool {
        let idx = sector as usize;
        self.bytes[idx / 8] & (0x80 >> (idx % 8)) != 0
    }

    /// Returns the state of `start` and how many consecutive sectors (at most `max`,
    /// never past the end of the block) share it.
    pub fn run_from(&self, start: u32, max: u32) -> (bool, u32) {
        let value = self.is_set(start);
        let limit = start.saturating_add(max).min(self.sectors);
        let uniform = if value { 0xFF } else { 0x00 };

        let mut sector = start + 1;
        while sector < limit {
            if sector % 8 == 0 && sector + 8 <= limit && self.bytes[sector as usize / 8] == uniform
            {
                sector += 8;
                continue;
            }
            if self.is_set(sector) != value {
                break;
            }
            sector += 1;
        }
        (value, sector.min(limit) - start)
    }

    /// Marks `count` sectors from `start` valid. Returns the byte range that changed, if any.
    pub fn mark_valid(&mut self, start: u32, count: u32) -> Option<Range<usize>> {
        let end = start.saturating_add(count).min(self.sectors);
        let mut dirty: Option<Range<usize>> = None;
        for sector in start..end {
            let idx = sector as usize;
            let mask = 0x80 >> (idx % 8);
            let byte = &mut self.bytes[idx / 8];
            if *byte & mask == 0 {
                *byte |= mask;
                let b = idx / 8;
                dirty = Some(match dirty {
                    None => b..b + 1,
                    Some(r) => r.start.min(b)..r.end.max(b + 1),
                });
            }
        }
        dirty
    }

    /// Number of valid sectors in the block.
    pub fn valid_sectors(&self) -> u32 {
        (0..self.sectors).filter(|s| self.is_set(*s)).count() as u32
    }
}

/// LRU of block bitmaps keyed by the block's starting sector.
///
/// With capacity 1 this is the classic single-slot cache: touching another block evicts the
/// previous bitmap.
pub struct BitmapCache {
    cache: LruCache<u32, BlockBitmap>,
    sectors_per_block: u32,
    bitmap_size: usize,
}

impl BitmapCache {
    pub fn new(capacity: NonZeroUsize, sectors_per_block: u32, bitmap_size: u64) -> Result<Self> {
        if bitmap_size > MAX_BITMAP_BYTES {
            return Err(DiskError::Unsupported("vhd bitmap too large"));
        }
        Ok(Self {
            cache: LruCache::new(capacity),
            sectors_per_block,
            bitmap_size: bitmap_size as usize,
        })
    }

    pub fn bitmap_size(&self) -> usize {
        self.bitmap_size
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn contains(&self, block_sector: u32) -> bool {
        self.cache.contains(&block_sector)
    }

    /// Returns the bitmap of the block `entry` points at, reading it on a miss.
    /// Unallocated blocks have no bitmap.
    pub fn load<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        entry: BatEntry,
    ) -> Result<Option<&mut BlockBitmap>> {
        let BatEntry::Allocated(block_sector) = entry else {
            return Ok(None);
        };

        if !self.cache.contains(&block_sector) {
            let mut bytes = try_alloc_zeroed(self.bitmap_size)?;
            let offset = u64::from(block_sector) * SECTOR_SIZE as u64;
            match backend.read_at(offset, &mut bytes) {
                Ok(()) => {}
                Err(DiskError::OutOfBounds { .. }) => {
                    return Err(DiskError::CorruptImage("vhd block bitmap truncated"));
                }
                Err(e) => return Err(e),
            }
            let bitmap = BlockBitmap::from_bytes(bytes, self.sectors_per_block)?;
            self.cache.push(block_sector, bitmap);
        }

        self.cache
            .get_mut(&block_sector)
            .map(Some)
            .ok_or(DiskError::CorruptImage("vhd bitmap cache missing"))
    }

    pub fn insert(&mut self, block_sector: u32, bitmap: BlockBitmap) {
        self.cache.push(block_sector, bitmap);
    }

    pub fn invalidate(&mut self, block_sector: u32) {
        self.cache.pop(&block_sector);
    }
}
