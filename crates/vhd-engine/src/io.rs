use tracing::{debug, trace};

use crate::bat::BatEntry;
use crate::bitmap::BlockBitmap;
use crate::footer::FOOTER_SIZE;
use crate::util::{
    align_down_u64, align_up_u64, check_sector_aligned, checked_range, try_alloc_zeroed,
};
use crate::vhd::{Layout, SparseLayout, VhdDisk};
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

/// Outcome of one [`VhdDisk::read_aligned`] call.
///
/// Only a prefix of the buffer may be covered; the caller advances by [`Extent::len`] and
/// calls again for the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extent {
    /// The first `n` bytes were read from the image.
    Data(usize),
    /// The first `n` bytes have no data in this image. They are left untouched; the caller
    /// zero-fills them or asks a parent image.
    Unallocated(usize),
}

impl Extent {
    pub fn len(self) -> usize {
        match self {
            Self::Data(n) | Self::Unallocated(n) => n,
        }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn is_data(self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// A stretch of sectors with the same validity inside one block.
struct Run {
    present: bool,
    len: usize,
    /// File offset of the run's first sector (meaningless when absent).
    phys: u64,
}

fn read_backend<B: StorageBackend>(
    backend: &mut B,
    offset: u64,
    buf: &mut [u8],
    ctx: &'static str,
) -> Result<()> {
    match backend.read_at(offset, buf) {
        Ok(()) => Ok(()),
        Err(DiskError::OutOfBounds { .. }) => Err(DiskError::CorruptImage(ctx)),
        Err(e) => Err(e),
    }
}

impl SparseLayout {
    fn data_offset(&self, block_sector: u32, sector_in_block: u32) -> u64 {
        u64::from(block_sector) * SECTOR_SIZE as u64
            + self.bitmap_size
            + u64::from(sector_in_block) * SECTOR_SIZE as u64
    }

    /// Sectors from `sector_in_block` to the end of the block, capped by `remaining` bytes.
    fn clip(&self, sector_in_block: u32, remaining: usize) -> u32 {
        let left = self.bat.sectors_per_block() - sector_in_block;
        let wanted = (remaining / SECTOR_SIZE).min(u32::MAX as usize) as u32;
        left.min(wanted)
    }

    fn next_run<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        offset: u64,
        remaining: usize,
    ) -> Result<Run> {
        let loc = self.bat.locate(offset)?;
        let max = self.clip(loc.sector_in_block, remaining);
        let entry = self.bat.get(loc.block_index)?;

        let Some(bitmap) = self.bitmaps.load(backend, entry)? else {
            return Ok(Run {
                present: false,
                len: max as usize * SECTOR_SIZE,
                phys: 0,
            });
        };
        let (present, sectors) = bitmap.run_from(loc.sector_in_block, max);
        let block_sector = entry.sector().unwrap_or_default();
        Ok(Run {
            present,
            len: sectors as usize * SECTOR_SIZE,
            phys: self.data_offset(block_sector, loc.sector_in_block),
        })
    }

    /// Reads the longest prefix of `buf` whose sectors share one validity state.
    fn read_runs<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<Extent> {
        let mut pos = 0usize;
        let mut state = None;
        while pos < buf.len() {
            let run = self.next_run(backend, offset + pos as u64, buf.len() - pos)?;
            if *state.get_or_insert(run.present) != run.present {
                break;
            }
            trace!(
                offset = offset + pos as u64,
                len = run.len,
                present = run.present,
                "vhd read run"
            );
            if run.present {
                read_backend(
                    backend,
                    run.phys,
                    &mut buf[pos..pos + run.len],
                    "vhd block data truncated",
                )?;
            }
            pos += run.len;
        }
        Ok(match state {
            Some(false) => Extent::Unallocated(pos),
            _ => Extent::Data(pos),
        })
    }

    /// Writes `buf` block by block, allocating blocks on first touch. Each chunk's data lands
    /// before its bitmap bits are set.
    fn write_blocks<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        offset: u64,
        buf: &[u8],
        end_of_data: &mut u64,
        footer_raw: &[u8; FOOTER_SIZE],
    ) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let loc = self.bat.locate(offset + pos as u64)?;
            let sectors = self.clip(loc.sector_in_block, buf.len() - pos);
            let len = sectors as usize * SECTOR_SIZE;

            let block_sector = match self.bat.get(loc.block_index)? {
                BatEntry::Allocated(sector) => sector,
                BatEntry::Unallocated => {
                    self.allocate_block(backend, loc.block_index, end_of_data, footer_raw)?
                }
            };

            let phys = self.data_offset(block_sector, loc.sector_in_block);
            trace!(offset = offset + pos as u64, len, phys, "vhd write run");
            backend.write_at(phys, &buf[pos..pos + len])?;

            let bitmap_offset = u64::from(block_sector) * SECTOR_SIZE as u64;
            let bitmap = self
                .bitmaps
                .load(backend, BatEntry::Allocated(block_sector))?
                .ok_or(DiskError::CorruptImage("vhd bitmap missing"))?;
            if let Some(dirty) = bitmap.mark_valid(loc.sector_in_block, sectors) {
                let persisted =
                    backend.write_at(bitmap_offset + dirty.start as u64, &bitmap.as_bytes()[dirty]);
                if let Err(e) = persisted {
                    // Drop the cached copy so the next access sees what is really on disk.
                    self.bitmaps.invalidate(block_sector);
                    return Err(e);
                }
            }

            pos += len;
        }
        Ok(())
    }

    /// Appends a `[bitmap][data]` block at `end_of_data` and points BAT slot `block_index`
    /// at it.
    ///
    /// Order: grow the file, write the fresh bitmap over the old footer, write the footer at
    /// the new end, then persist the BAT entry. A crash before the last step leaks the block
    /// but leaves a valid image.
    fn allocate_block<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        block_index: usize,
        end_of_data: &mut u64,
        footer_raw: &[u8; FOOTER_SIZE],
    ) -> Result<u32> {
        let block_start = *end_of_data;
        let block_sector: u32 = (block_start / SECTOR_SIZE as u64)
            .try_into()
            .map_err(|_| DiskError::Unsupported("vhd block offset out of range"))?;

        let block_span = self
            .bitmap_size
            .checked_add(u64::from(self.header.block_size))
            .ok_or(DiskError::OffsetOverflow)?;
        let new_end = block_start
            .checked_add(block_span)
            .ok_or(DiskError::OffsetOverflow)?;
        let new_len = new_end
            .checked_add(FOOTER_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;

        let bitmap =
            BlockBitmap::new_unwritten(self.bat.sectors_per_block(), self.bitmaps.bitmap_size())?;

        backend.set_len(new_len)?;
        backend.write_at(block_start, bitmap.as_bytes())?;
        backend.write_at(new_end, footer_raw)?;
        self.bat.assign(backend, block_index, block_sector)?;

        *end_of_data = new_end;
        self.bitmaps.insert(block_sector, bitmap);
        debug!(block_index, block_sector, end_of_data = new_end, "vhd block allocated");
        Ok(block_sector)
    }
}

impl<B: StorageBackend> VhdDisk<B> {
    /// Reads sector-aligned data at `offset`.
    ///
    /// Returns how much of `buf` was covered and whether that prefix holds data. Misaligned
    /// requests fail before any backend access.
    pub fn read_aligned(&mut self, offset: u64, buf: &mut [u8]) -> Result<Extent> {
        check_sector_aligned(offset, buf.len())?;
        checked_range(offset, buf.len(), self.virtual_size())?;
        if buf.is_empty() {
            return Ok(Extent::Data(0));
        }

        match &mut self.layout {
            Layout::None => Ok(Extent::Unallocated(buf.len())),
            Layout::Fixed => {
                read_backend(&mut self.backend, offset, buf, "vhd fixed disk truncated")?;
                Ok(Extent::Data(buf.len()))
            }
            Layout::Sparse(sparse) => sparse.read_runs(&mut self.backend, offset, buf),
        }
    }

    /// Writes sector-aligned data at `offset`, allocating blocks as needed.
    pub fn write_aligned(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::AccessDenied);
        }
        check_sector_aligned(offset, buf.len())?;
        checked_range(offset, buf.len(), self.virtual_size())?;
        if buf.is_empty() {
            return Ok(());
        }

        match &mut self.layout {
            Layout::None => Err(DiskError::Unsupported("vhd disk type none has no storage")),
            Layout::Fixed => self.backend.write_at(offset, buf),
            Layout::Sparse(sparse) => sparse.write_blocks(
                &mut self.backend,
                offset,
                buf,
                &mut self.end_of_data,
                &self.footer_raw,
            ),
        }
    }

    /// Reads any byte range, zero-filling unallocated sectors.
    pub fn read_disk(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.virtual_size())?;
        if buf.is_empty() {
            return Ok(());
        }

        let end = offset + buf.len() as u64;
        let start = align_down_u64(offset, SECTOR_SIZE as u64);
        let aligned_end = align_up_u64(end, SECTOR_SIZE as u64)?;
        if start == offset && aligned_end == end {
            return self.read_zero_filled(offset, buf);
        }

        let mut bounce = try_alloc_zeroed((aligned_end - start) as usize)?;
        self.read_zero_filled(start, &mut bounce)?;
        let skip = (offset - start) as usize;
        buf.copy_from_slice(&bounce[skip..skip + buf.len()]);
        Ok(())
    }

    /// Writes any byte range; partial edge sectors are read, patched and written back.
    pub fn write_disk(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::AccessDenied);
        }
        checked_range(offset, buf.len(), self.virtual_size())?;
        if buf.is_empty() {
            return Ok(());
        }

        let end = offset + buf.len() as u64;
        let start = align_down_u64(offset, SECTOR_SIZE as u64);
        let aligned_end = align_up_u64(end, SECTOR_SIZE as u64)?;
        if start == offset && aligned_end == end {
            return self.write_aligned(offset, buf);
        }

        let mut bounce = try_alloc_zeroed((aligned_end - start) as usize)?;
        let head = (offset - start) as usize;
        if head != 0 {
            self.read_zero_filled(start, &mut bounce[..SECTOR_SIZE])?;
        }
        if aligned_end != end {
            let last = bounce.len() - SECTOR_SIZE;
            self.read_zero_filled(aligned_end - SECTOR_SIZE as u64, &mut bounce[last..])?;
        }
        bounce[head..head + buf.len()].copy_from_slice(buf);
        self.write_aligned(start, &bounce)
    }

    fn read_zero_filled(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let extent = self.read_aligned(offset + pos as u64, &mut buf[pos..])?;
            if let Extent::Unallocated(n) = extent {
                buf[pos..pos + n].fill(0);
            }
            if extent.is_empty() {
                return Err(DiskError::CorruptImage("vhd read made no progress"));
            }
            pos += extent.len();
        }
        Ok(())
    }
}
