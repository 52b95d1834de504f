use std::num::NonZeroUsize;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bat::{Bat, BatEntry, MAX_BAT_BYTES};
use crate::bitmap::BitmapCache;
use crate::footer::{
    DiskType, VhdFooter, FOOTER_SIZE, NO_DATA_OFFSET, VHD_FEATURES_RESERVED, VHD_VERSION_1_0,
};
use crate::geometry::{chs_geometry, ChsGeometry};
use crate::header::{
    ParentLocatorEntry, VhdDynamicHeader, DYNAMIC_HEADER_SIZE, PARENT_LOCATOR_COUNT,
};
use crate::util::{align_down_u64, align_up_u64, div_ceil_u64};
use crate::{DiskError, Result, StorageBackend, VirtualDisk, SECTOR_SIZE};

pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;
pub const DEFAULT_CREATOR_APP: [u8; 4] = *b"vhde";
pub const DEFAULT_CREATOR_VERSION: u32 = 0x000A_0000;
pub const DEFAULT_CREATOR_OS: [u8; 4] = *b"Wi2k";

const DYNAMIC_HEADER_OFFSET: u64 = FOOTER_SIZE as u64;
const BAT_OFFSET: u64 = DYNAMIC_HEADER_OFFSET + DYNAMIC_HEADER_SIZE as u64;

/// A parent locator to embed in a new differencing disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentLocator {
    /// One of the codes in [`crate::platform`].
    pub platform_code: [u8; 4],
    /// Raw payload, already encoded for the platform (e.g. UTF-16LE path for `W2ku`).
    pub data: Vec<u8>,
}

/// Identity of the parent image recorded in a differencing disk's dynamic header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentInfo {
    pub unique_id: Uuid,
    pub timestamp: u32,
    pub name: String,
    pub locators: Vec<ParentLocator>,
}

/// Parameters for [`VhdDisk::create`].
#[derive(Clone, Debug)]
pub struct VhdCreateOptions {
    pub disk_type: DiskType,
    /// Virtual disk size in bytes; must be a non-zero multiple of 512.
    pub virtual_size: u64,
    /// Dynamic/differencing block size; ignored for fixed disks.
    pub block_size: u32,
    pub sector_size: u32,
    /// Truncate the backend to zero before laying out the image.
    pub wipe_out: bool,
    /// `None` stores the zero GUID.
    pub unique_id: Option<Uuid>,
    /// Seconds since 2000-01-01 UTC; see [`crate::vhd_timestamp`].
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: [u8; 4],
    pub parent: Option<ParentInfo>,
}

impl VhdCreateOptions {
    fn new(disk_type: DiskType, virtual_size: u64) -> Self {
        Self {
            disk_type,
            virtual_size,
            block_size: DEFAULT_BLOCK_SIZE,
            sector_size: SECTOR_SIZE as u32,
            wipe_out: false,
            unique_id: None,
            timestamp: 0,
            creator_app: DEFAULT_CREATOR_APP,
            creator_version: DEFAULT_CREATOR_VERSION,
            creator_os: DEFAULT_CREATOR_OS,
            parent: None,
        }
    }

    pub fn fixed(virtual_size: u64) -> Self {
        Self::new(DiskType::Fixed, virtual_size)
    }

    pub fn dynamic(virtual_size: u64) -> Self {
        Self::new(DiskType::Dynamic, virtual_size)
    }

    pub fn differencing(virtual_size: u64, parent: ParentInfo) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(DiskType::Differencing, virtual_size)
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_unique_id(mut self, unique_id: Uuid) -> Self {
        self.unique_id = Some(unique_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_wipe_out(mut self, wipe_out: bool) -> Self {
        self.wipe_out = wipe_out;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.sector_size as usize != SECTOR_SIZE {
            return Err(DiskError::InvalidConfig("sector size must be 512"));
        }
        if self.virtual_size == 0 {
            return Err(DiskError::InvalidConfig("virtual size must be non-zero"));
        }
        if !self.virtual_size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::InvalidConfig(
                "virtual size must be a multiple of 512",
            ));
        }
        match (self.disk_type, &self.parent) {
            (DiskType::None, _) => Err(DiskError::InvalidConfig(
                "cannot create a disk of type none",
            )),
            (DiskType::Differencing, None) => Err(DiskError::InvalidConfig(
                "differencing disk requires parent info",
            )),
            (DiskType::Fixed | DiskType::Dynamic, Some(_)) => Err(DiskError::InvalidConfig(
                "parent info is only valid for differencing disks",
            )),
            _ => Ok(()),
        }
    }
}

/// Parameters for [`VhdDisk::open_with`].
#[derive(Clone, Copy, Debug)]
pub struct VhdOpenOptions {
    pub read_only: bool,
    /// Number of block bitmaps kept in memory.
    pub bitmap_cache_blocks: NonZeroUsize,
}

impl Default for VhdOpenOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            bitmap_cache_blocks: NonZeroUsize::MIN,
        }
    }
}

/// Which copy of the footer an image was described from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FooterSource {
    Trailing,
    /// The trailing copy was invalid; the copy at offset 0 was used.
    HeaderCopy,
}

/// Result of [`VhdDisk::probe`].
#[derive(Clone, Debug)]
pub struct VhdImageInfo {
    pub footer: VhdFooter,
    pub footer_source: FooterSource,
    pub dynamic_header: Option<VhdDynamicHeader>,
    pub file_len: u64,
}

pub(crate) struct SparseLayout {
    pub(crate) header: VhdDynamicHeader,
    pub(crate) bat: Bat,
    pub(crate) bitmaps: BitmapCache,
    pub(crate) bitmap_size: u64,
}

pub(crate) enum Layout {
    None,
    Fixed,
    Sparse(SparseLayout),
}

/// An open VHD image (fixed, dynamic or a freshly created differencing disk).
///
/// Owns its bitmap cache and BAT. Every operation that touches the image takes `&mut self`,
/// so sharing a disk between threads needs a lock such as `Mutex`.
pub struct VhdDisk<B> {
    pub(crate) backend: B,
    footer: VhdFooter,
    pub(crate) footer_raw: [u8; FOOTER_SIZE],
    pub(crate) layout: Layout,
    /// File offset of the trailing footer.
    pub(crate) end_of_data: u64,
    pub(crate) read_only: bool,
}

struct LocatedFooter {
    footer: VhdFooter,
    raw: [u8; FOOTER_SIZE],
    source: FooterSource,
    trailing_offset: u64,
}

/// Offset and length of the trailing footer. Some tools write a 511-byte footer; such files
/// end one byte short of a sector boundary.
fn trailing_footer_span(len: u64) -> Result<(u64, usize)> {
    if len % SECTOR_SIZE as u64 == FOOTER_SIZE as u64 - 1 {
        return Ok((len - (FOOTER_SIZE as u64 - 1), FOOTER_SIZE - 1));
    }
    let aligned = align_down_u64(len, SECTOR_SIZE as u64);
    if aligned < FOOTER_SIZE as u64 {
        return Err(DiskError::CorruptImage("vhd file too small"));
    }
    Ok((aligned - FOOTER_SIZE as u64, FOOTER_SIZE))
}

fn read_footer<B: StorageBackend>(backend: &mut B, len: u64) -> Result<LocatedFooter> {
    let (trailing_offset, span) = trailing_footer_span(len)?;
    let mut raw = [0u8; FOOTER_SIZE];
    backend.read_at(trailing_offset, &mut raw[..span])?;

    let err = match VhdFooter::parse(&raw) {
        Ok(footer) => {
            return Ok(LocatedFooter {
                footer,
                raw,
                source: FooterSource::Trailing,
                trailing_offset,
            })
        }
        Err(err) => err,
    };

    warn!(
        error = %err,
        offset = trailing_offset,
        "vhd trailing footer invalid, trying the copy at offset 0"
    );
    let mut copy = [0u8; FOOTER_SIZE];
    match backend.read_at(0, &mut copy) {
        Ok(()) => {}
        // Shorter than one sector: there is no copy to fall back to.
        Err(DiskError::OutOfBounds { .. }) => return Err(err),
        Err(e) => return Err(e),
    }
    match VhdFooter::parse(&copy) {
        // Fixed disks have no copy at offset 0; a footer there would be guest data.
        Ok(footer) if footer.disk_type.is_sparse() => Ok(LocatedFooter {
            footer,
            raw: copy,
            source: FooterSource::HeaderCopy,
            trailing_offset,
        }),
        _ => Err(err),
    }
}

fn read_dynamic_header<B: StorageBackend>(
    backend: &mut B,
    footer: &VhdFooter,
    end_of_data: u64,
) -> Result<VhdDynamicHeader> {
    let header_offset = footer.data_offset;
    if header_offset == NO_DATA_OFFSET {
        return Err(DiskError::CorruptImage("vhd dynamic header offset invalid"));
    }
    if !header_offset.is_multiple_of(SECTOR_SIZE as u64) {
        return Err(DiskError::CorruptImage(
            "vhd dynamic header offset misaligned",
        ));
    }
    if header_offset < FOOTER_SIZE as u64 {
        return Err(DiskError::CorruptImage(
            "vhd dynamic header overlaps footer copy",
        ));
    }
    let header_end = header_offset
        .checked_add(DYNAMIC_HEADER_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if header_end > end_of_data {
        return Err(DiskError::CorruptImage("vhd dynamic header truncated"));
    }

    let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
    backend.read_at(header_offset, &mut raw)?;
    VhdDynamicHeader::parse(&raw)
}

impl<B: StorageBackend> VhdDisk<B> {
    /// Lays out a new image on `backend` and returns it open for writing.
    pub fn create(mut backend: B, options: VhdCreateOptions) -> Result<Self> {
        options.validate()?;
        let size = options.virtual_size;

        let mut footer = VhdFooter {
            features: VHD_FEATURES_RESERVED,
            version: VHD_VERSION_1_0,
            data_offset: if options.disk_type.is_sparse() {
                DYNAMIC_HEADER_OFFSET
            } else {
                NO_DATA_OFFSET
            },
            timestamp: options.timestamp,
            creator_app: options.creator_app,
            creator_version: options.creator_version,
            creator_os: options.creator_os,
            original_size: size,
            current_size: size,
            geometry: chs_geometry(size),
            disk_type: options.disk_type,
            checksum: 0,
            unique_id: options.unique_id.unwrap_or(Uuid::nil()),
            saved_state: false,
        };
        let footer_raw = footer.seal();

        if options.wipe_out {
            backend.set_len(0)?;
        }

        let (layout, end_of_data) = if options.disk_type.is_sparse() {
            let (sparse, end_of_data) = Self::create_sparse(&mut backend, &options, &footer_raw)?;
            (Layout::Sparse(sparse), end_of_data)
        } else {
            let file_len = size
                .checked_add(FOOTER_SIZE as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            backend.set_len(file_len)?;
            backend.write_at(size, &footer_raw)?;
            (Layout::Fixed, size)
        };

        debug!(
            disk_type = footer.disk_type.name(),
            virtual_size = size,
            block_size = options.block_size,
            end_of_data,
            "vhd created"
        );

        Ok(Self {
            backend,
            footer,
            footer_raw,
            layout,
            end_of_data,
            read_only: false,
        })
    }

    /// Writes footer copy, dynamic header, BAT, parent locator payloads and trailing footer.
    /// Returns the layout and the offset of the trailing footer.
    fn create_sparse(
        backend: &mut B,
        options: &VhdCreateOptions,
        footer_raw: &[u8; FOOTER_SIZE],
    ) -> Result<(SparseLayout, u64)> {
        let block_size = options.block_size;
        if !block_size.is_power_of_two() || (block_size as usize) < SECTOR_SIZE {
            return Err(DiskError::InvalidConfig(
                "block size must be a power of two of at least 512 bytes",
            ));
        }
        let entries: u32 = div_ceil_u64(options.virtual_size, u64::from(block_size))?
            .try_into()
            .map_err(|_| DiskError::InvalidConfig("virtual size needs too many blocks"))?;
        if u64::from(entries) * 4 > MAX_BAT_BYTES {
            return Err(DiskError::InvalidConfig("virtual size needs too many blocks"));
        }

        let mut header = VhdDynamicHeader::new(BAT_OFFSET, entries, block_size);
        let spb = header.sectors_per_block();
        let bat = Bat::new_unallocated(BAT_OFFSET, entries, spb)?;
        let bat_raw = bat.to_bytes()?;

        let mut cursor = BAT_OFFSET + bat_raw.len() as u64;
        let mut payloads: Vec<(u64, &[u8])> = Vec::new();
        if let Some(parent) = &options.parent {
            if parent.locators.len() > PARENT_LOCATOR_COUNT {
                return Err(DiskError::InvalidConfig("at most 8 parent locators"));
            }
            header.parent_unique_id = parent.unique_id;
            header.parent_timestamp = parent.timestamp;
            header.parent_name = parent.name.clone();
            for (slot, locator) in header.parent_locators.iter_mut().zip(&parent.locators) {
                let data_length: u32 = locator
                    .data
                    .len()
                    .try_into()
                    .map_err(|_| DiskError::InvalidConfig("parent locator too large"))?;
                let space = align_up_u64(u64::from(data_length), SECTOR_SIZE as u64)?;
                *slot = ParentLocatorEntry {
                    platform_code: locator.platform_code,
                    data_space: (space / SECTOR_SIZE as u64) as u32,
                    data_length,
                    data_offset: cursor,
                };
                payloads.push((cursor, locator.data.as_slice()));
                cursor = cursor.checked_add(space).ok_or(DiskError::OffsetOverflow)?;
            }
        }

        let header_raw = header.to_bytes()?;
        let header = VhdDynamicHeader::parse(&header_raw)?;
        let end_of_data = cursor;

        backend.set_len(end_of_data + FOOTER_SIZE as u64)?;
        backend.write_at(0, footer_raw)?;
        backend.write_at(DYNAMIC_HEADER_OFFSET, &header_raw)?;
        backend.write_at(BAT_OFFSET, &bat_raw)?;
        for (offset, data) in payloads {
            backend.write_at(offset, data)?;
        }
        backend.write_at(end_of_data, footer_raw)?;

        let bitmap_size = header.bitmap_size();
        let bitmaps = BitmapCache::new(NonZeroUsize::MIN, spb, bitmap_size)?;
        Ok((
            SparseLayout {
                header,
                bat,
                bitmaps,
                bitmap_size,
            },
            end_of_data,
        ))
    }

    pub fn open(backend: B) -> Result<Self> {
        Self::open_with(backend, VhdOpenOptions::default())
    }

    /// Opens an existing image, falling back to the footer copy at offset 0 when the trailing
    /// footer is damaged. A footer with the saved-state flag forces read-only access.
    pub fn open_with(mut backend: B, options: VhdOpenOptions) -> Result<Self> {
        let len = backend.len()?;
        let located = read_footer(&mut backend, len)?;
        let footer = located.footer;
        let end_of_data = located.trailing_offset;
        if !footer.current_size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::CorruptImage("vhd current_size misaligned"));
        }

        let layout = match footer.disk_type {
            DiskType::None => Layout::None,
            DiskType::Fixed => {
                if footer.current_size > end_of_data {
                    return Err(DiskError::CorruptImage("vhd fixed disk truncated"));
                }
                Layout::Fixed
            }
            DiskType::Dynamic => {
                if located.source == FooterSource::Trailing {
                    let mut copy = [0u8; FOOTER_SIZE];
                    backend.read_at(0, &mut copy)?;
                    if copy != located.raw {
                        warn!("vhd footer copy at offset 0 differs from the trailing footer");
                    }
                }
                Layout::Sparse(Self::open_dynamic(
                    &mut backend,
                    &footer,
                    end_of_data,
                    options.bitmap_cache_blocks,
                )?)
            }
            DiskType::Differencing => {
                return Err(DiskError::Unsupported("vhd differencing disk open"));
            }
        };

        let read_only = options.read_only || footer.saved_state;
        debug!(
            disk_type = footer.disk_type.name(),
            virtual_size = footer.current_size,
            end_of_data,
            read_only,
            "vhd opened"
        );

        Ok(Self {
            backend,
            footer,
            footer_raw: located.raw,
            layout,
            end_of_data,
            read_only,
        })
    }

    /// Loads and validates the dynamic header and BAT.
    fn open_dynamic(
        backend: &mut B,
        footer: &VhdFooter,
        end_of_data: u64,
        cache_blocks: NonZeroUsize,
    ) -> Result<SparseLayout> {
        let header = read_dynamic_header(backend, footer, end_of_data)?;
        let header_offset = footer.data_offset;
        let header_end = header_offset + DYNAMIC_HEADER_SIZE as u64;
        let block_size = u64::from(header.block_size);

        let required_entries = div_ceil_u64(footer.current_size, block_size)?;
        if u64::from(header.max_table_entries) < required_entries {
            return Err(DiskError::CorruptImage("vhd bat too small"));
        }

        // The whole advertised table must fit in the metadata region even though only the
        // entries covering the virtual size are read.
        let table_bytes = align_up_u64(
            u64::from(header.max_table_entries) * 4,
            SECTOR_SIZE as u64,
        )?;
        if table_bytes > MAX_BAT_BYTES {
            return Err(DiskError::Unsupported("vhd bat too large"));
        }
        let table_offset = header.table_offset;
        let table_end = table_offset
            .checked_add(table_bytes)
            .ok_or(DiskError::OffsetOverflow)?;
        if table_offset < FOOTER_SIZE as u64 {
            return Err(DiskError::CorruptImage("vhd bat overlaps footer copy"));
        }
        if table_end > end_of_data {
            return Err(DiskError::CorruptImage("vhd bat truncated"));
        }
        if table_offset < header_end && header_offset < table_end {
            return Err(DiskError::CorruptImage("vhd bat overlaps dynamic header"));
        }

        let spb = header.sectors_per_block();
        let bat = Bat::load(backend, table_offset, required_entries as u32, spb)?;

        let bitmap_size = header.bitmap_size();
        let data_start = header_end.max(table_end);
        let block_span = bitmap_size + block_size;
        for entry in bat.entries() {
            let BatEntry::Allocated(sector) = *entry else {
                continue;
            };
            let start = u64::from(sector) * SECTOR_SIZE as u64;
            if start < data_start {
                return Err(DiskError::CorruptImage("vhd block overlaps metadata"));
            }
            if start + block_span > end_of_data {
                return Err(DiskError::CorruptImage("vhd block overlaps footer"));
            }
        }

        let bitmaps = BitmapCache::new(cache_blocks, spb, bitmap_size)?;
        Ok(SparseLayout {
            header,
            bat,
            bitmaps,
            bitmap_size,
        })
    }

    /// Reads the footer (and dynamic header) without loading the BAT. Works for every disk
    /// type, including differencing disks that [`VhdDisk::open`] refuses.
    pub fn probe(backend: &mut B) -> Result<VhdImageInfo> {
        let file_len = backend.len()?;
        let located = read_footer(backend, file_len)?;
        let dynamic_header = if located.footer.disk_type.is_sparse() {
            Some(read_dynamic_header(
                backend,
                &located.footer,
                located.trailing_offset,
            )?)
        } else {
            None
        };
        Ok(VhdImageInfo {
            footer: located.footer,
            footer_source: located.source,
            dynamic_header,
            file_len,
        })
    }

    /// No-op on read-only disks.
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.backend.flush()
    }

    /// Flushes and hands the backend back to the caller.
    pub fn close(mut self) -> Result<B> {
        self.flush()?;
        Ok(self.backend)
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn virtual_size(&self) -> u64 {
        self.footer.current_size
    }

    /// End of data plus the trailing footer.
    pub fn file_size(&self) -> u64 {
        self.end_of_data + FOOTER_SIZE as u64
    }

    pub fn end_of_data(&self) -> u64 {
        self.end_of_data
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    pub fn dynamic_header(&self) -> Option<&VhdDynamicHeader> {
        match &self.layout {
            Layout::Sparse(sparse) => Some(&sparse.header),
            _ => None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn geometry(&self) -> ChsGeometry {
        self.footer.geometry
    }

    pub fn block_size(&self) -> Option<u32> {
        self.dynamic_header().map(|h| h.block_size)
    }

    /// BAT slots covering the virtual size (0 for fixed disks).
    pub fn block_count(&self) -> usize {
        match &self.layout {
            Layout::Sparse(sparse) => sparse.bat.len(),
            _ => 0,
        }
    }

    pub fn allocated_blocks(&self) -> usize {
        match &self.layout {
            Layout::Sparse(sparse) => sparse.bat.allocated_count(),
            _ => 0,
        }
    }

    pub fn bat_entry(&self, block_index: usize) -> Option<BatEntry> {
        match &self.layout {
            Layout::Sparse(sparse) => sparse.bat.entries().get(block_index).copied(),
            _ => None,
        }
    }

    pub fn compact(&mut self) -> Result<()> {
        Err(DiskError::Unsupported("vhd compact"))
    }

    pub fn expand(&mut self, _new_size: u64) -> Result<()> {
        Err(DiskError::Unsupported("vhd expand"))
    }

    pub fn repair(&mut self) -> Result<()> {
        Err(DiskError::Unsupported("vhd repair"))
    }

    pub fn merge(&mut self) -> Result<()> {
        Err(DiskError::Unsupported("vhd merge"))
    }
}

/// Cheap format sniff: true if either footer copy parses.
pub fn looks_like_vhd<B: StorageBackend>(backend: &mut B) -> Result<bool> {
    let len = backend.len()?;
    if len < FOOTER_SIZE as u64 - 1 {
        return Ok(false);
    }
    match read_footer(backend, len) {
        Ok(_) => Ok(true),
        Err(DiskError::CorruptImage(_) | DiskError::OutOfBounds { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

impl<B: StorageBackend> VirtualDisk for VhdDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.virtual_size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.read_disk(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.write_disk(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        VhdDisk::flush(self)
    }
}
