//! Virtual Hard Disk (VHD) image engine.
//!
//! Reads and writes the VHD container used by Virtual PC, Hyper-V, QEMU and VirtualBox on top
//! of any byte-addressed [`StorageBackend`]:
//!
//! - [`VhdDisk`]: create/open/flush/close plus aligned and unaligned I/O for fixed and
//!   dynamic disks (differencing disks can be created and probed)
//! - [`VhdFooter`] / [`VhdDynamicHeader`]: big-endian codecs for the on-disk structures
//! - [`chs_geometry`]: the CHS geometry stored in every footer
//! - [`Bat`] / [`BitmapCache`]: block allocation table and per-block sector bitmaps
//!
//! Aligned reads report unallocated ranges as [`Extent::Unallocated`] instead of filling
//! them, so a differencing layer can consult a parent. [`VhdDisk::read_disk`] zero-fills.
//!
//! The engine is synchronous and owns no threads; a [`VhdDisk`] must be driven by one caller
//! at a time.

mod backend;
mod bat;
mod bitmap;
mod checksum;
mod disk;
mod error;
mod footer;
mod geometry;
mod header;
mod io;
mod util;
mod vhd;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use bat::{Bat, BatEntry, SectorLocation, BAT_ENTRY_UNALLOCATED, MAX_BAT_BYTES};
pub use bitmap::{BitmapCache, BlockBitmap, MAX_BITMAP_BYTES};
pub use checksum::{checksum_accumulate, vhd_checksum};
pub use disk::{VirtualDisk, SECTOR_SIZE};
pub use error::{DiskError, Result};
pub use footer::{
    verify_footer, vhd_timestamp, DiskType, VhdFooter, FOOTER_SIZE, NO_DATA_OFFSET,
    VHD_EPOCH_UNIX_SECS, VHD_FEATURES_RESERVED, VHD_FOOTER_COOKIE, VHD_VERSION_1_0,
    VHD_VERSION_5_0,
};
pub use geometry::{chs_geometry, ChsGeometry, VHD_MAX_GEOMETRY};
pub use header::{
    platform, ParentLocatorEntry, VhdDynamicHeader, DYNAMIC_HEADER_SIZE, PARENT_LOCATOR_COUNT,
    PARENT_NAME_UNITS, VHD_DYNAMIC_COOKIE, VHD_DYNAMIC_HEADER_VERSION,
};
pub use io::Extent;
pub use uuid::Uuid;
pub use vhd::{
    looks_like_vhd, FooterSource, ParentInfo, ParentLocator, VhdCreateOptions, VhdDisk,
    VhdImageInfo, VhdOpenOptions, DEFAULT_BLOCK_SIZE, DEFAULT_CREATOR_APP, DEFAULT_CREATOR_OS,
    DEFAULT_CREATOR_VERSION,
};

#[cfg(test)]
mod proptests;
