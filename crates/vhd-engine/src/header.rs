use std::ops::Range;

use uuid::Uuid;

use crate::checksum::{stamp_checksum, stored_checksum, vhd_checksum};
use crate::footer::NO_DATA_OFFSET;
use crate::util::{be_u32, be_u64, put_be_u32, put_be_u64};
use crate::{DiskError, Result, SECTOR_SIZE};

pub const DYNAMIC_HEADER_SIZE: usize = 1024;
pub const VHD_DYNAMIC_COOKIE: [u8; 8] = *b"cxsparse";
pub const VHD_DYNAMIC_HEADER_VERSION: u32 = 0x0001_0000;

/// Number of UTF-16 code units reserved for the parent's name.
pub const PARENT_NAME_UNITS: usize = 256;
pub const PARENT_LOCATOR_COUNT: usize = 8;

const CHECKSUM_FIELD: Range<usize> = 36..40;
const PARENT_NAME_OFFSET: usize = 64;
const PARENT_LOCATORS_OFFSET: usize = 576;
const PARENT_LOCATOR_SIZE: usize = 24;

/// Well-known parent locator platform codes.
pub mod platform {
    /// Absolute path, UTF-16LE.
    pub const W2KU: [u8; 4] = *b"W2ku";
    /// Path relative to the child image, UTF-16LE.
    pub const W2RU: [u8; 4] = *b"W2ru";
    /// Deprecated ANSI relative path.
    pub const WI2R: [u8; 4] = *b"Wi2r";
    /// Deprecated ANSI absolute path.
    pub const WI2K: [u8; 4] = *b"Wi2k";
    pub const MAC: [u8; 4] = *b"Mac ";
    /// File URL, UTF-8.
    pub const MACX: [u8; 4] = *b"MacX";
}

/// One of the eight parent locator slots of a differencing disk's header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParentLocatorEntry {
    pub platform_code: [u8; 4],
    /// Sectors reserved for the locator payload.
    pub data_space: u32,
    /// Bytes of payload actually used.
    pub data_length: u32,
    /// Absolute file offset of the payload.
    pub data_offset: u64,
}

impl ParentLocatorEntry {
    pub fn is_empty(&self) -> bool {
        self.platform_code == [0; 4]
    }
}

/// The 1024-byte dynamic disk header that follows the footer copy on sparse images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VhdDynamicHeader {
    pub data_offset: u64,
    pub table_offset: u64,
    pub version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_unique_id: Uuid,
    pub parent_timestamp: u32,
    pub parent_name: String,
    pub parent_locators: [ParentLocatorEntry; PARENT_LOCATOR_COUNT],
}

impl VhdDynamicHeader {
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        Self {
            data_offset: NO_DATA_OFFSET,
            table_offset,
            version: VHD_DYNAMIC_HEADER_VERSION,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_unique_id: Uuid::nil(),
            parent_timestamp: 0,
            parent_name: String::new(),
            parent_locators: [ParentLocatorEntry::default(); PARENT_LOCATOR_COUNT],
        }
    }

    pub fn parse(raw: &[u8; DYNAMIC_HEADER_SIZE]) -> Result<Self> {
        if raw[..8] != VHD_DYNAMIC_COOKIE {
            return Err(DiskError::CorruptImage(
                "vhd dynamic header cookie mismatch",
            ));
        }

        let checksum = stored_checksum(raw, CHECKSUM_FIELD);
        if checksum != vhd_checksum(raw, CHECKSUM_FIELD) {
            return Err(DiskError::CorruptImage(
                "vhd dynamic header checksum mismatch",
            ));
        }

        // Chained headers were never defined; the field must hold the sentinel.
        let data_offset = be_u64(&raw[8..16]);
        if data_offset != NO_DATA_OFFSET {
            return Err(DiskError::CorruptImage(
                "vhd dynamic header data_offset invalid",
            ));
        }

        let version = be_u32(&raw[24..28]);
        if version != VHD_DYNAMIC_HEADER_VERSION {
            return Err(DiskError::CorruptImage(
                "vhd dynamic header version unsupported",
            ));
        }

        let table_offset = be_u64(&raw[16..24]);
        let max_table_entries = be_u32(&raw[28..32]);
        let block_size = be_u32(&raw[32..36]);

        if !table_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::CorruptImage("vhd bat offset misaligned"));
        }
        if max_table_entries == 0 {
            return Err(DiskError::CorruptImage("vhd max_table_entries is zero"));
        }
        if !block_size.is_power_of_two() || (block_size as usize) < SECTOR_SIZE {
            return Err(DiskError::CorruptImage("vhd block_size invalid"));
        }

        let mut parent_unique_id = [0u8; 16];
        parent_unique_id.copy_from_slice(&raw[40..56]);

        let mut parent_locators = [ParentLocatorEntry::default(); PARENT_LOCATOR_COUNT];
        for (i, entry) in parent_locators.iter_mut().enumerate() {
            let base = PARENT_LOCATORS_OFFSET + i * PARENT_LOCATOR_SIZE;
            *entry = ParentLocatorEntry {
                platform_code: [raw[base], raw[base + 1], raw[base + 2], raw[base + 3]],
                data_space: be_u32(&raw[base + 4..base + 8]),
                data_length: be_u32(&raw[base + 8..base + 12]),
                data_offset: be_u64(&raw[base + 16..base + 24]),
            };
        }

        Ok(Self {
            data_offset,
            table_offset,
            version,
            max_table_entries,
            block_size,
            checksum,
            parent_unique_id: Uuid::from_bytes(parent_unique_id),
            parent_timestamp: be_u32(&raw[56..60]),
            parent_name: decode_parent_name(
                &raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_UNITS * 2],
            ),
            parent_locators,
        })
    }

    /// Encodes the header, recomputing its checksum.
    pub fn to_bytes(&self) -> Result<[u8; DYNAMIC_HEADER_SIZE]> {
        let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
        raw[..8].copy_from_slice(&VHD_DYNAMIC_COOKIE);
        put_be_u64(&mut raw, 8, self.data_offset);
        put_be_u64(&mut raw, 16, self.table_offset);
        put_be_u32(&mut raw, 24, self.version);
        put_be_u32(&mut raw, 28, self.max_table_entries);
        put_be_u32(&mut raw, 32, self.block_size);
        raw[40..56].copy_from_slice(self.parent_unique_id.as_bytes());
        put_be_u32(&mut raw, 56, self.parent_timestamp);
        encode_parent_name(
            &self.parent_name,
            &mut raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_UNITS * 2],
        )?;
        for (i, entry) in self.parent_locators.iter().enumerate() {
            let base = PARENT_LOCATORS_OFFSET + i * PARENT_LOCATOR_SIZE;
            raw[base..base + 4].copy_from_slice(&entry.platform_code);
            put_be_u32(&mut raw, base + 4, entry.data_space);
            put_be_u32(&mut raw, base + 8, entry.data_length);
            put_be_u64(&mut raw, base + 16, entry.data_offset);
        }
        stamp_checksum(&mut raw, CHECKSUM_FIELD);
        Ok(raw)
    }

    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / SECTOR_SIZE as u32
    }

    /// Size of the per-block sector bitmap, padded to whole sectors.
    pub fn bitmap_size(&self) -> u64 {
        let bitmap_bytes = u64::from(self.sectors_per_block()).div_ceil(8);
        bitmap_bytes.div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64
    }
}

/// The parent name is UTF-16 big-endian, NUL padded.
fn decode_parent_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn encode_parent_name(name: &str, out: &mut [u8]) -> Result<()> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > PARENT_NAME_UNITS {
        return Err(DiskError::InvalidConfig(
            "parent name exceeds 256 UTF-16 code units",
        ));
    }
    for (i, unit) in units.iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
    }
    Ok(())
}
