use std::num::NonZeroUsize;

use vhd_engine::{
    BatEntry, DiskError, DiskType, Extent, MemBackend, Result, StorageBackend, VhdCreateOptions,
    VhdDisk, VhdDynamicHeader, VhdOpenOptions, DYNAMIC_HEADER_SIZE, SECTOR_SIZE,
};

const MIB: u64 = 1024 * 1024;

/// Counts every call that reaches the underlying storage.
#[derive(Default)]
struct CountingBackend {
    inner: MemBackend,
    reads: usize,
    writes: usize,
    resizes: usize,
}

impl CountingBackend {
    fn calls(&self) -> usize {
        self.reads + self.writes + self.resizes
    }
}

impl StorageBackend for CountingBackend {
    fn len(&mut self) -> Result<u64> {
        self.inner.len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.resizes += 1;
        self.inner.set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.reads += 1;
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.writes += 1;
        self.inner.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// Fails the `fail_at`-th write (counting from zero) once; every other call goes through.
struct FlakyBackend {
    inner: MemBackend,
    writes: usize,
    fail_at: usize,
}

impl FlakyBackend {
    fn failing_at(inner: MemBackend, fail_at: usize) -> Self {
        Self {
            inner,
            writes: 0,
            fail_at,
        }
    }
}

impl StorageBackend for FlakyBackend {
    fn len(&mut self) -> Result<u64> {
        self.inner.len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.inner.set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let n = self.writes;
        self.writes += 1;
        if n == self.fail_at {
            return Err(DiskError::Io("injected write failure".to_string()));
        }
        self.inner.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

fn dynamic(size: u64, block_size: u32) -> VhdDisk<MemBackend> {
    VhdDisk::create(
        MemBackend::new(),
        VhdCreateOptions::dynamic(size).with_block_size(block_size),
    )
    .unwrap()
}

#[test]
fn cross_block_write_reads_back_with_zero_surroundings() {
    let mut disk = dynamic(8 * MIB, 2 * MIB as u32);
    disk.write_disk(MIB, &vec![0x5A; 4 * MIB as usize]).unwrap();
    assert_eq!(disk.allocated_blocks(), 3);
    assert_eq!(disk.bat_entry(3), Some(BatEntry::Unallocated));

    let mut all = vec![0xFFu8; 8 * MIB as usize];
    disk.read_disk(0, &mut all).unwrap();
    let (head, rest) = all.split_at(MIB as usize);
    let (middle, tail) = rest.split_at(4 * MIB as usize);
    assert!(head.iter().all(|b| *b == 0));
    assert!(middle.iter().all(|b| *b == 0x5A));
    assert!(tail.iter().all(|b| *b == 0));
}

#[test]
fn every_written_sector_survives_reopen_and_holes_read_zero() {
    let size = 256 * 1024u64;
    let mut disk = dynamic(size, 4096);
    let sectors = size / SECTOR_SIZE as u64;
    for lba in (0..sectors).filter(|lba| lba % 3 != 0) {
        let fill = (lba % 251) as u8 + 1;
        disk.write_aligned(lba * SECTOR_SIZE as u64, &[fill; SECTOR_SIZE])
            .unwrap();
    }
    let backend = disk.close().unwrap();

    let mut disk = VhdDisk::open(backend).unwrap();
    let mut all = vec![0xEEu8; size as usize];
    disk.read_disk(0, &mut all).unwrap();
    for (lba, sector) in all.chunks_exact(SECTOR_SIZE).enumerate() {
        let lba = lba as u64;
        let expected = if lba % 3 == 0 { 0 } else { (lba % 251) as u8 + 1 };
        assert!(
            sector.iter().all(|b| *b == expected),
            "sector {lba} does not hold {expected:#x}"
        );
    }
}

#[test]
fn second_write_to_a_block_does_not_allocate_again() {
    let mut disk = dynamic(MIB, 64 * 1024);
    let start = disk.end_of_data();

    disk.write_aligned(0, &[1; 512]).unwrap();
    let after_first = disk.end_of_data();
    let entry = disk.bat_entry(0);
    assert_eq!(after_first, start + 512 + 64 * 1024);

    disk.write_aligned(8192, &[2; 1024]).unwrap();
    assert_eq!(disk.end_of_data(), after_first);
    assert_eq!(disk.bat_entry(0), entry);
    assert_eq!(disk.allocated_blocks(), 1);
}

#[test]
fn misaligned_requests_fail_without_touching_the_backend() {
    let mut disk = VhdDisk::create(
        CountingBackend::default(),
        VhdCreateOptions::dynamic(MIB).with_block_size(4096),
    )
    .unwrap();
    disk.write_aligned(0, &[9; 4096]).unwrap();
    let before = disk.backend().calls();

    let mut buf = vec![0u8; 1024];
    for (offset, len) in [(100u64, 512usize), (512, 100), (1, 1), (4096, 513)] {
        assert!(matches!(
            disk.read_aligned(offset, &mut buf[..len]).unwrap_err(),
            DiskError::Misaligned { .. }
        ));
        assert!(matches!(
            disk.write_aligned(offset, &buf[..len]).unwrap_err(),
            DiskError::Misaligned { .. }
        ));
    }
    assert_eq!(disk.backend().calls(), before);
}

#[test]
fn aligned_read_reports_extents() {
    let mut disk = dynamic(MIB, 4096);
    disk.write_aligned(4096 + 1024, &[7; 512]).unwrap();

    let mut buf = vec![0u8; 8192];
    assert_eq!(disk.read_aligned(0, &mut buf).unwrap(), Extent::Unallocated(5120));
    let extent = disk.read_aligned(5120, &mut buf).unwrap();
    assert_eq!(extent, Extent::Data(512));
    assert!(extent.is_data());
    assert!(buf[..512].iter().all(|b| *b == 7));
}

#[test]
fn bitmap_bits_follow_written_sectors() {
    let mut disk = dynamic(64 * 1024, 16 * 1024);
    disk.write_disk(510, &[0xAB; 4]).unwrap();

    let BatEntry::Allocated(sector) = disk.bat_entry(0).unwrap() else {
        panic!("block 0 should be allocated");
    };
    let bitmap_offset = sector as usize * SECTOR_SIZE;
    let raw = disk.into_backend().into_vec();
    // Sectors 0 and 1 valid, MSB-first.
    assert_eq!(raw[bitmap_offset], 0xC0);
    assert!(raw[bitmap_offset + 1..bitmap_offset + 4].iter().all(|b| *b == 0));
    // 32 sectors per block: the rest of the bitmap sector is padding.
    assert!(raw[bitmap_offset + 4..bitmap_offset + 512].iter().all(|b| *b == 0xFF));
}

#[test]
fn larger_bitmap_cache_gives_same_results() {
    let disk = dynamic(MIB, 4096);
    let backend = disk.close().unwrap();
    let options = VhdOpenOptions {
        bitmap_cache_blocks: NonZeroUsize::new(4).unwrap(),
        ..VhdOpenOptions::default()
    };
    let mut disk = VhdDisk::open_with(backend, options).unwrap();
    for block in [0u64, 5, 0, 9, 5, 200, 0] {
        let offset = block * 4096 + 512;
        disk.write_aligned(offset, &[block as u8 + 1; 512]).unwrap();
    }
    for block in [0u64, 5, 9, 200] {
        let mut buf = [0u8; 512];
        disk.read_aligned(block * 4096 + 512, &mut buf).unwrap();
        assert_eq!(buf, [block as u8 + 1; 512]);
    }
    assert_eq!(disk.allocated_blocks(), 4);
}

#[test]
fn opened_dynamic_disk_exposes_header() {
    let backend = dynamic(8 * MIB, 2 * MIB as u32).close().unwrap();
    let disk = VhdDisk::open(backend).unwrap();
    assert_eq!(disk.disk_type(), DiskType::Dynamic);
    assert_eq!(disk.block_size(), Some(2 * MIB as u32));
    assert_eq!(disk.block_count(), 4);
    let header = disk.dynamic_header().unwrap();
    assert_eq!(header.table_offset, 1536);
    assert_eq!(header.max_table_entries, 4);
}

fn header_of(raw: &[u8]) -> VhdDynamicHeader {
    let mut bytes = [0u8; DYNAMIC_HEADER_SIZE];
    bytes.copy_from_slice(&raw[512..512 + DYNAMIC_HEADER_SIZE]);
    VhdDynamicHeader::parse(&bytes).unwrap()
}

#[test]
fn bat_entry_pointing_into_metadata_is_rejected() {
    let mut raw = dynamic(64 * 1024, 16 * 1024).into_backend().into_vec();
    let table = header_of(&raw).table_offset as usize;
    raw[table..table + 4].copy_from_slice(&1u32.to_be_bytes());

    let err = VhdDisk::open(MemBackend::from_vec(raw)).err().unwrap();
    assert!(matches!(err, DiskError::CorruptImage("vhd block overlaps metadata")));
}

#[test]
fn bat_entry_overlapping_footer_is_rejected() {
    let mut raw = dynamic(64 * 1024, 16 * 1024).into_backend().into_vec();
    let table = header_of(&raw).table_offset as usize;
    let footer_sector = (raw.len() / SECTOR_SIZE - 1) as u32;
    raw[table..table + 4].copy_from_slice(&footer_sector.to_be_bytes());

    let err = VhdDisk::open(MemBackend::from_vec(raw)).err().unwrap();
    assert!(matches!(err, DiskError::CorruptImage("vhd block overlaps footer")));
}

#[test]
fn absurd_bat_size_is_unsupported() {
    let mut raw = dynamic(64 * 1024, 16 * 1024).into_backend().into_vec();
    let mut header = header_of(&raw);
    header.max_table_entries = u32::MAX;
    raw[512..512 + DYNAMIC_HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());

    let err = VhdDisk::open(MemBackend::from_vec(raw)).err().unwrap();
    assert!(matches!(err, DiskError::Unsupported("vhd bat too large")));
}

#[test]
fn bat_smaller_than_virtual_size_is_rejected() {
    let mut raw = dynamic(64 * 1024, 16 * 1024).into_backend().into_vec();
    let mut header = header_of(&raw);
    header.max_table_entries = 3;
    raw[512..512 + DYNAMIC_HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());

    let err = VhdDisk::open(MemBackend::from_vec(raw)).err().unwrap();
    assert!(matches!(err, DiskError::CorruptImage("vhd bat too small")));
}

#[test]
fn write_past_the_last_block_is_out_of_bounds() {
    let mut disk = dynamic(64 * 1024, 16 * 1024);
    let end = disk.end_of_data();
    assert!(matches!(
        disk.write_aligned(64 * 1024, &[0; 512]).unwrap_err(),
        DiskError::OutOfBounds { .. }
    ));
    assert_eq!(disk.end_of_data(), end);
}

fn empty_8mib_image() -> MemBackend {
    dynamic(8 * MIB, 2 * MIB as u32).close().unwrap()
}

fn assert_zero(bytes: &[u8]) {
    assert!(bytes.iter().all(|b| *b == 0));
}

// A 4 MiB write at 1 MiB touches three 2 MiB blocks. Each allocation issues five writes:
// bitmap, footer, BAT entry, data, bitmap bits.
const WRITES_PER_CROSS_BLOCK_WRITE: usize = 15;

#[test]
fn failed_write_at_any_step_leaves_a_reopenable_image() {
    let payload = vec![0x5A; 4 * MIB as usize];
    let mut all = vec![0u8; 8 * MIB as usize];
    for fail_at in 0..WRITES_PER_CROSS_BLOCK_WRITE {
        let backend = FlakyBackend::failing_at(empty_8mib_image(), fail_at);
        let mut disk = VhdDisk::open(backend).unwrap();
        let err = disk.write_disk(MIB, &payload).unwrap_err();
        assert!(matches!(err, DiskError::Io(_)), "write #{fail_at}: {err}");

        let mut disk = VhdDisk::open(disk.into_backend().inner).unwrap();
        disk.read_disk(0, &mut all).unwrap();
        assert!(
            all.iter().all(|b| *b == 0 || *b == 0x5A),
            "write #{fail_at} left foreign bytes"
        );
        assert_zero(&all[..MIB as usize]);
        assert_zero(&all[5 * MIB as usize..]);

        disk.write_disk(MIB, &payload).unwrap();
        let mut disk = VhdDisk::open(disk.close().unwrap()).unwrap();
        disk.read_disk(0, &mut all).unwrap();
        assert_zero(&all[..MIB as usize]);
        assert!(all[MIB as usize..5 * MIB as usize].iter().all(|b| *b == 0x5A));
        assert_zero(&all[5 * MIB as usize..]);
    }
}

#[test]
fn runs_finished_before_a_failure_stay_committed() {
    // Write #5 is the fresh bitmap of the second block.
    let backend = FlakyBackend::failing_at(empty_8mib_image(), 5);
    let mut disk = VhdDisk::open(backend).unwrap();
    let err = disk.write_disk(MIB, &vec![0x5A; 4 * MIB as usize]).unwrap_err();
    assert!(matches!(err, DiskError::Io(_)));

    let mut disk = VhdDisk::open(disk.into_backend().inner).unwrap();
    assert_eq!(disk.allocated_blocks(), 1);
    let mut all = vec![0u8; 8 * MIB as usize];
    disk.read_disk(0, &mut all).unwrap();
    assert_zero(&all[..MIB as usize]);
    assert!(all[MIB as usize..2 * MIB as usize].iter().all(|b| *b == 0x5A));
    assert_zero(&all[2 * MIB as usize..]);
}

#[test]
fn failed_bitmap_update_does_not_expose_unwritten_sectors() {
    // Write #4 sets the bitmap bits of the first block, after its data landed.
    let backend = FlakyBackend::failing_at(empty_8mib_image(), 4);
    let mut disk = VhdDisk::open(backend).unwrap();
    let payload = vec![0x5A; 4 * MIB as usize];
    let err = disk.write_disk(MIB, &payload).unwrap_err();
    assert!(matches!(err, DiskError::Io(_)));
    assert_eq!(disk.allocated_blocks(), 1);

    let mut buf = vec![0xFFu8; MIB as usize];
    assert_eq!(
        disk.read_aligned(MIB, &mut buf).unwrap(),
        Extent::Unallocated(MIB as usize)
    );

    disk.write_disk(MIB, &payload).unwrap();
    assert_eq!(disk.allocated_blocks(), 3);
    let mut back = vec![0u8; payload.len()];
    disk.read_disk(MIB, &mut back).unwrap();
    assert_eq!(back, payload);
}
