use std::num::NonZeroUsize;

use crate::checksum::stamp_checksum;
use crate::{
    chs_geometry, vhd_checksum, MemBackend, VhdCreateOptions, VhdDisk, VhdOpenOptions,
    VirtualDisk, SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Flush,
    Reopen,
}

const MAX_DISK_SIZE: u32 = 1024 * 1024; // 1 MiB
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 8 * 1024;

const SECTOR_SIZE_U32: u32 = SECTOR_SIZE as u32;
const MAX_DISK_SECTORS: u32 = MAX_DISK_SIZE / SECTOR_SIZE_U32;

fn disk_size_strategy() -> impl Strategy<Value = u32> {
    (1u32..=MAX_DISK_SECTORS).prop_map(|sectors| sectors * SECTOR_SIZE_U32)
}

fn block_size_strategy() -> impl Strategy<Value = u32> {
    // Small blocks so a 1 MiB disk spans many of them.
    prop_oneof![
        Just(512u32),
        Just(4096u32),
        Just(16 * 1024u32),
        Just(64 * 1024u32),
    ]
}

fn cache_blocks_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), Just(3usize)]
}

fn offset_strategy(disk_size: u32) -> BoxedStrategy<u32> {
    let max_offset = disk_size;

    let any = 0u32..=max_offset;
    let sector_aligned =
        (0u32..=max_offset / SECTOR_SIZE_U32).prop_map(|lba| lba * SECTOR_SIZE_U32);
    let block_straddle = (1u32..=max_offset / 4096 + 1, 1u32..SECTOR_SIZE_U32).prop_map(
        move |(blk, delta)| (blk * 4096).saturating_sub(delta).min(max_offset),
    );
    let near_end =
        (0u32..=SECTOR_SIZE_U32).prop_map(move |delta| max_offset.saturating_sub(delta));

    prop_oneof![
        4 => any,
        3 => sector_aligned,
        2 => block_straddle,
        1 => near_end,
    ]
    .boxed()
}

fn op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    let write = offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data });
    let read = offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), 0usize..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len });

    prop_oneof![
        5 => write,
        4 => read,
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn ops_strategy(disk_size: u32) -> BoxedStrategy<Vec<Op>> {
    prop::collection::vec(op_strategy(disk_size), 1..=MAX_OPS).boxed()
}

fn run_ops<D, Reopen>(mut disk: D, mut model: Vec<u8>, ops: &[Op], mut reopen: Reopen) -> TestCaseResult
where
    D: VirtualDisk,
    Reopen: FnMut(D) -> D,
{
    let capacity = disk.capacity_bytes() as usize;
    prop_assert_eq!(capacity, model.len());

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                disk.write_at(offset as u64, data).unwrap();
                model[offset..offset + data.len()].copy_from_slice(data);

                let mut read_back = vec![0xA5u8; data.len()];
                disk.read_at(offset as u64, &mut read_back).unwrap();
                prop_assert_eq!(read_back.as_slice(), data.as_slice());
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let mut buf = vec![0xA5u8; *len];
                disk.read_at(offset as u64, &mut buf).unwrap();
                prop_assert_eq!(buf.as_slice(), &model[offset..offset + len]);
            }
            Op::Flush => disk.flush().unwrap(),
            Op::Reopen => {
                disk = reopen(disk);
                prop_assert_eq!(disk.capacity_bytes() as usize, capacity);
            }
        }
    }

    disk = reopen(disk);
    let mut all = vec![0u8; capacity];
    disk.read_at(0, &mut all).unwrap();
    prop_assert_eq!(all.as_slice(), model.as_slice());
    Ok(())
}

fn reopen_with(options: VhdOpenOptions) -> impl FnMut(VhdDisk<MemBackend>) -> VhdDisk<MemBackend> {
    move |disk| VhdDisk::open_with(disk.close().unwrap(), options).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        .. ProptestConfig::default()
    })]

    #[test]
    fn dynamic_vhd_matches_flat_model(
        (disk_size, block_size, cache_blocks, ops) in (
            disk_size_strategy(),
            block_size_strategy(),
            cache_blocks_strategy(),
        )
            .prop_flat_map(|(size, block, cache)| {
                (Just(size), Just(block), Just(cache), ops_strategy(size))
            })
    ) {
        let disk = VhdDisk::create(
            MemBackend::new(),
            VhdCreateOptions::dynamic(u64::from(disk_size)).with_block_size(block_size),
        )
        .unwrap();
        let options = VhdOpenOptions {
            read_only: false,
            bitmap_cache_blocks: NonZeroUsize::new(cache_blocks).unwrap(),
        };
        run_ops(disk, vec![0u8; disk_size as usize], &ops, reopen_with(options))?;
    }

    #[test]
    fn fixed_vhd_matches_flat_model(
        (disk_size, ops) in disk_size_strategy()
            .prop_flat_map(|size| (Just(size), ops_strategy(size)))
    ) {
        let disk = VhdDisk::create(
            MemBackend::new(),
            VhdCreateOptions::fixed(u64::from(disk_size)),
        )
        .unwrap();
        run_ops(
            disk,
            vec![0u8; disk_size as usize],
            &ops,
            reopen_with(VhdOpenOptions::default()),
        )?;
    }

    #[test]
    fn geometry_cylinders_grow_within_a_bucket(a in 0u64..(1u64 << 42), b in 0u64..(1u64 << 42)) {
        let (small, large) = if a <= b { (a, b) } else { (b, a) };
        let g_small = chs_geometry(small);
        let g_large = chs_geometry(large);
        if (g_small.heads, g_small.sectors_per_track)
            == (g_large.heads, g_large.sectors_per_track)
        {
            prop_assert!(g_small.cylinders <= g_large.cylinders);
        }
        prop_assert_eq!(chs_geometry(small), g_small);
    }

    #[test]
    fn stamped_checksum_verifies(mut raw in prop::collection::vec(any::<u8>(), 512)) {
        let stored = stamp_checksum(&mut raw, 64..68);
        prop_assert_eq!(vhd_checksum(&raw, 64..68), stored);
        prop_assert_eq!(&raw[64..68], &stored.to_be_bytes()[..]);
    }
}
