use balloc::{
    group_of_block, Fs, FsError, FileBlockEmulator, FileBlockEmulatorBuilder, IncompatFeatures,
    InodeRef, MkfsOptions,
};
use tempfile::NamedTempFile;

fn create_test_device(nblocks: u64, block_size: usize) -> FileBlockEmulator {
    let dev = tempfile::tempfile().unwrap();
    FileBlockEmulatorBuilder::from(dev)
        .with_block_count(nblocks)
        .with_block_size(block_size)
        .build()
        .expect("could not initialize disk emulator")
}

/// 64 blocks of 1k in four 16-block groups, no reserved block.
fn small_fs() -> Fs<FileBlockEmulator> {
    let opts = MkfsOptions {
        block_size: 1024,
        blocks_count: 64,
        blocks_per_group: 16,
        first_data_block: 0,
        uuid: *b"integration-test",
        ..MkfsOptions::default()
    };
    Fs::mkfs(create_test_device(64, 1024), &opts).unwrap()
}

fn sum_of_group_free_counts(fs: &mut Fs<FileBlockEmulator>) -> u64 {
    (0..fs.sb.group_count())
        .map(|bgid| u64::from(fs.get_group_ref(bgid).unwrap().desc.free_blocks_count))
        .sum()
}

#[test]
fn freeing_a_block_updates_all_three_counters() {
    // The worked example: 8192-block groups of 1k blocks with block 0
    // reserved, so block 9 is bit 8 of group 0.
    let opts = MkfsOptions {
        block_size: 1024,
        blocks_count: 10_000,
        blocks_per_group: 8192,
        first_data_block: 1,
        uuid: *b"integration-test",
        ..MkfsOptions::default()
    };
    let mut fs = Fs::mkfs(create_test_device(10_000, 1024), &opts).unwrap();
    let mut inode = InodeRef::new(11);

    assert!(fs.try_alloc_block(&mut inode, 9).unwrap());
    assert_eq!(inode.inode.blocks_count(), 2);

    let free_before = fs.sb.free_blocks_count;
    let group_free_before = fs.get_group_ref(0).unwrap().desc.free_blocks_count;

    fs.free_block(&mut inode, 9).unwrap();

    assert_eq!(fs.sb.free_blocks_count, free_before + 1);
    assert_eq!(
        fs.get_group_ref(0).unwrap().desc.free_blocks_count,
        group_free_before + 1
    );
    // 1024-byte blocks cost two 512-byte accounting units.
    assert_eq!(inode.inode.blocks_count(), 0);
    assert!(inode.dirty);

    // The bit is clear again, so the exact claim succeeds a second time.
    assert!(fs.try_alloc_block(&mut inode, 9).unwrap());
}

#[test]
fn exact_claim_reports_already_allocated_blocks() {
    let mut fs = small_fs();
    let mut inode = InodeRef::new(7);

    assert!(fs.try_alloc_block(&mut inode, 40).unwrap());
    let free_after_claim = fs.sb.free_blocks_count;
    let blocks_after_claim = inode.inode.blocks_count();

    // A second claim on the same address changes nothing.
    assert!(!fs.try_alloc_block(&mut inode, 40).unwrap());
    assert_eq!(fs.sb.free_blocks_count, free_after_claim);
    assert_eq!(inode.inode.blocks_count(), blocks_after_claim);
}

#[test]
fn goal_allocator_prefers_nearest_bit_after_goal() {
    let opts = MkfsOptions {
        block_size: 1024,
        blocks_count: 128,
        blocks_per_group: 64,
        first_data_block: 0,
        uuid: *b"integration-test",
        ..MkfsOptions::default()
    };
    let mut fs = Fs::mkfs(create_test_device(128, 1024), &opts).unwrap();
    let mut inode = InodeRef::new(1);

    // Occupy the goal and everything nearer than goal + 5 inside the 64-bit
    // window.
    for baddr in 16..21 {
        assert!(fs.try_alloc_block(&mut inode, baddr).unwrap());
    }

    // The nearest free bit after the goal wins over group 1's empty space.
    let allocated = fs.alloc_block(&mut inode, 16).unwrap();
    assert_eq!(allocated, 21);
    assert_eq!(group_of_block(&fs.sb, allocated), 0);
}

#[test]
fn goal_group_beats_other_groups() {
    let mut fs = small_fs();
    let mut inode = InodeRef::new(1);

    // A goal in group 2 allocates from group 2 even though earlier groups
    // have free space.
    let allocated = fs.alloc_block(&mut inode, 35).unwrap();
    assert_eq!(group_of_block(&fs.sb, allocated), 2);
    assert_eq!(allocated, 35);
}

#[test]
fn conservation_holds_across_mixed_operations() {
    let mut fs = small_fs();
    let mut inode = InodeRef::new(3);

    let mut held = Vec::new();
    for goal in &[0u64, 17, 33, 50, 6, 12] {
        held.push(fs.alloc_block(&mut inode, *goal).unwrap());
    }
    assert_eq!(
        u64::from(inode.inode.blocks_count()),
        held.len() as u64 * 2
    );

    for baddr in held.drain(..3) {
        fs.free_block(&mut inode, baddr).unwrap();
    }

    let total = sum_of_group_free_counts(&mut fs);
    assert_eq!(total, fs.sb.free_blocks_count);
    assert_eq!(u64::from(inode.inode.blocks_count()), held.len() as u64 * 2);
}

#[test]
fn range_free_splits_across_group_boundary() {
    // Groups sized to the full bitmap capacity of a 512-byte block, so a
    // contiguous run can legally continue into the next group's bitmap.
    let opts = MkfsOptions {
        block_size: 512,
        blocks_count: 8192,
        blocks_per_group: 4096,
        first_data_block: 0,
        uuid: *b"integration-test",
        ..MkfsOptions::default()
    };
    let mut fs = Fs::mkfs(create_test_device(8192, 512), &opts).unwrap();
    let mut inode = InodeRef::new(5);

    // Claim ten blocks straddling the group 0 / group 1 boundary.
    for baddr in 4090..4100 {
        assert!(fs.try_alloc_block(&mut inode, baddr).unwrap());
    }
    let free_before = fs.sb.free_blocks_count;
    let g1_free_before = fs.get_group_ref(1).unwrap().desc.free_blocks_count;

    fs.free_blocks(&mut inode, 4090, 10).unwrap();

    assert_eq!(fs.sb.free_blocks_count, free_before + 10);
    // Blocks 4096..4100 of the run belonged to group 1.
    assert_eq!(
        fs.get_group_ref(1).unwrap().desc.free_blocks_count,
        g1_free_before + 4
    );
    assert_eq!(inode.inode.blocks_count(), 0);
    assert_eq!(sum_of_group_free_counts(&mut fs), fs.sb.free_blocks_count);

    // Both sides of the boundary are free again.
    assert!(fs.try_alloc_block(&mut inode, 4095).unwrap());
    assert!(fs.try_alloc_block(&mut inode, 4096).unwrap());
}

#[test]
#[should_panic(expected = "crosses a group boundary")]
fn cross_group_free_without_flex_bg_panics() {
    let opts = MkfsOptions {
        block_size: 1024,
        blocks_count: 64,
        blocks_per_group: 16,
        first_data_block: 0,
        incompat: IncompatFeatures::empty(),
        uuid: *b"integration-test",
        ..MkfsOptions::default()
    };
    let mut fs = Fs::mkfs(create_test_device(64, 1024), &opts).unwrap();
    let mut inode = InodeRef::new(5);

    fs.free_blocks(&mut inode, 14, 4).unwrap();
}

#[test]
fn exhausted_volume_returns_out_of_space() {
    let opts = MkfsOptions {
        block_size: 1024,
        blocks_count: 33,
        blocks_per_group: 16,
        first_data_block: 0,
        uuid: *b"integration-test",
        ..MkfsOptions::default()
    };
    let mut fs = Fs::mkfs(create_test_device(33, 1024), &opts).unwrap();
    let mut inode = InodeRef::new(2);

    let available = fs.sb.free_blocks_count;
    for _ in 0..available {
        fs.alloc_block(&mut inode, 0).unwrap();
    }
    assert_eq!(fs.sb.free_blocks_count, 0);

    match fs.alloc_block(&mut inode, 0) {
        Err(FsError::OutOfSpace) => (),
        other => panic!("expected out of space, got {:?}", other),
    }

    // The failed attempt mutated nothing.
    assert_eq!(sum_of_group_free_counts(&mut fs), 0);
    assert_eq!(
        u64::from(inode.inode.blocks_count()),
        available * 2
    );
}

#[test]
fn allocations_survive_a_remount() {
    let disk = NamedTempFile::new().unwrap();
    let opts = MkfsOptions {
        block_size: 1024,
        blocks_count: 64,
        blocks_per_group: 16,
        first_data_block: 0,
        uuid: *b"integration-test",
        ..MkfsOptions::default()
    };
    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(64)
        .with_block_size(1024)
        .build()
        .unwrap();

    let allocated;
    let free_after;
    {
        let mut fs = Fs::mkfs(dev, &opts).unwrap();
        let mut inode = InodeRef::new(2);
        allocated = fs.alloc_block(&mut inode, 20).unwrap();
        free_after = fs.sb.free_blocks_count;
        fs.sync().unwrap();
    }

    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(64)
        .with_block_size(1024)
        .clear_medium(false)
        .build()
        .unwrap();
    let mut fs = Fs::open(dev).unwrap();
    let mut inode = InodeRef::new(2);

    assert_eq!(fs.sb.free_blocks_count, free_after);
    assert_eq!(sum_of_group_free_counts(&mut fs), free_after);
    // The persisted bitmap still holds the allocation.
    assert!(!fs.try_alloc_block(&mut inode, allocated).unwrap());
}
