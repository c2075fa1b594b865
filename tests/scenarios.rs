use segregated_allocator::allocators::{RawAlloc, ToyHeap};
use segregated_allocator::size_class::class_of;
use segregated_allocator::Addr;

use test_log::test;

fn fresh() -> RawAlloc<ToyHeap> {
    let mut allocator = RawAlloc::new(ToyHeap::default());
    allocator.init().ok().unwrap();
    allocator
}

fn free_blocks(allocator: &RawAlloc<ToyHeap>) -> Vec<(usize, Addr)> {
    allocator
        .blocks
        .iter(&allocator.arena)
        .map(|(class, bp)| (class.index(), bp))
        .collect()
}

#[test]
fn test_reuse_after_free() {
    let mut allocator = fresh();
    let size = allocator.arena.size;

    let p1 = allocator.allocate(100).unwrap();
    assert_eq!(allocator.block_size(p1), 112);
    // Carved from the top of the initial 4096-byte block
    assert_eq!(p1.offset(), 16 + 4096 - 112);

    allocator.free(Some(p1));
    assert_eq!(free_blocks(&allocator).len(), 1);

    let again = allocator.allocate(100).unwrap();
    assert_eq!(again, p1);
    assert_eq!(allocator.arena.size, size);
    assert_eq!(allocator.arena.growths, 2);
    assert!(allocator.check(true).is_valid());
}

#[test]
fn test_reuse_middle_block() {
    let mut allocator = fresh();
    let p1 = allocator.allocate(16).unwrap();
    let p2 = allocator.allocate(16).unwrap();
    let p3 = allocator.allocate(16).unwrap();
    assert_eq!(p1.offset(), 4088);
    assert_eq!(p2.offset() + 24, p1.offset());
    assert_eq!(p3.offset() + 24, p2.offset());

    allocator.free(Some(p2));
    let p4 = allocator.allocate(16).unwrap();
    assert_eq!(p4, p2);
    assert!(p4.offset() + allocator.block_size(p4) <= p1.offset());
    assert!(p3.offset() + allocator.block_size(p3) <= p4.offset());
    assert_eq!(allocator.arena.growths, 2);
    assert!(allocator.check(false).is_valid());
}

#[test]
fn test_three_way_merge() {
    let mut allocator = fresh();
    let p1 = allocator.allocate(16).unwrap();
    let p2 = allocator.allocate(16).unwrap();
    let p3 = allocator.allocate(16).unwrap();
    // Keeps P3 from also merging with the rest of the chunk below it
    let guard = allocator.allocate(16).unwrap();
    assert_eq!(guard.offset(), 4016);

    allocator.free(Some(p1));
    allocator.free(Some(p3));
    allocator.free(Some(p2));

    // P3 is the lowest of the three, so the merged block starts there.
    assert_eq!(p3.offset(), 4040);
    assert_eq!(allocator.block_size(p3), 72);
    assert_eq!(class_of(72).index(), 7);
    let merged: Vec<Addr> = allocator
        .blocks
        .iter_class(&allocator.arena, class_of(72))
        .collect();
    assert_eq!(merged, [p3]);
    assert_eq!(allocator.blocks.head(class_of(24)), None);

    let report = allocator.check(true);
    assert!(report.is_valid(), "{:?}", report);
    assert_eq!(report.stats.free_blocks, 2);
    assert_eq!(report.stats.allocated_blocks, 1);
}

#[test]
fn test_zero_size_allocation() {
    let mut allocator = fresh();
    let size = allocator.arena.size;
    assert_eq!(allocator.allocate(0), None);
    assert_eq!(allocator.arena.size, size);

    // Before initialization too: nothing is touched
    let mut untouched = RawAlloc::new(ToyHeap::default());
    assert_eq!(untouched.allocate(0), None);
    assert_eq!(untouched.arena.size, 0);
}

#[test]
fn test_resize_to_zero_frees() {
    let mut freed = fresh();
    let mut resized = fresh();
    for allocator in [&mut freed, &mut resized] {
        allocator.allocate(40).unwrap();
        allocator.allocate(200).unwrap();
    }
    let p = freed.allocate(64).unwrap();
    let q = resized.allocate(64).unwrap();
    assert_eq!(p, q);
    let _guard = freed.allocate(16).unwrap();
    let _guard = resized.allocate(16).unwrap();

    freed.free(Some(p));
    assert_eq!(resized.resize(Some(q), 0), None);

    assert_eq!(free_blocks(&freed), free_blocks(&resized));
    assert_eq!(freed.check(false), resized.check(false));
    assert_eq!(
        &freed.arena.heap[..freed.arena.size],
        &resized.arena.heap[..resized.arena.size]
    );
}

#[test]
fn test_first_fit_across_classes() {
    let mut allocator = fresh();
    let small = allocator.allocate(40).unwrap();
    let _a = allocator.allocate(16).unwrap();
    let big = allocator.allocate(400).unwrap();
    let _b = allocator.allocate(16).unwrap();
    allocator.free(Some(small));
    allocator.free(Some(big));

    // 48 bytes fits the first; the 408-byte block is in a higher class.
    assert_eq!(allocator.allocate(40), Some(small));
    // Nothing in the 48-byte class any more, so the search moves up and
    // reaches the 408-byte block's class before the big remainder's.
    let p = allocator.allocate(40).unwrap();
    let big_end = big.offset() + 408;
    assert_eq!(p.offset() + 48, big_end);
    assert!(allocator.check(false).is_valid());
}
