//! Builds a small heap in a `ToyHeap`, then walks it with the checker.
//!
//! Run with `RUST_LOG=debug` to see every block.

use segregated_allocator::{RawAlloc, ToyHeap};

fn main() {
    env_logger::init();

    let mut allocator = RawAlloc::new(ToyHeap::default());

    let sizes = [100, 16, 16, 16, 2000, 5000];
    let mut addrs = Vec::new();
    for &size in &sizes {
        match allocator.allocate(size) {
            Some(addr) => {
                println!("allocate({}) -> {} (block of {})", size, addr, allocator.block_size(addr));
                addrs.push(addr);
            }
            None => println!("allocate({}) failed", size),
        }
    }

    // Free every other block, leaving holes between allocated ones.
    for addr in addrs.iter().step_by(2) {
        allocator.free(Some(*addr));
    }
    println!("{}", allocator.blocks.display(&allocator.arena));

    let report = allocator.check(true);
    println!("{:#?}", report.stats);
    if report.is_valid() {
        println!("Heap is consistent.");
    } else {
        println!("Heap is inconsistent: {:?}", report.validity);
    }
}
