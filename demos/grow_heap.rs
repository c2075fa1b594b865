//! This is a very minimal example to show growing an `MmapArena` by hand.

use segregated_allocator::allocators::{ArenaProvider, MmapArena};

fn main() {
    // Reserve a single page. The second growth fails unless pages are at
    // least 8 KiB.
    let mut arena = MmapArena::with_reservation(4096);

    let offset = arena.grow(4000).unwrap();
    println!("Returned: ({:p}, offset {})", arena.base(), offset);
    arena.set_word(offset, 0xdead_beef);
    println!("Wrote {:#x}; arena is {} bytes", arena.word(offset), arena.len());

    match arena.grow(4096) {
        Ok(offset) => println!("Grew again at offset {}", offset),
        Err(e) => println!("Second growth failed: {}", e),
    }
    println!("Growths: {}", arena.growths());
}
