use core::alloc::{GlobalAlloc, Layout};

use segregated_allocator::allocators::{GenericAllocator, ToyHeap};

use test_log::test;

#[test]
fn test_alloc_realloc_dealloc() {
    let allocator: GenericAllocator<ToyHeap> = GenericAllocator::new();
    let layout = Layout::from_size_align(24, 8).unwrap();

    unsafe {
        let p = allocator.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0);
        for i in 0..24 {
            *p.add(i) = i as u8;
        }

        let q = allocator.realloc(p, layout, 1000);
        assert!(!q.is_null());
        for i in 0..24 {
            assert_eq!(*q.add(i), i as u8);
        }
        *q.add(999) = 0xFF;

        let report = allocator.check();
        assert!(report.is_valid());
        assert_eq!(report.stats.allocated_blocks, 1);

        allocator.dealloc(q, Layout::from_size_align(1000, 8).unwrap());
    }

    let report = allocator.check();
    assert!(report.is_valid(), "{:?}", report);
    assert_eq!(report.stats.allocated_blocks, 0);
}

#[test]
fn test_alignment_limit() {
    let allocator: GenericAllocator<ToyHeap> = GenericAllocator::new();
    unsafe {
        let small = allocator.alloc(Layout::from_size_align(3, 1).unwrap());
        assert!(!small.is_null());

        let wide = allocator.alloc(Layout::from_size_align(64, 16).unwrap());
        assert!(wide.is_null());

        allocator.dealloc(small, Layout::from_size_align(3, 1).unwrap());
    }
    assert!(allocator.check().is_valid());
}

#[test]
fn test_zero_size_and_exhaustion() {
    let allocator: GenericAllocator<ToyHeap> = GenericAllocator::new();
    unsafe {
        assert!(allocator.alloc(Layout::from_size_align(0, 1).unwrap()).is_null());
        let huge = Layout::from_size_align(1 << 20, 8).unwrap();
        assert!(allocator.alloc(huge).is_null());

        let p = allocator.alloc(Layout::from_size_align(64, 8).unwrap());
        assert!(!p.is_null());
        // A failed realloc leaves the original in place
        assert!(allocator
            .realloc(p, Layout::from_size_align(64, 8).unwrap(), 1 << 20)
            .is_null());
        assert_eq!(allocator.lock().check(false).stats.allocated_blocks, 1);
        allocator.dealloc(p, Layout::from_size_align(64, 8).unwrap());
    }
    assert!(allocator.check().is_valid());
}

#[test]
fn test_shared_between_threads() {
    static ALLOCATOR: GenericAllocator<ToyHeap> = GenericAllocator::new();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                let layout = Layout::from_size_align(32 + t * 8, 8).unwrap();
                for _ in 0..100 {
                    unsafe {
                        let p = ALLOCATOR.alloc(layout);
                        assert!(!p.is_null());
                        p.write_bytes(t as u8, layout.size());
                        assert_eq!(*p.add(layout.size() - 1), t as u8);
                        ALLOCATOR.dealloc(p, layout);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = ALLOCATOR.check();
    assert!(report.is_valid(), "{:?}", report);
    assert_eq!(report.stats.allocated_blocks, 0);
}
