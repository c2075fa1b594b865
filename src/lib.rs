#![cfg_attr(not(test), no_std)]

//! A segregated-fit memory allocator.
//!
//! The heap lives in a single arena that only grows at its high end. Every
//! block carries identical header and footer [boundary tags](tag), so a
//! freed block is merged with free neighbours on either side immediately.
//! Free blocks are binned into [size classes](size_class) and kept in
//! intrusive doubly-linked [lists](blocklist), one per class; allocation
//! searches from the request's class upward and takes the first block that
//! is big enough.
//!
//! [`RawAlloc`] is the single-threaded heap, addressed by arena offsets.
//! [`GenericAllocator`] puts it behind a spin lock and implements
//! `GlobalAlloc`. With the `use_libc` feature, [`UnixAllocator`] does the
//! same over memory reserved with `mmap`:
//!
//! ```ignore
//! use segregated_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```
//!
//! [`RawAlloc::check`] walks the whole heap and reports anything
//! inconsistent; see [`check`].

pub mod allocators;
pub mod blocklist;
pub mod check;
pub mod config;
pub mod error;
pub mod size_class;
pub mod tag;

pub use allocators::{ArenaProvider, GenericAllocator, RawAlloc, ToyHeap};
#[cfg(feature = "use_libc")]
pub use allocators::{MmapArena, UnixAllocator};
pub use check::{Report, Stats, Validity, Violation, ViolationKind};
pub use config::Config;
pub use error::HeapError;
pub use tag::Addr;
