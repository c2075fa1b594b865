//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap over one growable arena. It hands
//! out, frees, and resizes blocks addressed by arena offsets ([`Addr`]),
//! keeping free blocks in segregated size-class lists and merging neighbours
//! eagerly through boundary tags.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html)
//! on top of it. `UnixAllocator` is a `GenericAllocator` over an
//! `MmapArena`, suitable for `#[global_allocator]`.
//!
//! ### [`ArenaProvider`](trait.ArenaProvider.html)
//!
//! `ArenaProvider` is a simple trait interface meant to abstract over the
//! calls to the OS to extend the arena.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed array that can pretend to be an arena, and implements
//! `ArenaProvider` for such a purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, null_mut};

use log::{debug, trace, warn};
use spin::{Mutex, MutexGuard, Once};
use thiserror::Error;

use crate::blocklist::{BlockList, MAX_ARENA_SIZE};
use crate::check::{self, Report, Violation};
use crate::config::Config;
use crate::error::HeapError;
use crate::tag::{self, round_up, Addr, Tag, DSIZE, MIN_BLOCK_SIZE, WSIZE};

/// The prologue: an allocated 8-byte pseudo-block at the start of the
/// arena, so the first real block always has an allocated predecessor.
pub(crate) const PROLOGUE: Addr = Addr::new_unchecked(2 * WSIZE as u32);
/// Where the first real block lives.
pub(crate) const FIRST_BLOCK: Addr = Addr::new_unchecked(2 * DSIZE as u32);
/// Padding word, prologue header and footer, and the epilogue header.
pub(crate) const HEAP_START: usize = 4 * WSIZE;

/// A source of memory for the arena.
///
/// The arena is one contiguous region that only ever grows at its high end.
/// The allocator never holds on to addresses from the provider: it only
/// stores offsets from [`base`](Self::base), and goes through the provided
/// accessors (all bounds-checked against [`len`](Self::len)) to touch memory.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - `base()` and `base_mut()` point to at least `len()` bytes that are
///   readable and writable, and not used by anything but the allocator and
///   the callers it hands blocks to.
/// - The base is 8-byte aligned.
/// - `grow(size)` either fails and changes nothing, or returns the old
///   `len()` and extends the region by exactly `size` bytes, preserving the
///   contents of every existing offset.
pub unsafe trait ArenaProvider {
    type Err: fmt::Display;

    fn base(&self) -> *const u8;

    fn base_mut(&mut self) -> *mut u8;

    /// The number of bytes handed out so far.
    fn len(&self) -> usize;

    /// Extend the arena by `size` bytes, returning the offset of the new
    /// region. `size` is always a multiple of 8.
    fn grow(&mut self, size: usize) -> Result<usize, Self::Err>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the word at `offset`.
    fn word(&self, offset: usize) -> u32 {
        assert_in_arena(offset, WSIZE, self.len());
        unsafe { self.base().add(offset).cast::<u32>().read_unaligned() }
    }

    /// Write the word at `offset`.
    fn set_word(&mut self, offset: usize, value: u32) {
        assert_in_arena(offset, WSIZE, self.len());
        unsafe { self.base_mut().add(offset).cast::<u32>().write_unaligned(value) }
    }

    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert_in_arena(offset, len, self.len());
        if len == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.base().add(offset), len) }
    }

    fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert_in_arena(offset, len, self.len());
        if len == 0 {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.base_mut().add(offset), len) }
    }

    /// Copy `len` bytes from `src` to `dst`; the two ranges may not overlap.
    fn copy_nonoverlapping(&mut self, src: usize, dst: usize, len: usize) {
        assert_in_arena(src, len, self.len());
        assert_in_arena(dst, len, self.len());
        assert!(
            src + len <= dst || dst + len <= src,
            "overlapping copy from {:#x} to {:#x} ({} bytes)",
            src,
            dst,
            len
        );
        if len == 0 {
            return;
        }
        unsafe {
            let base = self.base_mut();
            ptr::copy_nonoverlapping(base.add(src), base.add(dst), len);
        }
    }
}

fn assert_in_arena(offset: usize, len: usize, arena_len: usize) {
    let in_bounds = matches!(offset.checked_add(len), Some(end) if end <= arena_len);
    assert!(
        in_bounds,
        "arena access at {:#x}+{} is out of bounds (arena is {} bytes)",
        offset,
        len,
        arena_len
    );
}

/// `MmapArena` reserves a range of virtual memory from the OS up front, and
/// grows the arena within it.
///
/// The mapping is made with `MAP_NORESERVE`, so untouched pages cost
/// nothing; the reservation only caps how large the arena can get. It is
/// created lazily on the first `grow`, which keeps `new` a `const fn`.
#[cfg(feature = "use_libc")]
pub struct MmapArena {
    base: *mut u8,
    reservation: usize,
    reserved: usize,
    len: usize,
    // Just for tracking, not really needed
    growths: usize,
}

// The arena owns its mapping outright; nothing else refers to it.
#[cfg(feature = "use_libc")]
unsafe impl Send for MmapArena {}

#[cfg(feature = "use_libc")]
#[derive(Debug, Error)]
pub enum MmapError {
    #[error("mmap failed: {0}")]
    Map(errno::Errno),
    #[error("reservation exhausted: {requested} bytes requested, {available} available")]
    Exhausted { requested: usize, available: usize },
}

#[cfg(feature = "use_libc")]
impl Default for MmapArena {
    fn default() -> Self {
        MmapArena::new()
    }
}

#[cfg(feature = "use_libc")]
impl MmapArena {
    /// 1 GiB of address space.
    pub const DEFAULT_RESERVATION: usize = 1 << 30;

    pub const fn new() -> Self {
        MmapArena::with_reservation(MmapArena::DEFAULT_RESERVATION)
    }

    /// An arena that can grow to at most `bytes` (rounded up to whole pages).
    pub const fn with_reservation(bytes: usize) -> Self {
        MmapArena {
            base: null_mut(),
            reservation: bytes,
            reserved: 0,
            len: 0,
            growths: 0,
        }
    }

    pub fn growths(&self) -> usize {
        self.growths
    }

    fn reserve(&mut self) -> Result<(), MmapError> {
        let pagesize = sysconf::page::pagesize();
        let size = round_up(self.reservation, pagesize).ok_or(MmapError::Exhausted {
            requested: self.reservation,
            available: 0,
        })?;

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                size,
                libc::PROT_WRITE | libc::PROT_READ,
                // MAP_NORESERVE: only pages we actually touch get backed.
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MmapError::Map(errno::errno()));
        }

        debug!("reserved {} bytes of address space at {:p}", size, ptr);
        self.base = ptr as *mut u8;
        self.reserved = size;
        Ok(())
    }
}

#[cfg(feature = "use_libc")]
unsafe impl ArenaProvider for MmapArena {
    type Err = MmapError;

    fn base(&self) -> *const u8 {
        self.base
    }

    fn base_mut(&mut self) -> *mut u8 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn grow(&mut self, size: usize) -> Result<usize, MmapError> {
        if self.base.is_null() {
            self.reserve()?;
        }

        let available = self.reserved - self.len;
        if size > available {
            return Err(MmapError::Exhausted {
                requested: size,
                available,
            });
        }

        let offset = self.len;
        self.len += size;
        self.growths += 1;
        Ok(offset)
    }
}

#[cfg(feature = "use_libc")]
impl Drop for MmapArena {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe { libc::munmap(self.base as *mut libc::c_void, self.reserved) };
        }
    }
}

pub const TOY_HEAP_SIZE: usize = 256 * 1024;

#[repr(C, align(16))]
pub struct ToyHeap {
    pub heap: [u8; TOY_HEAP_SIZE],
    pub size: usize,
    pub growths: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
            growths: 0,
        }
    }
}

#[derive(Debug, Error)]
#[error("toy heap overflow: {requested} bytes requested, {available} available")]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

unsafe impl ArenaProvider for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn base(&self) -> *const u8 {
        self.heap.as_ptr()
    }

    fn base_mut(&mut self) -> *mut u8 {
        self.heap.as_mut_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn grow(&mut self, size: usize) -> Result<usize, ToyHeapOverflowError> {
        let available = self.heap.len() - self.size;
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        let offset = self.size;
        self.size += size;
        self.growths += 1;
        Ok(offset)
    }
}

/// A raw allocator, capable of growing its arena, returning new
/// allocations, and tracking and reusing freed memory.
///
/// The arena is laid out as a padding word, an allocated prologue block,
/// the real blocks, and a zero-sized allocated epilogue header in the last
/// word:
///
/// ```text
///   | pad | prologue 8:a | block | block | ... | block | epilogue 0:a |
///   0     4              16                                     len - 4
/// ```
///
/// The sentinels mean every real block has a tagged neighbour on each side,
/// so coalescing never has to check for the ends of the arena.
///
/// Note: It never returns memory to the provider; that is not implemented.
/// It is also not thread-safe; see [`GenericAllocator`] for that.
///
/// Freeing an address that did not come from this heap, or freeing one
/// twice, is not detected. Accesses stay inside the arena regardless, but
/// the heap's structure is no longer trustworthy afterwards;
/// [`check`](Self::check) will usually notice.
pub struct RawAlloc<A> {
    pub arena: A,
    pub blocks: BlockList,
    config: Config,
    initialized: bool,
}

impl<A: ArenaProvider + Default> Default for RawAlloc<A> {
    fn default() -> Self {
        RawAlloc::new(A::default())
    }
}

impl<A: ArenaProvider> RawAlloc<A> {
    /// Create a new `RawAlloc`. Nothing is requested from the arena until
    /// the first allocation, or an explicit [`init`](Self::init).
    pub fn new(arena: A) -> Self {
        RawAlloc::with_config(arena, Config::default())
    }

    pub fn with_config(arena: A, config: Config) -> Self {
        RawAlloc {
            arena,
            blocks: BlockList::new(),
            config,
            initialized: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lay out the prologue and epilogue, and create the first free block.
    ///
    /// Does nothing if already initialized. `allocate` and `free` call this
    /// themselves.
    pub fn init(&mut self) -> Result<(), HeapError<A::Err>> {
        if self.initialized {
            return Ok(());
        }
        if !self.arena.is_empty() {
            return Err(HeapError::ArenaInUse(self.arena.len()));
        }

        let start = self.arena.grow(HEAP_START).map_err(HeapError::Grow)?;
        debug_assert_eq!(start, 0);
        self.arena.set_word(0, 0);
        tag::write_tags(&mut self.arena, PROLOGUE, Tag::allocated(DSIZE));
        tag::write_header(&mut self.arena, FIRST_BLOCK, Tag::allocated(0));
        self.initialized = true;

        self.extend(self.config.chunk_size())?;
        Ok(())
    }

    /// Calculate the block size needed to hold `size` bytes of payload:
    /// room for a header and footer, rounded up to a multiple of 8, and never
    /// less than the minimum block size.
    ///
    /// Returns `None` if no arena could hold such a block.
    pub fn adjusted_size(size: usize) -> Option<usize> {
        if size <= DSIZE {
            return Some(MIN_BLOCK_SIZE);
        }
        let asize = round_up(size.checked_add(DSIZE)?, DSIZE)?;
        if asize > MAX_ARENA_SIZE {
            return None;
        }
        Some(asize)
    }

    /// Allocate a block with room for at least `size` bytes, returning the
    /// address of its interior.
    ///
    /// A zero-sized request returns `None` without touching the arena. When
    /// the arena cannot grow, this also returns `None`; the reason is logged.
    pub fn allocate(&mut self, size: usize) -> Option<Addr> {
        match self.try_allocate(size) {
            Ok(bp) => bp,
            Err(e) => {
                warn!("allocation of {} bytes failed: {}", size, e);
                None
            }
        }
    }

    /// Like [`allocate`](Self::allocate), but reporting why an allocation
    /// failed.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<Addr>, HeapError<A::Err>> {
        if size == 0 {
            return Ok(None);
        }
        self.init()?;

        let asize = Self::adjusted_size(size).ok_or(HeapError::TooLarge(size))?;
        let bp = match self.blocks.find_fit(&self.arena, asize) {
            Some(bp) => bp,
            None => self.extend(asize.max(self.config.chunk_size()))?,
        };

        Ok(Some(self.place(bp, asize)))
    }

    /// Free a block returned by `allocate` or `resize`. `None` is ignored.
    pub fn free(&mut self, addr: Option<Addr>) {
        let bp = match addr {
            None => return,
            Some(bp) => bp,
        };
        if let Err(e) = self.init() {
            warn!("cannot free {}: heap failed to initialize: {}", bp, e);
            return;
        }

        let size = tag::header(&self.arena, bp).size;
        trace!("freeing {} bytes at {}", size, bp);
        tag::write_tags(&mut self.arena, bp, Tag::free(size));
        self.coalesce(bp);
    }

    /// Move a block's contents into a new block of `size` bytes.
    ///
    /// - `size == 0` frees `addr` and returns `None`.
    /// - `addr == None` is the same as `allocate(size)`.
    /// - Otherwise a new block is allocated, the first
    ///   `min(old payload, size)` bytes are copied over, and the old block is
    ///   freed. If the new block cannot be allocated, `None` is returned and
    ///   the old block is left exactly as it was.
    ///
    /// The block is always moved; there is no in-place path.
    pub fn resize(&mut self, addr: Option<Addr>, size: usize) -> Option<Addr> {
        if size == 0 {
            self.free(addr);
            return None;
        }
        let old = match addr {
            None => return self.allocate(size),
            Some(old) => old,
        };

        let new = self.allocate(size)?;
        let copied = self.payload_size(old).min(size);
        self.arena
            .copy_nonoverlapping(old.offset(), new.offset(), copied);
        self.free(Some(old));
        Some(new)
    }

    /// The total size of a block, including its header and footer.
    pub fn block_size(&self, addr: Addr) -> usize {
        tag::header(&self.arena, addr).size
    }

    /// The number of bytes a caller may use in a block.
    pub fn payload_size(&self, addr: Addr) -> usize {
        self.block_size(addr).saturating_sub(DSIZE)
    }

    pub fn payload(&self, addr: Addr) -> &[u8] {
        self.arena.bytes(addr.offset(), self.payload_size(addr))
    }

    pub fn payload_mut(&mut self, addr: Addr) -> &mut [u8] {
        let size = self.payload_size(addr);
        self.arena.bytes_mut(addr.offset(), size)
    }

    /// A pointer to the interior of a block.
    pub fn as_mut_ptr(&mut self, addr: Addr) -> *mut u8 {
        assert!(addr.offset() < self.arena.len(), "{} is outside the arena", addr);
        unsafe { self.arena.base_mut().add(addr.offset()) }
    }

    /// The block whose interior `ptr` points at, if `ptr` is in the arena.
    pub fn addr_of(&self, ptr: *mut u8) -> Option<Addr> {
        if ptr.is_null() {
            return None;
        }
        let offset = (ptr as usize).checked_sub(self.arena.base() as usize)?;
        if offset >= self.arena.len() {
            return None;
        }
        Addr::from_offset(offset)
    }

    /// Walk the heap and its free lists, verifying their invariants.
    ///
    /// This is advisory only: the allocator never calls it itself. With
    /// `verbose`, every block is logged at `debug` level.
    pub fn check(&self, verbose: bool) -> Report {
        self.check_each(verbose, |_| {})
    }

    /// Like [`check`](Self::check), also passing each violation found to `f`.
    pub fn check_each<F: FnMut(Violation)>(&self, verbose: bool, f: F) -> Report {
        check::check_heap(&self.arena, &self.blocks, verbose, f)
    }

    /// Grow the arena by `size` bytes, turn the new space into a free block
    /// (merged with a free block at the old end, if any), and return it.
    fn extend(&mut self, size: usize) -> Result<Addr, HeapError<A::Err>> {
        let size = round_up(size, DSIZE).ok_or(HeapError::TooLarge(size))?;
        let len = self.arena.len();
        if size > MAX_ARENA_SIZE.saturating_sub(len) {
            return Err(HeapError::ArenaLimit {
                requested: size,
                limit: MAX_ARENA_SIZE,
            });
        }

        let offset = self.arena.grow(size).map_err(HeapError::Grow)?;
        debug_assert_eq!(offset, len, "arena growth must append");
        debug!("grew arena by {} bytes to {}", size, self.arena.len());

        // The old epilogue header becomes the new block's header.
        let bp = Addr::new_unchecked(offset as u32);
        tag::write_tags(&mut self.arena, bp, Tag::free(size));
        tag::write_header(&mut self.arena, bp.add(size), Tag::allocated(0));

        Ok(self.coalesce(bp))
    }

    /// Carve an allocated block of `asize` bytes out of the free block at
    /// `bp`, returning the allocated block.
    ///
    /// The allocated part is taken from the high end; a remainder big enough
    /// to be a block stays free at the low end, in its own list.
    fn place(&mut self, bp: Addr, asize: usize) -> Addr {
        let csize = tag::header(&self.arena, bp).size;
        self.blocks.remove(&mut self.arena, bp);

        if csize - asize >= MIN_BLOCK_SIZE {
            let allocated = bp.add(csize - asize);
            tag::write_tags(&mut self.arena, allocated, Tag::allocated(asize));
            tag::write_tags(&mut self.arena, bp, Tag::free(csize - asize));
            self.blocks.insert(&mut self.arena, bp);
            trace!("split {} off {}:{} at {}", asize, bp, csize, allocated);
            allocated
        } else {
            tag::write_tags(&mut self.arena, bp, Tag::allocated(csize));
            trace!("took all of {}:{}", bp, csize);
            bp
        }
    }

    /// Merge a newly freed block with its free neighbours, and put the
    /// result on its free list.
    fn coalesce(&mut self, bp: Addr) -> Addr {
        let prev_allocated = tag::prev_footer(&self.arena, bp).allocated;
        let next = tag::next_block(&self.arena, bp);
        let next_allocated = tag::header(&self.arena, next).allocated;
        let mut size = tag::header(&self.arena, bp).size;

        // Neighbours come off their lists before their tags are overwritten:
        // unlinking reads links stored inside them.
        let merged = match (prev_allocated, next_allocated) {
            (true, true) => bp,
            (true, false) => {
                size += tag::header(&self.arena, next).size;
                self.blocks.remove(&mut self.arena, next);
                tag::write_tags(&mut self.arena, bp, Tag::free(size));
                bp
            }
            (false, true) => {
                let prev = tag::prev_block(&self.arena, bp);
                size += tag::header(&self.arena, prev).size;
                self.blocks.remove(&mut self.arena, prev);
                tag::write_tags(&mut self.arena, prev, Tag::free(size));
                prev
            }
            (false, false) => {
                let prev = tag::prev_block(&self.arena, bp);
                size += tag::header(&self.arena, prev).size + tag::header(&self.arena, next).size;
                self.blocks.remove(&mut self.arena, prev);
                self.blocks.remove(&mut self.arena, next);
                tag::write_tags(&mut self.arena, prev, Tag::free(size));
                prev
            }
        };

        trace!("coalesced {} into {}:{}", bp, merged, size);
        self.blocks.insert(&mut self.arena, merged);
        merged
    }
}

/// A thread-safe allocator, using a spin lock around a `RawAlloc`.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator, so that was easy to add with a spin lock. The `RawAlloc` is
/// created on first use, which lets `new` be a `const fn`.
///
/// Only alignments up to 8 are supported; larger ones get a null pointer.
///
/// Any logger installed while this is the global allocator must not
/// allocate at the levels it has enabled: the allocator logs while holding
/// its lock.
pub struct GenericAllocator<A> {
    raw: Once<Mutex<RawAlloc<A>>>,
}

impl<A: ArenaProvider + Default> Default for GenericAllocator<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> GenericAllocator<A> {
    pub const fn new() -> Self {
        GenericAllocator { raw: Once::new() }
    }
}

impl<A: ArenaProvider + Default> GenericAllocator<A> {
    /// Lock and return the underlying `RawAlloc`.
    ///
    /// Allocation through this allocator blocks while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, RawAlloc<A>> {
        self.raw
            .call_once(|| Mutex::new(RawAlloc::default()))
            .lock()
    }

    pub fn check(&self) -> Report {
        self.lock().check(false)
    }
}

unsafe impl<A: ArenaProvider + Default> GlobalAlloc for GenericAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > DSIZE {
            return null_mut();
        }
        let mut raw = self.lock();
        match raw.allocate(layout.size()) {
            Some(bp) => raw.as_mut_ptr(bp),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut raw = self.lock();
        let addr = raw.addr_of(ptr);
        raw.free(addr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > DSIZE {
            return null_mut();
        }
        let mut raw = self.lock();
        let addr = raw.addr_of(ptr);
        match raw.resize(addr, new_size) {
            Some(bp) => raw.as_mut_ptr(bp),
            None => null_mut(),
        }
    }
}

/// A global allocator backed by a reserved range of virtual memory.
#[cfg(feature = "use_libc")]
pub type UnixAllocator = GenericAllocator<MmapArena>;
