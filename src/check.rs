//! Heap consistency checking.
//!
//! The checker walks the arena block by block from the prologue to the
//! epilogue, then walks every free list, and reports what it finds as
//! [`Violation`]s plus summary [`Stats`]. It never allocates, so it can run
//! under the global allocator's lock, and it reads only through bounds
//! checks, so a corrupt heap makes it report rather than panic.
//!
//! None of this is on the allocation path; it exists for tests and tooling.

use log::debug;

use crate::allocators::{ArenaProvider, FIRST_BLOCK, HEAP_START, PROLOGUE};
use crate::blocklist::{next_free, prev_free, BlockList, Prev};
use crate::size_class::{class_of, SizeClass};
use crate::tag::{Addr, Tag, DSIZE, MIN_BLOCK_SIZE, WSIZE};

/// The kinds of inconsistency the checker can find.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// The prologue block's tags are not `8:a`.
    BadPrologue,
    /// The walk did not end at a `0:a` header in the arena's last word.
    BadEpilogue,
    /// A block's interior is not 8-byte aligned.
    Misaligned,
    /// A block's header and footer differ.
    TagMismatch,
    /// A block's size is below the minimum or not a multiple of 8.
    BadSize,
    /// A block runs past the end of the arena.
    Overrun,
    /// Two free blocks are adjacent; they should have been merged.
    Uncoalesced,
    /// An allocated block is on a free list.
    AllocatedInList,
    /// A free block is on the list for a class its size doesn't map to.
    WrongClass,
    /// A block's prev link doesn't name the block (or head) before it.
    BrokenLink,
    /// The free lists and the arena disagree on how many blocks are free.
    ListMismatch,
}

/// A single finding: what is wrong, and the arena offset where.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub location: usize,
}

/// Validity contains a count of all invalid states found in a heap.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Damaged prologue or epilogue.
    pub sentinels: usize,
    pub misaligned: usize,
    /// Blocks whose header and footer disagree.
    ///
    /// This likely indicates corruption.
    pub tag_mismatches: usize,
    /// Blocks with impossible sizes, including ones that overrun the arena.
    pub bad_sizes: usize,
    /// Adjacent free blocks that were not merged.
    pub uncoalesced: usize,
    /// Any problem found walking the free lists.
    pub free_list: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }

    fn record(&mut self, kind: ViolationKind) {
        use ViolationKind::*;

        let count = match kind {
            BadPrologue | BadEpilogue => &mut self.sentinels,
            Misaligned => &mut self.misaligned,
            TagMismatch => &mut self.tag_mismatches,
            BadSize | Overrun => &mut self.bad_sizes,
            Uncoalesced => &mut self.uncoalesced,
            AllocatedInList | WrongClass | BrokenLink | ListMismatch => &mut self.free_list,
        };
        *count += 1;
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// What the heap looks like. Sentinels are not counted as blocks.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub arena_size: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    /// Blocks reachable from the free-list table.
    pub listed_blocks: usize,
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Report {
    pub validity: Validity,
    pub stats: Stats,
}

impl Report {
    pub fn is_valid(&self) -> bool {
        self.validity.is_valid()
    }
}

/// Check the heap laid out in `arena`, with free lists in `blocks`.
///
/// An arena with nothing in it yet (an uninitialized heap) is valid.
pub fn check_heap<A, F>(arena: &A, blocks: &BlockList, verbose: bool, f: F) -> Report
where
    A: ArenaProvider + ?Sized,
    F: FnMut(Violation),
{
    let mut checker = Checker {
        arena,
        blocks,
        verbose,
        f,
        report: Report::default(),
    };
    checker.report.stats.arena_size = arena.len();
    if arena.is_empty() {
        return checker.report;
    }

    checker.walk_blocks();
    checker.walk_lists();
    checker.report
}

struct Checker<'a, A: ?Sized, F> {
    arena: &'a A,
    blocks: &'a BlockList,
    verbose: bool,
    f: F,
    report: Report,
}

impl<'a, A, F> Checker<'a, A, F>
where
    A: ArenaProvider + ?Sized,
    F: FnMut(Violation),
{
    fn flag(&mut self, kind: ViolationKind, location: usize) {
        self.report.validity.record(kind);
        (self.f)(Violation { kind, location });
    }

    fn readable(&self, offset: usize, len: usize) -> bool {
        matches!(offset.checked_add(len), Some(end) if end <= self.arena.len())
    }

    fn tag_at(&self, offset: usize) -> Tag {
        Tag::unpack(self.arena.word(offset))
    }

    fn walk_blocks(&mut self) {
        let len = self.arena.len();
        if self.verbose {
            debug!("Heap ({} bytes):", len);
        }

        if len < HEAP_START {
            self.flag(ViolationKind::BadPrologue, 0);
            return;
        }
        let prologue = Tag::allocated(DSIZE);
        // An 8-byte block's footer sits right at its interior.
        if self.tag_at(PROLOGUE.header()) != prologue || self.tag_at(PROLOGUE.offset()) != prologue {
            self.flag(ViolationKind::BadPrologue, PROLOGUE.header());
        }

        let mut bp = FIRST_BLOCK;
        let mut previous_free = false;
        loop {
            if !self.readable(bp.header(), WSIZE) {
                self.flag(ViolationKind::BadEpilogue, bp.header());
                return;
            }
            let header = self.tag_at(bp.header());
            if header.size == 0 {
                break;
            }

            if bp.offset() % DSIZE != 0 {
                self.flag(ViolationKind::Misaligned, bp.offset());
            }
            if header.size < MIN_BLOCK_SIZE || header.size % DSIZE != 0 {
                // Without a trustworthy size there is no next block to go to.
                self.flag(ViolationKind::BadSize, bp.offset());
                return;
            }
            if !self.readable(bp.offset(), header.size) {
                self.flag(ViolationKind::Overrun, bp.offset());
                return;
            }

            let footer = self.tag_at(bp.offset() + header.size - DSIZE);
            if self.verbose {
                debug!("{}: header: [{}] footer: [{}]", bp, header, footer);
            }
            if footer != header {
                self.flag(ViolationKind::TagMismatch, bp.offset());
            }

            let stats = &mut self.report.stats;
            stats.blocks += 1;
            if header.allocated {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += header.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += header.size;
                if previous_free {
                    self.flag(ViolationKind::Uncoalesced, bp.offset());
                }
            }
            previous_free = !header.allocated;

            bp = bp.add(header.size);
        }

        let epilogue = self.tag_at(bp.header());
        if self.verbose {
            debug!("{}: EOL [{}]", bp, epilogue);
        }
        if !epilogue.allocated || bp.header() != len - WSIZE {
            self.flag(ViolationKind::BadEpilogue, bp.header());
        }
    }

    fn walk_lists(&mut self) {
        // More listed blocks than could fit in the arena means a cycle.
        let limit = self.arena.len() / MIN_BLOCK_SIZE;
        let mut listed = 0;

        'classes: for class in SizeClass::all() {
            let mut expected = Prev::Head(class);
            let mut next = self.blocks.head(class);

            while let Some(bp) = next {
                if listed >= limit {
                    self.flag(ViolationKind::ListMismatch, bp.offset());
                    break 'classes;
                }
                if !self.linkable(bp) {
                    self.flag(ViolationKind::BrokenLink, bp.offset());
                    break;
                }
                listed += 1;

                let header = self.tag_at(bp.header());
                if header.allocated {
                    self.flag(ViolationKind::AllocatedInList, bp.offset());
                }
                if class_of(header.size) != class {
                    self.flag(ViolationKind::WrongClass, bp.offset());
                }
                if prev_free(self.arena, bp) != Some(expected) {
                    self.flag(ViolationKind::BrokenLink, bp.offset());
                }

                expected = Prev::Block(bp);
                next = next_free(self.arena, bp);
            }
        }

        self.report.stats.listed_blocks = listed;
        if listed != self.report.stats.free_blocks {
            self.flag(ViolationKind::ListMismatch, 0);
        }
    }

    // Whether `bp` could be a real block with both link words in the arena.
    fn linkable(&self, bp: Addr) -> bool {
        bp >= FIRST_BLOCK && bp.offset() % DSIZE == 0 && self.readable(bp.offset(), DSIZE)
    }
}
