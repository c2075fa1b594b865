//! The segregated free-list table.
//!
//! A [`BlockList`] holds one list head per [size class](crate::size_class).
//! The lists themselves are intrusive: each free block stores its links in
//! the first two words of its own interior, so the table costs nothing per
//! block beyond the block's minimum size.
//!
//! ```text
//!   heads[c] ──> A ──next──> B ──next──> (none)
//!                │           │
//!             prev=Head(c)  prev=Block(A)
//! ```
//!
//! The first block of each list links back to an explicit [`Prev::Head`]
//! sentinel naming its class, so unlinking never has to special-case the
//! head of a list.

use core::fmt;

use static_assertions::const_assert;

use crate::allocators::ArenaProvider;
use crate::size_class::{class_of, SizeClass, NUM_CLASSES};
use crate::tag::{self, Addr, MIN_BLOCK_SIZE, WSIZE};

// Offsets of the link words inside a free block's interior.
const NEXT: usize = 0;
const PREV: usize = WSIZE;

const_assert!(PREV + WSIZE <= MIN_BLOCK_SIZE - 2 * WSIZE);

// A prev link pointing at a class head rather than a block has this bit set.
// Arena offsets stay below it; see `MAX_ARENA_SIZE`.
const HEAD_TAG: u32 = 0x8000_0000;

/// The largest arena whose offsets can be told apart from head sentinels.
pub const MAX_ARENA_SIZE: usize = HEAD_TAG as usize - tag::DSIZE;

const_assert!(NUM_CLASSES < HEAD_TAG as usize);

/// What comes before a free block in its list.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Prev {
    /// The block is first in its list; the list head for this class points
    /// at it.
    Head(SizeClass),
    /// Another free block in the same list.
    Block(Addr),
}

impl Prev {
    fn encode(self) -> u32 {
        match self {
            Prev::Head(class) => HEAD_TAG | class.index() as u32,
            Prev::Block(bp) => bp.raw(),
        }
    }

    fn decode(word: u32) -> Option<Prev> {
        if word & HEAD_TAG != 0 {
            SizeClass::from_index((word & !HEAD_TAG) as usize).map(Prev::Head)
        } else if word == 0 {
            None
        } else {
            Some(Prev::Block(Addr::new_unchecked(word)))
        }
    }
}

/// Read the successor link of a free block.
pub fn next_free<A: ArenaProvider + ?Sized>(arena: &A, bp: Addr) -> Option<Addr> {
    match arena.word(bp.offset() + NEXT) {
        0 => None,
        word => Some(Addr::new_unchecked(word)),
    }
}

/// Read the predecessor link of a free block.
///
/// This is `None` only for a block whose link word is corrupt; any block
/// actually on a list always has a predecessor or a head sentinel.
pub fn prev_free<A: ArenaProvider + ?Sized>(arena: &A, bp: Addr) -> Option<Prev> {
    Prev::decode(arena.word(bp.offset() + PREV))
}

fn set_next<A: ArenaProvider + ?Sized>(arena: &mut A, bp: Addr, next: Option<Addr>) {
    arena.set_word(bp.offset() + NEXT, next.map_or(0, Addr::raw));
}

fn set_prev<A: ArenaProvider + ?Sized>(arena: &mut A, bp: Addr, prev: Prev) {
    arena.set_word(bp.offset() + PREV, prev.encode());
}

/// A table of free lists, one per size class.
///
/// Invariants, as maintained by the allocator:
///
/// - Every free block in the arena is on exactly one list: the one for
///   `class_of(size)`.
/// - No allocated block is on any list.
/// - Each block's `prev` link names the block (or head) whose `next` is it.
///
/// The table itself only ever stores arena offsets, so it can live anywhere;
/// it is kept alongside the allocator rather than inside the arena.
pub struct BlockList {
    heads: [Option<Addr>; NUM_CLASSES],
}

impl Default for BlockList {
    fn default() -> Self {
        BlockList::new()
    }
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList {
            heads: [None; NUM_CLASSES],
        }
    }

    /// The first block of a class's list.
    pub fn head(&self, class: SizeClass) -> Option<Addr> {
        self.heads[class.index()]
    }

    /// Push a free block onto the front of the list for its size.
    ///
    /// The block's header must already carry its final size.
    pub fn insert<A: ArenaProvider + ?Sized>(&mut self, arena: &mut A, bp: Addr) {
        let class = class_of(tag::header(arena, bp).size);
        let old_head = self.heads[class.index()];

        set_next(arena, bp, old_head);
        set_prev(arena, bp, Prev::Head(class));
        if let Some(old) = old_head {
            set_prev(arena, old, Prev::Block(bp));
        }
        self.heads[class.index()] = Some(bp);
    }

    /// Unlink a block from whichever list it is on.
    ///
    /// Only the block's own links are consulted, so this must run before the
    /// block's interior is overwritten.
    pub fn remove<A: ArenaProvider + ?Sized>(&mut self, arena: &mut A, bp: Addr) {
        let next = next_free(arena, bp);
        let prev = match prev_free(arena, bp) {
            Some(prev) => prev,
            None => {
                debug_assert!(false, "free block {} has no prev link", bp);
                return;
            }
        };

        match prev {
            Prev::Head(class) => self.heads[class.index()] = next,
            Prev::Block(p) => set_next(arena, p, next),
        }
        if let Some(n) = next {
            set_prev(arena, n, prev);
        }
    }

    /// Find a free block of at least `size` bytes.
    ///
    /// Lists are scanned from the class of `size` upward, each in link
    /// order; the first block that is actually large enough wins. The block
    /// is not removed from its list.
    pub fn find_fit<A: ArenaProvider + ?Sized>(&self, arena: &A, size: usize) -> Option<Addr> {
        class_of(size)
            .and_larger()
            .flat_map(|class| self.iter_class(arena, class))
            .find(|&bp| tag::header(arena, bp).size >= size)
    }

    /// Iterate over the blocks of one class, in list order.
    pub fn iter_class<'a, A: ArenaProvider + ?Sized>(
        &self,
        arena: &'a A,
        class: SizeClass,
    ) -> ClassIter<'a, A> {
        ClassIter {
            arena,
            next: self.head(class),
        }
    }

    /// Iterate over every listed block, by ascending class then list order.
    pub fn iter<'a, A: ArenaProvider + ?Sized>(
        &'a self,
        arena: &'a A,
    ) -> impl Iterator<Item = (SizeClass, Addr)> + 'a {
        SizeClass::all().flat_map(move |class| {
            self.iter_class(arena, class).map(move |bp| (class, bp))
        })
    }

    pub fn len<A: ArenaProvider + ?Sized>(&self, arena: &A) -> usize {
        self.iter(arena).count()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }

    /// Render the table for logging.
    pub fn display<'a, A: ArenaProvider + ?Sized>(&'a self, arena: &'a A) -> Listing<'a, A> {
        Listing {
            blocks: self,
            arena,
        }
    }
}

/// Iterator over one size class's list.
pub struct ClassIter<'a, A: ?Sized> {
    arena: &'a A,
    next: Option<Addr>,
}

impl<'a, A: ArenaProvider + ?Sized> Iterator for ClassIter<'a, A> {
    type Item = Addr;

    fn next(&mut self) -> Option<Addr> {
        let bp = self.next.take()?;
        self.next = next_free(self.arena, bp);
        Some(bp)
    }
}

/// A [`BlockList`] together with the arena its links live in.
pub struct Listing<'a, A: ?Sized> {
    blocks: &'a BlockList,
    arena: &'a A,
}

impl<'a, A: ArenaProvider + ?Sized> fmt::Display for Listing<'a, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for (class, bp) in self.blocks.iter(self.arena) {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let size = tag::header(self.arena, bp).size;
            write!(f, "{}: FreeBlock({}, {})", class.index(), bp, size)?;
        }

        write!(f, ")")
    }
}
