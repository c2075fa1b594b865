//! Boundary tags.
//!
//! Every block in the arena carries a 4-byte header word directly before its
//! interior, and an identical 4-byte footer word at its very end:
//!
//! ```text
//!      header      interior (bp..)                      footer
//!   +---------+------------------------------------+---------+
//!   | size|a  |  payload, or next/prev links       | size|a  |
//!   +---------+------------------------------------+---------+
//!   ^ bp - 4  ^ bp                                 ^ bp + size - 8
//! ```
//!
//! The size is always a multiple of 8, so the low bit of a tag is free to
//! hold the "allocated" flag. Because both ends carry the same tag, the
//! blocks on either side of any block can be found in O(1): the next block
//! starts right after our footer, and the previous block's footer sits right
//! before our header.

use core::fmt;

use static_assertions::const_assert;

use crate::allocators::ArenaProvider;

/// Size of a header, footer, or link word.
pub const WSIZE: usize = 4;
/// Alignment of every block, and the combined size of header and footer.
pub const DSIZE: usize = 8;
/// Room for a header, a footer, and two links.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

const ALLOCATED_BIT: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

const_assert!(MIN_BLOCK_SIZE >= 2 * WSIZE + 2 * WSIZE);
const_assert!(DSIZE == 2 * WSIZE);

/// An offset into the arena, pointing at the interior of a block.
///
/// Offsets rather than pointers are used throughout, so that the memory
/// backing the arena never has to be named by address inside the allocator.
/// The interior of every real block is 8-byte aligned, and `Addr(0)` is never
/// a valid block, which lets a zero link word mean "no block".
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(u32);

impl Addr {
    /// Construct an address from a raw arena offset.
    ///
    /// Returns `None` for offsets that can't be the interior of a block:
    /// zero, misaligned, or beyond what a tag word can describe.
    pub fn from_offset(offset: usize) -> Option<Addr> {
        if offset == 0 || offset % DSIZE != 0 {
            return None;
        }
        u32::try_from(offset).ok().map(Addr)
    }

    pub(crate) const fn new_unchecked(offset: u32) -> Addr {
        Addr(offset)
    }

    pub const fn offset(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn add(self, bytes: usize) -> Addr {
        Addr(self.0 + bytes as u32)
    }

    pub(crate) fn sub(self, bytes: usize) -> Addr {
        Addr(self.0 - bytes as u32)
    }

    /// Offset of this block's header word.
    pub fn header(self) -> usize {
        self.offset() - WSIZE
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({:#x})", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A decoded boundary tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub size: usize,
    pub allocated: bool,
}

impl Tag {
    pub const fn free(size: usize) -> Tag {
        Tag {
            size,
            allocated: false,
        }
    }

    pub const fn allocated(size: usize) -> Tag {
        Tag {
            size,
            allocated: true,
        }
    }

    /// Pack a size and allocated bit into a word.
    pub fn pack(self) -> u32 {
        debug_assert_eq!(self.size % DSIZE, 0, "block sizes are multiples of 8");
        self.size as u32 | if self.allocated { ALLOCATED_BIT } else { 0 }
    }

    pub fn unpack(word: u32) -> Tag {
        Tag {
            size: (word & SIZE_MASK) as usize,
            allocated: word & ALLOCATED_BIT != 0,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.size, if self.allocated { 'a' } else { 'f' })
    }
}

pub fn header<A: ArenaProvider + ?Sized>(arena: &A, bp: Addr) -> Tag {
    Tag::unpack(arena.word(bp.header()))
}

/// Read the footer of `bp`, locating it through the size in the header.
pub fn footer<A: ArenaProvider + ?Sized>(arena: &A, bp: Addr) -> Tag {
    let size = header(arena, bp).size;
    Tag::unpack(arena.word(footer_offset(bp, size)))
}

fn footer_offset(bp: Addr, size: usize) -> usize {
    // A zero-sized block (the epilogue) has no footer of its own; this
    // resolves to its header.
    (bp.offset() + size).saturating_sub(DSIZE).max(bp.header())
}

/// Write identical header and footer tags for the block at `bp`.
pub fn write_tags<A: ArenaProvider + ?Sized>(arena: &mut A, bp: Addr, tag: Tag) {
    let word = tag.pack();
    arena.set_word(bp.header(), word);
    arena.set_word(footer_offset(bp, tag.size), word);
}

/// Write only a header, as used for the zero-sized epilogue.
pub fn write_header<A: ArenaProvider + ?Sized>(arena: &mut A, bp: Addr, tag: Tag) {
    arena.set_word(bp.header(), tag.pack());
}

/// The tag of the block physically before `bp`, read from its footer.
pub fn prev_footer<A: ArenaProvider + ?Sized>(arena: &A, bp: Addr) -> Tag {
    Tag::unpack(arena.word(bp.offset() - DSIZE))
}

/// The block physically after `bp`.
pub fn next_block<A: ArenaProvider + ?Sized>(arena: &A, bp: Addr) -> Addr {
    bp.add(header(arena, bp).size)
}

/// The block physically before `bp`.
pub fn prev_block<A: ArenaProvider + ?Sized>(arena: &A, bp: Addr) -> Addr {
    bp.sub(prev_footer(arena, bp).size)
}

/// Round `value` up to the nearest multiple of `increment`.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment).checked_add(1)?.checked_mul(increment)
}
