//! The size-class index function.
//!
//! Free blocks are binned by size into [`NUM_CLASSES`] classes, in four tiers:
//!
//! ```text
//!   class   0   1   2  ...  61 |  62   63  ...   85 |   86   87  ...   100 |   101     102    103 ...
//!   size   16  24  32  ... 504 | 512  576  ... 1984 | 2048 4096 ... 30720 | 32761+  32768  65536 ...
//!          exact (step 8)      | linear (step 64)   | linear (step 2048)  | one per power of two
//! ```
//!
//! A class's lower bound is shown; each class runs up to the next one's.
//! Class 101 only spans 32761..=32767, which no block size (a multiple of 8)
//! falls in, so its list is always empty. The
//! mapping only has to be monotone: lookups check actual block sizes, so a
//! class may hold blocks both smaller and larger than a given request.

use core::fmt;

use static_assertions::const_assert_eq;

use crate::tag::{DSIZE, MIN_BLOCK_SIZE};

/// Number of single-size classes.
pub const EXACT_CLASSES: usize = 62;
/// Number of classes in the first linear tier.
pub const STEP_1_CLASSES: usize = 24;
pub const STEP_1: usize = 64;
/// Number of classes in the second linear tier.
pub const STEP_2_CLASSES: usize = 15;
pub const STEP_2: usize = 2048;

/// Largest size in the exact tier.
pub const MAX_EXACT: usize = (1 + EXACT_CLASSES) * DSIZE;
/// Largest size in the first linear tier.
pub const MAX_STEP_1: usize = MAX_EXACT + STEP_1 * STEP_1_CLASSES;
/// Largest size in the second linear tier. Anything bigger is binned by
/// power of two.
pub const MAX_STEP_2: usize = MAX_STEP_1 + STEP_2 * STEP_2_CLASSES;

const FIRST_LOG_CLASS: usize = EXACT_CLASSES + STEP_1_CLASSES + STEP_2_CLASSES;
// floor(log2) of the sizes just above MAX_STEP_2.
const FIRST_LOG_ORDER: usize = 14;

/// Total number of size classes.
pub const NUM_CLASSES: usize = 126;

const_assert_eq!(MAX_EXACT, 504);
const_assert_eq!(MAX_STEP_1, 2040);
const_assert_eq!(MAX_STEP_2, 32760);
const_assert_eq!(FIRST_LOG_CLASS, 101);

/// One of the free-list bins.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SizeClass(u8);

impl SizeClass {
    pub const SMALLEST: SizeClass = SizeClass(0);
    pub const LARGEST: SizeClass = SizeClass((NUM_CLASSES - 1) as u8);

    pub fn from_index(index: usize) -> Option<SizeClass> {
        if index < NUM_CLASSES {
            Some(SizeClass(index as u8))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// This class and every larger one, in ascending order.
    pub fn and_larger(self) -> impl Iterator<Item = SizeClass> {
        (self.index()..NUM_CLASSES).map(|i| SizeClass(i as u8))
    }

    /// All classes, in ascending order.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        SizeClass::SMALLEST.and_larger()
    }

    /// The smallest block size that maps to this class.
    ///
    /// For class 101 this is 32761, which is not a valid block size.
    pub fn min_size(self) -> usize {
        let i = self.index();
        if i < EXACT_CLASSES {
            MIN_BLOCK_SIZE + i * DSIZE
        } else if i < EXACT_CLASSES + STEP_1_CLASSES {
            MAX_EXACT + DSIZE + (i - EXACT_CLASSES) * STEP_1
        } else if i < FIRST_LOG_CLASS {
            MAX_STEP_1 + DSIZE + (i - EXACT_CLASSES - STEP_1_CLASSES) * STEP_2
        } else if i == FIRST_LOG_CLASS {
            MAX_STEP_2 + 1
        } else {
            1 << (i - FIRST_LOG_CLASS + FIRST_LOG_ORDER)
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {} ({}+)", self.0, self.min_size())
    }
}

/// Map a block size to its class.
///
/// Boundaries are inclusive on the lower tier. Sizes beyond what the last
/// class describes are clamped into it.
pub fn class_of(size: usize) -> SizeClass {
    let index = if size <= MAX_EXACT {
        (size / DSIZE).saturating_sub(2)
    } else if size <= MAX_STEP_1 {
        (size - MAX_EXACT).saturating_sub(DSIZE) / STEP_1 + EXACT_CLASSES
    } else if size <= MAX_STEP_2 {
        (size - MAX_STEP_1).saturating_sub(DSIZE) / STEP_2 + EXACT_CLASSES + STEP_1_CLASSES
    } else {
        let order = (usize::BITS - 1 - size.leading_zeros()) as usize;
        order - FIRST_LOG_ORDER + FIRST_LOG_CLASS
    };

    SizeClass(index.min(NUM_CLASSES - 1) as u8)
}
