//! Heap tuning.

use crate::tag::{DSIZE, MIN_BLOCK_SIZE};

/// By default the arena grows in 4 KiB steps.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

/// Settings for a [`RawAlloc`](crate::allocators::RawAlloc).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Config {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the minimum amount the arena grows by when no free block fits,
    /// and the size of the first free block created at initialization.
    ///
    /// Rounded up to a multiple of 8, and to at least the minimum block size.
    pub const fn with_chunk_size(mut self, bytes: usize) -> Self {
        let rounded = bytes.saturating_add(DSIZE - 1) & !(DSIZE - 1);
        self.chunk_size = if rounded < MIN_BLOCK_SIZE {
            MIN_BLOCK_SIZE
        } else {
            rounded
        };
        self
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_chunk_size_rounding() {
        assert_eq!(Config::new().chunk_size(), 4096);
        assert_eq!(Config::new().with_chunk_size(100).chunk_size(), 104);
        assert_eq!(Config::new().with_chunk_size(1).chunk_size(), MIN_BLOCK_SIZE);
        assert_eq!(Config::new().with_chunk_size(8192).chunk_size(), 8192);
    }
}
