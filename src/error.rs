//! Errors reported by the heap and its arena providers.

use thiserror::Error;

/// Why an allocation (or heap initialization) could not be satisfied.
///
/// `E` is the error type of the [`ArenaProvider`](crate::allocators::ArenaProvider)
/// backing the heap. The infallible-looking entry points (`allocate`,
/// `resize`) log this and report an empty result instead.
#[derive(Debug, Error)]
pub enum HeapError<E> {
    /// The provider refused to extend the arena.
    #[error("arena provider could not grow: {0}")]
    Grow(E),

    /// Growing would push arena offsets past what a link word can hold.
    #[error("growing the arena by {requested} bytes would pass the {limit}-byte limit")]
    ArenaLimit { requested: usize, limit: usize },

    /// The request is larger than any arena could ever be.
    #[error("a {0}-byte request can never be satisfied")]
    TooLarge(usize),

    /// The heap must be laid out from the very start of its arena.
    #[error("arena already holds {0} bytes before heap initialization")]
    ArenaInUse(usize),
}
