//! Pool error taxonomy.
//!
//! Exhaustion-class failures (`MapFailed`, `BookkeepingExhausted`) are the
//! only ones surfaced from allocation. `UnmapFailed` is a leak, not a
//! correctness problem, and is reported without aborting.

use thiserror::Error;

/// Errors produced by a [`crate::PoolSet`] or its [`crate::PageProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The requested class range cannot be represented.
    #[error(
        "invalid size-class range 2^{min_exp}..=2^{max_exp} \
         (need max >= min, cells >= one machine word, max < usize::BITS - 1)"
    )]
    InvalidClassRange { min_exp: u32, max_exp: u32 },

    /// The provider could not map `len` bytes.
    #[error("mapping {len} bytes failed (errno {errno})")]
    MapFailed { len: usize, errno: i32 },

    /// The provider rejected an unmap of `len` bytes. Non-fatal.
    #[error("unmapping {len} bytes at {addr:#x} failed (errno {errno})")]
    UnmapFailed { addr: usize, len: usize, errno: i32 },

    /// The arena registry is full at `capacity` live entries: either the
    /// configured `max_arenas` cap or a failed doubling.
    #[error("arena registry could not grow past {capacity} entries")]
    BookkeepingExhausted { capacity: usize },

    /// No registered arena owns `addr`.
    #[error("pointer {addr:#x} is not owned by any registered arena")]
    UnknownPointer { addr: usize },
}

impl PoolError {
    /// Returns true for failures caused by running out of memory or
    /// address space.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::MapFailed { .. } | Self::BookkeepingExhausted { .. }
        )
    }
}
