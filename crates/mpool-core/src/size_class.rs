//! Power-of-two size classes.
//!
//! Class `i` holds cells of `2^(min_exp + i)` bytes. A request of `size`
//! bytes lands in the smallest class whose cell size is strictly greater
//! than `size`, so a request of exactly 32 bytes is served from the 64-byte
//! class. Requests of at least the largest class size bypass the classes.

/// The class table of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    min_exp: u32,
    max_exp: u32,
}

impl SizeClasses {
    /// Table for classes `2^min_exp ..= 2^max_exp`. The range must already
    /// be validated (see [`crate::PoolConfig::validate`]).
    #[must_use]
    pub const fn new(min_exp: u32, max_exp: u32) -> Self {
        Self { min_exp, max_exp }
    }

    /// Number of classes; 0 for an inverted range.
    #[must_use]
    pub const fn count(&self) -> usize {
        if self.max_exp < self.min_exp {
            0
        } else {
            (self.max_exp - self.min_exp) as usize + 1
        }
    }

    /// Cell size of the smallest class.
    #[must_use]
    pub const fn min_class_size(&self) -> usize {
        1 << self.min_exp
    }

    /// Cell size of the largest class; also the bypass threshold.
    #[must_use]
    pub const fn max_class_size(&self) -> usize {
        1 << self.max_exp
    }

    /// Returns true if `size` is served by the large-allocation bypass.
    #[must_use]
    pub const fn is_bypass(&self, size: usize) -> bool {
        size >= self.max_class_size()
    }

    /// Class index for a request of `size` bytes, or `None` for bypass
    /// sizes.
    #[must_use]
    pub const fn class_index(&self, size: usize) -> Option<usize> {
        if self.is_bypass(size) {
            return None;
        }
        if size < self.min_class_size() {
            return Some(0);
        }
        // Smallest e with 2^e > size is ilog2(size) + 1.
        Some((size.ilog2() + 1 - self.min_exp) as usize)
    }

    /// Cell size of class `index`. Returns 0 for out-of-range indices.
    #[must_use]
    pub const fn class_size(&self, index: usize) -> usize {
        if index < self.count() {
            1 << (self.min_exp as usize + index)
        } else {
            0
        }
    }
}
