//! Pool configuration.
//!
//! The large-allocation policy is chosen once per pool. Its default comes
//! from the build (`manual-large` feature) and may be overridden through the
//! `MPOOL_LARGE_POLICY` environment variable when the config is built with
//! [`PoolConfig::from_env`]:
//! - `auto` (default): bypass allocations are registered so teardown releases
//!   them even if the caller never repools them.
//! - `manual`: bypass allocations are untracked; un-repooled ones leak.

use serde::Serialize;

use crate::error::PoolError;

/// Environment variable consulted by [`PoolConfig::from_env`].
pub const LARGE_POLICY_ENV: &str = "MPOOL_LARGE_POLICY";

/// How allocations at or above the largest class are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LargePolicy {
    /// Register bypass allocations for release at teardown.
    AutoTrack,
    /// Leave bypass allocations to the caller.
    Manual,
}

impl LargePolicy {
    /// Build-time default.
    #[must_use]
    pub const fn build_default() -> Self {
        if cfg!(feature = "manual-large") {
            Self::Manual
        } else {
            Self::AutoTrack
        }
    }

    /// Parse from string (case-insensitive). Unknown values fall back to the
    /// build-time default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "autotrack" | "auto_track" | "tracked" | "1" => Self::AutoTrack,
            "manual" | "untracked" | "off" | "0" => Self::Manual,
            _ => Self::build_default(),
        }
    }

    /// Returns true if bypass allocations enter the arena registry.
    #[must_use]
    pub const fn tracks_large(self) -> bool {
        matches!(self, Self::AutoTrack)
    }
}

impl Default for LargePolicy {
    fn default() -> Self {
        Self::build_default()
    }
}

/// Construction parameters for a [`crate::PoolSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    /// Smallest class is `2^min_class_exp` bytes.
    pub min_class_exp: u32,
    /// Largest class is `2^max_class_exp` bytes; requests of at least this
    /// many bytes bypass the classes.
    pub max_class_exp: u32,
    /// Bypass tracking policy.
    pub large_policy: LargePolicy,
    /// Cap on registered arenas. Registering past it fails with
    /// [`PoolError::BookkeepingExhausted`]. `None` means unbounded.
    pub max_arenas: Option<usize>,
}

impl PoolConfig {
    /// Default class range: 16 bytes to 2 KiB.
    pub const DEFAULT_MIN_CLASS_EXP: u32 = 4;
    pub const DEFAULT_MAX_CLASS_EXP: u32 = 11;

    /// Config for classes `2^min_class_exp ..= 2^max_class_exp` with the
    /// build-time large policy.
    #[must_use]
    pub fn new(min_class_exp: u32, max_class_exp: u32) -> Self {
        Self {
            min_class_exp,
            max_class_exp,
            large_policy: LargePolicy::default(),
            max_arenas: None,
        }
    }

    /// Replace the large policy.
    #[must_use]
    pub fn large_policy(mut self, policy: LargePolicy) -> Self {
        self.large_policy = policy;
        self
    }

    /// Cap the arena registry at `limit` entries.
    #[must_use]
    pub fn max_arenas(mut self, limit: usize) -> Self {
        self.max_arenas = Some(limit);
        self
    }

    /// Like [`PoolConfig::new`], but the large policy is read from
    /// `MPOOL_LARGE_POLICY` when set.
    #[must_use]
    pub fn from_env(min_class_exp: u32, max_class_exp: u32) -> Self {
        let policy = std::env::var(LARGE_POLICY_ENV)
            .map(|raw| LargePolicy::from_str_loose(&raw))
            .unwrap_or_default();
        Self::new(min_class_exp, max_class_exp).large_policy(policy)
    }

    /// Number of size classes; 0 for an inverted range.
    #[must_use]
    pub const fn class_count(&self) -> usize {
        if self.max_class_exp < self.min_class_exp {
            0
        } else {
            (self.max_class_exp - self.min_class_exp) as usize + 1
        }
    }

    /// Checks that every class can hold a free-list link and that the largest
    /// class size fits in `usize`.
    pub fn validate(&self) -> Result<(), PoolError> {
        let word = std::mem::size_of::<usize>();
        let ok = self.max_class_exp >= self.min_class_exp
            && self.max_class_exp < usize::BITS - 1
            && (1usize << self.min_class_exp) >= word;
        if ok {
            Ok(())
        } else {
            Err(PoolError::InvalidClassRange {
                min_exp: self.min_class_exp,
                max_exp: self.max_class_exp,
            })
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN_CLASS_EXP, Self::DEFAULT_MAX_CLASS_EXP)
    }
}
