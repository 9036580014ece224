//! # mpool-core
//!
//! Fixed-size-class memory pool allocator.
//!
//! Small records are carved from power-of-two size classes whose free cells
//! form intrusive singly linked lists, so allocation and deallocation are
//! amortized O(1). Backing memory comes a page at a time from a
//! [`PageProvider`] (anonymous `mmap` by default) and is only returned when
//! the pool is torn down. Requests at or above the largest class bypass the
//! classes and are mapped and unmapped individually.
//!
//! ```text
//! PoolSet
//! ├── SizeClasses            2^min ..= 2^max, strict-greater classification
//! ├── FreeList × classes     intrusive LIFO heads
//! ├── ArenaRegistry          every arena ever mapped, for teardown
//! ├── PageProvider           mmap / munmap (substitutable)
//! └── PoolObserver           optional structured lifecycle log
//! ```
//!
//! `unsafe` is denied crate-wide and re-allowed only in the modules that
//! touch raw memory.

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod arena;
pub mod config;
pub mod error;
#[allow(unsafe_code)]
mod free_list;
pub mod log;
#[allow(unsafe_code)]
pub mod pool;
#[allow(unsafe_code)]
pub mod provider;
pub mod size_class;

pub use config::{LARGE_POLICY_ENV, LargePolicy, PoolConfig};
pub use error::PoolError;
pub use log::{JsonlObserver, PoolLogLevel, PoolLogRecord, PoolObserver, RecordingObserver};
pub use pool::{PoolSet, PoolStats, SizeLookup, TeardownReport};
pub use provider::{MmapProvider, PageProvider};
pub use size_class::SizeClasses;
