//! The pool set: size-classed free lists over lazily mapped arenas.
//!
//! Small requests are served from per-class intrusive free lists. A class
//! gets its first arena on first use, and further arenas are chained behind
//! the last free cell when the list is about to run dry, so every class is
//! one continuous list however many arenas back it. Requests of at least the
//! largest class size go straight to the provider.
//!
//! The pool is single-threaded. It holds raw pointers and is therefore
//! neither `Send` nor `Sync`.

use std::ptr::{self, NonNull};

use serde::Serialize;

use crate::arena::{ArenaKind, ArenaRecord, ArenaRegistry, ArenaSlice, build_arena};
use crate::config::{LargePolicy, PoolConfig};
use crate::error::PoolError;
use crate::free_list::FreeList;
use crate::log::{Emitter, PoolLogLevel, PoolObserver};
use crate::provider::{MmapProvider, PageProvider};
use crate::size_class::SizeClasses;

/// What [`PoolSet::find_size_for_pointer`] learned about a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizeLookup {
    /// A cell of size class `class`.
    Class { class: usize, cell_size: usize },
    /// A tracked bypass allocation of exactly `len` bytes.
    Large { len: usize },
}

/// Outcome of [`PoolSet::teardown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Arenas handed back to the provider.
    pub released: usize,
    /// Bytes handed back (page-rounded lengths).
    pub released_bytes: usize,
    /// Releases the provider rejected. Each one is a leak.
    pub failures: Vec<PoolError>,
}

impl TeardownReport {
    /// True if every release succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub class_count: usize,
    pub min_class_size: usize,
    pub max_class_size: usize,
    pub page_size: usize,
    pub large_policy: LargePolicy,
    /// Registry slots in use, including released slots awaiting reuse.
    pub registered_arenas: usize,
    pub registry_capacity: usize,
    /// Registry entries still mapped.
    pub live_arenas: usize,
    /// Bytes mapped by live registry entries.
    pub mapped_bytes: usize,
    pub class_arena_builds: u64,
    pub bypass_allocs: u64,
    pub bypass_releases: u64,
    pub unmap_failures: u64,
    /// Per class: true if its free list currently has a cell.
    pub free_chains: Vec<bool>,
}

#[derive(Debug, Default)]
struct Counters {
    class_arena_builds: u64,
    bypass_allocs: u64,
    bypass_releases: u64,
    unmap_failures: u64,
}

/// A set of power-of-two size-class pools.
#[derive(Debug)]
pub struct PoolSet<P: PageProvider = MmapProvider> {
    classes: SizeClasses,
    page_size: usize,
    policy: LargePolicy,
    heads: Box<[FreeList]>,
    arenas: ArenaRegistry,
    provider: P,
    log: Emitter,
    counters: Counters,
    torn_down: bool,
}

impl PoolSet<MmapProvider> {
    /// Pool with classes `2^min_class_exp ..= 2^max_class_exp` backed by
    /// anonymous `mmap`.
    pub fn new(min_class_exp: u32, max_class_exp: u32) -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::new(min_class_exp, max_class_exp))
    }

    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_provider(config, MmapProvider::new())
    }
}

impl<P: PageProvider> PoolSet<P> {
    /// Pool drawing its arenas from `provider`.
    pub fn with_provider(config: PoolConfig, provider: P) -> Result<Self, PoolError> {
        config.validate()?;
        let classes = SizeClasses::new(config.min_class_exp, config.max_class_exp);
        let heads = (0..classes.count()).map(|_| FreeList::new()).collect();
        let arenas = ArenaRegistry::new(classes.count(), config.max_arenas)?;
        Ok(Self {
            classes,
            page_size: provider.page_size(),
            policy: config.large_policy,
            heads,
            arenas,
            provider,
            log: Emitter::new(None),
            counters: Counters::default(),
            torn_down: false,
        })
    }

    /// Install a lifecycle observer. Pools log nothing without one.
    #[must_use]
    pub fn with_observer(mut self, observer: impl PoolObserver + 'static) -> Self {
        self.log = Emitter::new(Some(Box::new(observer)));
        self.log.emit(
            PoolLogLevel::Info,
            "init",
            "init",
            None,
            Some(self.page_size),
            None,
            "success",
            format!(
                "classes={}..={};policy={:?}",
                self.classes.min_class_size(),
                self.classes.max_class_size(),
                self.policy
            ),
            self.arenas.len(),
        );
        self
    }

    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn large_policy(&self) -> LargePolicy {
        self.policy
    }

    /// Registry slots in use, including released bypass slots awaiting
    /// reuse.
    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    pub fn registry_capacity(&self) -> usize {
        self.arenas.capacity()
    }

    /// Free cells currently on `class`'s list. Walks the list.
    pub fn free_cells(&self, class: usize) -> usize {
        self.heads.get(class).map_or(0, FreeList::count)
    }

    /// Allocates `size` bytes.
    ///
    /// Sizes below the largest class come from a free list; larger sizes are
    /// mapped directly. The returned memory is uninitialized.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let Some(class) = self.classes.class_index(size) else {
            return self.allocate_large(size);
        };

        if self.heads[class].is_empty() {
            let slice = self.new_class_arena(class)?;
            // SAFETY: `slice` was threaded by `build_arena` for this class.
            unsafe { self.heads[class].install(slice.base()) };
        }
        if self.heads[class].head_is_last() {
            let slice = self.new_class_arena(class)?;
            // SAFETY: as above; the head is the last free cell.
            unsafe { self.heads[class].splice_after_head(slice.base()) };
        }

        // The list holds at least two cells here, so the pop always yields.
        let cell = self.heads[class].pop().ok_or_else(|| PoolError::MapFailed {
            len: self.classes.class_size(class),
            errno: libc::ENOMEM,
        })?;
        self.log.emit(
            PoolLogLevel::Trace,
            "allocate",
            "alloc",
            Some(cell.as_ptr() as usize),
            Some(size),
            Some(class),
            "success",
            "",
            self.arenas.len(),
        );
        Ok(cell)
    }

    /// Returns `ptr` to the pool.
    ///
    /// Sizes below the largest class push the cell onto its class list
    /// (LIFO); larger sizes are unmapped immediately. An unmap failure is
    /// logged and counted, never fatal.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`PoolSet::allocate`] (or [`PoolSet::resize`]) on
    /// this pool with a size in the same class as `size` (the exact same
    /// size for bypass allocations), must not have been repooled since, and
    /// must not be used afterwards. Violations corrupt the free lists.
    pub unsafe fn repool(&mut self, ptr: NonNull<u8>, size: usize) {
        match self.classes.class_index(size) {
            Some(class) => {
                // SAFETY: caller contract above.
                unsafe { self.push_cell(class, ptr, Some(size)) };
            }
            None => {
                // SAFETY: caller contract above.
                unsafe { self.release_large(ptr, size) };
            }
        }
    }

    /// Moves an allocation to one of `new_size` bytes, copying
    /// `min(old_size, new_size)` bytes. On failure `ptr` is untouched and
    /// still owned by the caller.
    ///
    /// # Safety
    ///
    /// Same contract as [`PoolSet::repool`] for `ptr` and `old_size`; `ptr`
    /// must be readable for `old_size` bytes.
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        let fresh = match self.allocate(new_size) {
            Ok(fresh) => fresh,
            Err(err) => {
                self.log.emit(
                    PoolLogLevel::Warn,
                    "resize",
                    "resize",
                    Some(ptr.as_ptr() as usize),
                    Some(new_size),
                    None,
                    "alloc_failed",
                    err.to_string(),
                    self.arenas.len(),
                );
                return Err(err);
            }
        };
        // SAFETY: `fresh` is a distinct live allocation of at least
        // `new_size` bytes; the caller guarantees `old_size` readable bytes
        // at `ptr`.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size.min(new_size));
            self.repool(ptr, old_size);
        }
        Ok(fresh)
    }

    /// Recovers the size of `ptr` by scanning the registry in reverse.
    ///
    /// O(arenas). Bypass allocations are only found under
    /// [`LargePolicy::AutoTrack`]. Interior pointers of bypass allocations
    /// and pointers off a cell boundary yield `None`.
    pub fn find_size_for_pointer(&self, ptr: NonNull<u8>) -> Option<SizeLookup> {
        let addr = ptr.as_ptr() as usize;
        let (_, record) = self.arenas.find_containing(addr)?;
        let offset = addr - record.base.as_ptr() as usize;
        match record.kind {
            ArenaKind::Class { class, cell_size } if offset % cell_size == 0 => {
                Some(SizeLookup::Class { class, cell_size })
            }
            ArenaKind::Large if offset == 0 => Some(SizeLookup::Large { len: record.len }),
            _ => None,
        }
    }

    /// Repools `ptr` without its size, using [`PoolSet::find_size_for_pointer`].
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this pool that has not been
    /// repooled and is not used afterwards.
    pub unsafe fn repool_unsized(&mut self, ptr: NonNull<u8>) -> Result<(), PoolError> {
        match self.find_size_for_pointer(ptr) {
            Some(SizeLookup::Class { class, .. }) => {
                // SAFETY: caller contract; the lookup confirmed the class.
                unsafe { self.push_cell(class, ptr, None) };
                Ok(())
            }
            Some(SizeLookup::Large { len }) => {
                // SAFETY: caller contract; `len` is the recorded size.
                unsafe { self.release_large(ptr, len) };
                Ok(())
            }
            None => {
                let err = PoolError::UnknownPointer {
                    addr: ptr.as_ptr() as usize,
                };
                self.log.emit(
                    PoolLogLevel::Warn,
                    "repool_unsized",
                    "lookup",
                    Some(ptr.as_ptr() as usize),
                    None,
                    None,
                    "unknown_pointer",
                    "",
                    self.arenas.len(),
                );
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            class_count: self.classes.count(),
            min_class_size: self.classes.min_class_size(),
            max_class_size: self.classes.max_class_size(),
            page_size: self.page_size,
            large_policy: self.policy,
            registered_arenas: self.arenas.len(),
            registry_capacity: self.arenas.capacity(),
            live_arenas: self.arenas.live_count(),
            mapped_bytes: self.arenas.live().map(|r| r.len).sum(),
            class_arena_builds: self.counters.class_arena_builds,
            bypass_allocs: self.counters.bypass_allocs,
            bypass_releases: self.counters.bypass_releases,
            unmap_failures: self.counters.unmap_failures,
            free_chains: self.heads.iter().map(|head| !head.is_empty()).collect(),
        }
    }

    /// Releases every arena and consumes the pool. All outstanding
    /// allocations become invalid.
    ///
    /// Dropping a pool performs the same release pass; call this to see
    /// the outcome.
    pub fn teardown(mut self) -> TeardownReport {
        self.release_all()
    }

    fn allocate_large(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let base = match self.provider.acquire(size) {
            Ok(base) => base,
            Err(err) => {
                self.log.emit(
                    PoolLogLevel::Warn,
                    "allocate",
                    "large_map",
                    None,
                    Some(size),
                    None,
                    "map_failed",
                    err.to_string(),
                    self.arenas.len(),
                );
                return Err(err);
            }
        };
        if self.policy.tracks_large() {
            if let Err(err) = self.arenas.register(ArenaRecord::large(base, size)) {
                // SAFETY: `base` was just acquired and never handed out.
                let _ = unsafe { self.release_region("allocate", base, size) };
                self.log_registry_failure("allocate", size, None, &err);
                return Err(err);
            }
        }
        self.counters.bypass_allocs += 1;
        self.log.emit(
            PoolLogLevel::Debug,
            "allocate",
            "large_map",
            Some(base.as_ptr() as usize),
            Some(size),
            None,
            "success",
            if self.policy.tracks_large() {
                "tracked"
            } else {
                "untracked"
            },
            self.arenas.len(),
        );
        Ok(base)
    }

    /// Maps, threads and registers one arena for `class`. On failure nothing
    /// stays mapped.
    fn new_class_arena(&mut self, class: usize) -> Result<ArenaSlice, PoolError> {
        let cell_size = self.classes.class_size(class);
        let slice = match build_arena(&mut self.provider, cell_size, self.page_size) {
            Ok(slice) => slice,
            Err(err) => {
                self.log.emit(
                    PoolLogLevel::Warn,
                    "allocate",
                    "arena_build",
                    None,
                    Some(cell_size),
                    Some(class),
                    "map_failed",
                    err.to_string(),
                    self.arenas.len(),
                );
                return Err(err);
            }
        };
        if let Err(err) = self.arenas.register(ArenaRecord::class(&slice, class)) {
            // SAFETY: the arena is not linked into any list yet.
            let _ = unsafe { self.release_region("allocate", slice.base(), slice.len()) };
            self.log_registry_failure("allocate", cell_size, Some(class), &err);
            return Err(err);
        }
        self.counters.class_arena_builds += 1;
        if self.log.enabled(PoolLogLevel::Debug) {
            self.log.emit(
                PoolLogLevel::Debug,
                "allocate",
                "arena_build",
                Some(slice.base().as_ptr() as usize),
                Some(slice.len()),
                Some(class),
                "success",
                format!("cells={};cell_size={cell_size}", slice.cell_count()),
                self.arenas.len(),
            );
        }
        Ok(slice)
    }

    /// # Safety
    ///
    /// `ptr` is a cell of `class` that the caller gives up.
    unsafe fn push_cell(&mut self, class: usize, ptr: NonNull<u8>, size: Option<usize>) {
        // SAFETY: forwarded caller contract.
        unsafe { self.heads[class].push(ptr) };
        self.log.emit(
            PoolLogLevel::Trace,
            "repool",
            "repool",
            Some(ptr.as_ptr() as usize),
            size,
            Some(class),
            "success",
            "",
            self.arenas.len(),
        );
    }

    /// # Safety
    ///
    /// `ptr` is a bypass allocation of `size` bytes that the caller gives up.
    unsafe fn release_large(&mut self, ptr: NonNull<u8>, size: usize) {
        if self.policy.tracks_large() {
            if let Some(index) = self.arenas.find_large(ptr.as_ptr() as usize) {
                self.arenas.mark_released(index);
            }
        }
        self.counters.bypass_releases += 1;
        // SAFETY: forwarded caller contract.
        if unsafe { self.release_region("repool", ptr, size) }.is_ok() {
            self.log.emit(
                PoolLogLevel::Debug,
                "repool",
                "large_unmap",
                Some(ptr.as_ptr() as usize),
                Some(size),
                None,
                "success",
                "",
                self.arenas.len(),
            );
        }
    }

    /// Hands a region back to the provider, logging and counting failures.
    ///
    /// # Safety
    ///
    /// Same as [`PageProvider::release`].
    unsafe fn release_region(
        &mut self,
        symbol: &'static str,
        base: NonNull<u8>,
        len: usize,
    ) -> Result<(), PoolError> {
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.provider.release(base, len) };
        if let Err(err) = &result {
            self.counters.unmap_failures += 1;
            self.log.emit(
                PoolLogLevel::Error,
                symbol,
                "unmap",
                Some(base.as_ptr() as usize),
                Some(len),
                None,
                "unmap_failed",
                err.to_string(),
                self.arenas.len(),
            );
        }
        result
    }

    fn log_registry_failure(
        &mut self,
        symbol: &'static str,
        size: usize,
        class: Option<usize>,
        err: &PoolError,
    ) {
        self.log.emit(
            PoolLogLevel::Warn,
            symbol,
            "register",
            None,
            Some(size),
            class,
            "bookkeeping_exhausted",
            err.to_string(),
            self.arenas.len(),
        );
    }

    fn release_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.torn_down {
            return report;
        }
        self.torn_down = true;
        for head in self.heads.iter_mut() {
            *head = FreeList::new();
        }
        for record in self.arenas.take_live() {
            let len = record.len.max(self.page_size);
            // SAFETY: every live record is a mapping this pool acquired and
            // has not released; the pool is being destroyed, so nothing
            // inside it is reachable through the pool any more.
            match unsafe { self.release_region("teardown", record.base, len) } {
                Ok(()) => {
                    report.released += 1;
                    report.released_bytes += len;
                }
                Err(err) => report.failures.push(err),
            }
        }
        self.log.emit(
            PoolLogLevel::Info,
            "teardown",
            "teardown",
            None,
            Some(report.released_bytes),
            None,
            if report.is_clean() { "success" } else { "leaked" },
            format!(
                "released={};failures={}",
                report.released,
                report.failures.len()
            ),
            0,
        );
        report
    }
}

impl<P: PageProvider> Drop for PoolSet<P> {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}
