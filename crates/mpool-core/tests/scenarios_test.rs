//! End-to-end pool behavior: class selection, chaining, bypass, resize and
//! teardown accounting.

#![allow(unsafe_code)]

mod common;

use std::ptr::NonNull;

use common::CountingProvider;
use mpool_core::{LargePolicy, MmapProvider, PageProvider, PoolConfig, PoolSet, SizeLookup};

fn auto_config() -> PoolConfig {
    PoolConfig::new(4, 11).large_policy(LargePolicy::AutoTrack)
}

fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    // SAFETY: callers pass live allocations of at least `len` bytes.
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) };
}

fn holds(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
    // SAFETY: as in `fill`.
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
    bytes.iter().all(|&b| b == byte)
}

#[test]
fn scenario_a_classes_bypass_and_reuse() {
    let mut pool = PoolSet::with_config(auto_config()).unwrap();

    let first = pool.allocate(10).unwrap();
    assert_eq!(
        pool.find_size_for_pointer(first),
        Some(SizeLookup::Class {
            class: 0,
            cell_size: 16
        })
    );

    let big = pool.allocate(2049).unwrap();
    assert_eq!(
        pool.find_size_for_pointer(big),
        Some(SizeLookup::Large { len: 2049 })
    );
    fill(big, 2049, 0xEE);
    assert!(holds(big, 2049, 0xEE));
    assert_eq!(pool.stats().bypass_allocs, 1);

    unsafe { pool.repool(first, 10) };
    assert_eq!(pool.allocate(12).unwrap(), first);

    let report = pool.teardown();
    assert!(report.is_clean());
    assert_eq!(report.released, 2);
}

#[test]
fn scenario_b_second_arena_is_chained() {
    let mut pool = PoolSet::new(4, 11).unwrap();
    let cells = pool.page_size() / 16;

    let ptrs: Vec<NonNull<u8>> = (0..=cells).map(|_| pool.allocate(10).unwrap()).collect();
    assert_eq!(ptrs.len(), cells + 1);
    assert_eq!(pool.arena_count(), 2);
    assert_eq!(pool.stats().class_arena_builds, 2);

    // Cells of one arena come out in address order.
    let base = ptrs[0].as_ptr() as usize;
    for (i, ptr) in ptrs.iter().take(cells).enumerate() {
        assert_eq!(ptr.as_ptr() as usize, base + i * 16);
    }
    let spill = ptrs[cells].as_ptr() as usize;
    assert!(spill < base || spill >= base + pool.page_size());
    assert_eq!(pool.free_cells(0), cells - 1);
}

#[test]
fn scenario_c_auto_tracked_large_released_at_teardown() {
    let (provider, ledger) = CountingProvider::new();
    let mut pool = PoolSet::with_provider(auto_config(), provider).unwrap();
    pool.allocate(3000).unwrap();
    pool.allocate(5000).unwrap();
    pool.allocate(10_000).unwrap();
    pool.allocate(100).unwrap();
    assert_eq!(ledger.acquired.get(), 4);

    let report = pool.teardown();
    assert!(report.is_clean());
    assert_eq!(report.released, 4);
    assert_eq!(ledger.outstanding(), 0);
}

#[test]
fn scenario_c_manual_large_leaks_without_repool() {
    let (provider, ledger) = CountingProvider::new();
    let config = PoolConfig::new(4, 11).large_policy(LargePolicy::Manual);
    let mut pool = PoolSet::with_provider(config, provider).unwrap();
    let sizes = [3000usize, 5000, 10_000];
    let leaked: Vec<NonNull<u8>> = sizes.iter().map(|&sz| pool.allocate(sz).unwrap()).collect();
    pool.allocate(100).unwrap();

    let report = pool.teardown();
    assert_eq!(report.released, 1);
    assert_eq!(ledger.outstanding(), 3);

    let mut os = MmapProvider::new();
    for (ptr, len) in leaked.into_iter().zip(sizes) {
        unsafe { os.release(ptr, len).unwrap() };
    }
}

#[test]
fn manual_large_repool_releases_immediately() {
    let (provider, ledger) = CountingProvider::new();
    let config = PoolConfig::new(4, 11).large_policy(LargePolicy::Manual);
    let mut pool = PoolSet::with_provider(config, provider).unwrap();
    let p = pool.allocate(4096).unwrap();
    unsafe { pool.repool(p, 4096) };
    assert_eq!(ledger.outstanding(), 0);
    assert!(pool.teardown().is_clean());
}

#[test]
fn eagerly_released_large_skipped_at_teardown() {
    let (provider, ledger) = CountingProvider::new();
    let mut pool = PoolSet::with_provider(auto_config(), provider).unwrap();
    let a = pool.allocate(8192).unwrap();
    let _b = pool.allocate(8192).unwrap();
    unsafe { pool.repool(a, 8192) };
    assert_eq!(ledger.released.get(), 1);

    let report = pool.teardown();
    assert_eq!(report.released, 1);
    assert_eq!(ledger.outstanding(), 0);
}

#[test]
fn every_class_size_is_usable_and_disjoint() {
    let mut pool = PoolSet::new(4, 11).unwrap();
    let max = pool.classes().max_class_size();
    let mut live: Vec<(usize, usize)> = Vec::new();
    for size in (0..max).step_by(7) {
        let ptr = pool.allocate(size).unwrap();
        fill(ptr, size, (size % 251) as u8);
        live.push((ptr.as_ptr() as usize, size));
    }
    for &(addr, size) in &live {
        let ptr = NonNull::new(addr as *mut u8).unwrap();
        assert!(holds(ptr, size, (size % 251) as u8), "size {size} clobbered");
    }
    live.sort_unstable();
    for pair in live.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }
}

#[test]
fn large_allocation_is_exact_and_distinct() {
    let mut pool = PoolSet::with_config(auto_config()).unwrap();
    let small = pool.allocate(1000).unwrap();
    for size in [2048usize, 2049, 4096, 65_537] {
        let ptr = pool.allocate(size).unwrap();
        assert_eq!(
            pool.find_size_for_pointer(ptr),
            Some(SizeLookup::Large { len: size })
        );
        assert_ne!(ptr, small);
        fill(ptr, size, 0x11);
        unsafe { pool.repool(ptr, size) };
    }
}

#[test]
fn resize_grow_preserves_prefix() {
    let mut pool = PoolSet::new(4, 11).unwrap();
    let p = pool.allocate(10).unwrap();
    fill(p, 10, 0xA5);
    let q = unsafe { pool.resize(p, 10, 100) }.unwrap();
    assert!(holds(q, 10, 0xA5));
    // The old cell went back on the 16-byte list.
    assert_eq!(pool.allocate(1).unwrap(), p);
}

#[test]
fn resize_shrink_and_through_bypass() {
    let mut pool = PoolSet::with_config(auto_config()).unwrap();
    let p = pool.allocate(300).unwrap();
    fill(p, 300, 0x3C);
    let big = unsafe { pool.resize(p, 300, 5000) }.unwrap();
    assert!(holds(big, 300, 0x3C));
    let small = unsafe { pool.resize(big, 5000, 20) }.unwrap();
    assert!(holds(small, 20, 0x3C));
    let stats = pool.stats();
    assert_eq!(stats.bypass_allocs, 1);
    assert_eq!(stats.bypass_releases, 1);
}

#[test]
fn churn_does_not_grow_arenas() {
    let mut pool = PoolSet::new(4, 11).unwrap();
    for _ in 0..10_000 {
        let p = pool.allocate(24).unwrap();
        unsafe { pool.repool(p, 24) };
    }
    assert_eq!(pool.stats().class_arena_builds, 1);

    let cells = pool.page_size() / 32;
    let high_water = cells + cells / 2;
    let mut builds_after_first_round = 0;
    for round in 0..50 {
        let ptrs: Vec<NonNull<u8>> = (0..high_water)
            .map(|_| pool.allocate(24).unwrap())
            .collect();
        for p in ptrs {
            unsafe { pool.repool(p, 24) };
        }
        if round == 0 {
            builds_after_first_round = pool.stats().class_arena_builds;
        }
    }
    assert_eq!(pool.stats().class_arena_builds, builds_after_first_round);
}

#[test]
fn exhaustion_is_reported_and_recoverable() {
    let (provider, ledger) = CountingProvider::new();
    ledger.budget.set(Some(0));
    let mut pool = PoolSet::with_provider(auto_config(), provider).unwrap();
    assert!(pool.allocate(10).unwrap_err().is_exhaustion());
    assert!(pool.allocate(10_000).unwrap_err().is_exhaustion());
    assert_eq!(pool.arena_count(), 0);

    ledger.budget.set(None);
    let p = pool.allocate(10).unwrap();
    unsafe { pool.repool(p, 10) };
    assert!(pool.teardown().is_clean());
    assert_eq!(ledger.outstanding(), 0);
}

#[test]
fn unmap_failures_are_reported_not_fatal() {
    let (provider, ledger) = CountingProvider::new();
    let mut pool = PoolSet::with_provider(auto_config(), provider).unwrap();
    pool.allocate(10).unwrap();
    let big = pool.allocate(3000).unwrap();
    ledger.fail_releases.set(true);
    unsafe { pool.repool(big, 3000) };
    assert_eq!(pool.stats().unmap_failures, 1);

    let report = pool.teardown();
    assert_eq!(report.released, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(!report.is_clean());
}

#[test]
fn registry_grows_by_doubling() {
    let mut pool = PoolSet::with_config(auto_config()).unwrap();
    assert_eq!(pool.registry_capacity(), 8);
    for _ in 0..20 {
        pool.allocate(4096).unwrap();
    }
    assert_eq!(pool.arena_count(), 20);
    assert_eq!(pool.registry_capacity(), 32);
    assert_eq!(pool.teardown().released, 20);
}

#[test]
fn cell_larger_than_page_gets_whole_cell() {
    let page = MmapProvider::new().page_size();
    let max_exp = (page * 8).ilog2();
    let mut pool = PoolSet::new(4, max_exp).unwrap();
    let size = page * 2 + 1;
    let p = pool.allocate(size).unwrap();
    fill(p, size, 0x77);
    let q = pool.allocate(size).unwrap();
    fill(q, size, 0x78);
    assert!(holds(p, size, 0x77));
    assert_eq!(
        pool.find_size_for_pointer(q),
        Some(SizeLookup::Class {
            class: pool.classes().class_index(size).unwrap(),
            cell_size: page * 4
        })
    );
}

#[test]
fn large_churn_under_arena_cap_never_exhausts() {
    let (provider, ledger) = CountingProvider::new();
    let config = auto_config().max_arenas(4);
    let mut pool = PoolSet::with_provider(config, provider).unwrap();
    let small = pool.allocate(10).unwrap();
    for cycle in 0..1000 {
        let a = pool
            .allocate(4096)
            .unwrap_or_else(|err| panic!("cycle {cycle}: {err}"));
        let b = pool.allocate(3000 + cycle).unwrap();
        unsafe {
            pool.repool(a, 4096);
            pool.repool(b, 3000 + cycle);
        }
    }
    let stats = pool.stats();
    assert_eq!(stats.registered_arenas, 3);
    assert_eq!(stats.live_arenas, 1);
    assert_eq!(stats.registry_capacity, 8);

    // Three live bypass allocations plus the class arena hit the cap.
    let held: Vec<NonNull<u8>> = (0..3).map(|_| pool.allocate(5000).unwrap()).collect();
    let err = pool.allocate(5000).unwrap_err();
    assert_eq!(err, mpool_core::PoolError::BookkeepingExhausted { capacity: 4 });
    unsafe { pool.repool(held[0], 5000) };
    pool.allocate(5000).unwrap();

    unsafe { pool.repool(small, 10) };
    assert!(pool.teardown().is_clean());
    assert_eq!(ledger.outstanding(), 0);
}

#[test]
fn unbounded_large_churn_keeps_registry_at_peak() {
    let mut pool = PoolSet::with_config(auto_config()).unwrap();
    for _ in 0..10_000 {
        let p = pool.allocate(8192).unwrap();
        unsafe { pool.repool(p, 8192) };
    }
    assert_eq!(pool.arena_count(), 1);
    assert_eq!(pool.registry_capacity(), 8);
}
