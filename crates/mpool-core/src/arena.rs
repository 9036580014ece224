//! Arenas and the arena registry.
//!
//! An arena is one provider mapping cut into equal cells of a single size
//! class, or one whole bypass allocation. Every arena a pool creates is
//! recorded in the [`ArenaRegistry`] so teardown can hand it back.

use std::ptr::NonNull;

use serde::Serialize;

use crate::error::PoolError;
use crate::free_list;
use crate::provider::PageProvider;

/// A `(base, len, stride)` view of an arena, checked once at construction so
/// per-cell addressing needs no further bounds checks.
#[derive(Debug, Clone, Copy)]
pub struct ArenaSlice {
    base: NonNull<u8>,
    len: usize,
    stride: usize,
}

impl ArenaSlice {
    /// Returns `None` unless `stride` can hold a link word, `base` is
    /// aligned for one, and at least one whole cell fits in `len`.
    #[must_use]
    pub fn new(base: NonNull<u8>, len: usize, stride: usize) -> Option<Self> {
        let word = std::mem::align_of::<usize>();
        let fits = stride >= std::mem::size_of::<usize>()
            && stride % word == 0
            && (base.as_ptr() as usize) % word == 0
            && len >= stride;
        fits.then_some(Self { base, len, stride })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of whole cells.
    pub fn cell_count(&self) -> usize {
        self.len / self.stride
    }

    /// Cell start addresses in ascending order.
    pub fn cells(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        (0..self.cell_count()).map(move |i| {
            // SAFETY: i * stride + stride <= len, checked by construction.
            unsafe { self.base.add(i * self.stride) }
        })
    }

    /// True if `addr` falls inside the slice.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr - start < self.len
    }
}

/// Maps a new arena for `cell_size` cells and threads its free list.
///
/// At least `max(cell_size, nominal_len)` bytes are mapped so a cell larger
/// than the nominal arena still gets one whole cell. The returned slice's
/// base is the head of the new chain.
pub fn build_arena<P: PageProvider>(
    provider: &mut P,
    cell_size: usize,
    nominal_len: usize,
) -> Result<ArenaSlice, PoolError> {
    let len = cell_size.max(nominal_len);
    let base = provider.acquire(len)?;
    let Some(slice) = ArenaSlice::new(base, len, cell_size) else {
        // SAFETY: `base` was just acquired with `len` and never exposed.
        let _ = unsafe { provider.release(base, len) };
        return Err(PoolError::MapFailed {
            len,
            errno: libc::EINVAL,
        });
    };
    // SAFETY: the mapping is fresh and private to us.
    unsafe { free_list::thread_cells(&slice) };
    Ok(slice)
}

/// What an arena serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArenaKind {
    /// Cells of one size class.
    Class { class: usize, cell_size: usize },
    /// One tracked bypass allocation.
    Large,
}

/// One registry entry.
#[derive(Debug, Clone, Copy)]
pub struct ArenaRecord {
    /// Base address of the mapping.
    pub base: NonNull<u8>,
    /// Mapped length in bytes (exact request size for bypass allocations).
    pub len: usize,
    pub kind: ArenaKind,
    /// Set when a bypass allocation was released early by repool.
    pub released: bool,
}

impl ArenaRecord {
    pub fn class(slice: &ArenaSlice, class: usize) -> Self {
        Self {
            base: slice.base(),
            len: slice.len(),
            kind: ArenaKind::Class {
                class,
                cell_size: slice.stride(),
            },
            released: false,
        }
    }

    pub fn large(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            kind: ArenaKind::Large,
            released: false,
        }
    }

    fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// True if `addr` lies inside this arena.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr - self.start() < self.len
    }
}

/// Table of every arena a pool currently owns.
///
/// Capacity is tracked explicitly: it starts at the next power of two at or
/// above the class count and doubles when full. Slots of bypass allocations
/// released early are recycled by later registrations, so the table is
/// bounded by the peak number of live arenas.
#[derive(Debug)]
pub struct ArenaRegistry {
    records: Vec<ArenaRecord>,
    /// Indices of released slots, reused newest first.
    vacant: Vec<usize>,
    capacity: usize,
    limit: Option<usize>,
}

impl ArenaRegistry {
    /// Registry sized for `class_count` classes, optionally capped at `limit`
    /// live entries.
    pub fn new(class_count: usize, limit: Option<usize>) -> Result<Self, PoolError> {
        let capacity = class_count.max(1).next_power_of_two();
        let mut records = Vec::new();
        let mut vacant = Vec::new();
        records
            .try_reserve_exact(capacity)
            .and_then(|()| vacant.try_reserve_exact(capacity))
            .map_err(|_| PoolError::BookkeepingExhausted { capacity: 0 })?;
        Ok(Self {
            records,
            vacant,
            capacity,
            limit,
        })
    }

    /// Slots in use, including released slots awaiting reuse.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records still mapped.
    pub fn live_count(&self) -> usize {
        self.records.len() - self.vacant.len()
    }

    /// Current logical capacity (always a power of two).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArenaRecord> {
        self.records.iter()
    }

    /// Store a record in a released slot if one exists, otherwise append,
    /// doubling capacity when full.
    pub fn register(&mut self, record: ArenaRecord) -> Result<(), PoolError> {
        if let Some(limit) = self.limit.filter(|&limit| self.live_count() >= limit) {
            return Err(PoolError::BookkeepingExhausted { capacity: limit });
        }
        if let Some(index) = self.vacant.pop() {
            self.records[index] = record;
            return Ok(());
        }
        if self.records.len() == self.capacity {
            self.grow()?;
        }
        self.records.push(record);
        Ok(())
    }

    fn grow(&mut self) -> Result<(), PoolError> {
        let exhausted = PoolError::BookkeepingExhausted {
            capacity: self.capacity,
        };
        let Some(doubled) = self.capacity.checked_mul(2) else {
            return Err(exhausted);
        };
        self.records
            .try_reserve_exact(doubled - self.records.len())
            .map_err(|_| exhausted.clone())?;
        self.vacant
            .try_reserve_exact(doubled - self.vacant.len())
            .map_err(|_| exhausted)?;
        self.capacity = doubled;
        Ok(())
    }

    /// Reverse scan for the live record containing `addr`. Live records
    /// never overlap, so at most one matches.
    pub fn find_containing(&self, addr: usize) -> Option<(usize, &ArenaRecord)> {
        self.records
            .iter()
            .enumerate()
            .rev()
            .find(|(_, r)| !r.released && r.contains(addr))
    }

    /// Reverse scan for the live bypass allocation based at `addr`.
    pub fn find_large(&self, addr: usize) -> Option<usize> {
        self.records
            .iter()
            .rposition(|r| !r.released && r.kind == ArenaKind::Large && r.start() == addr)
    }

    /// Flag record `index` as already returned to the provider and make its
    /// slot available for reuse.
    pub fn mark_released(&mut self, index: usize) {
        if let Some(record) = self.records.get_mut(index) {
            if !record.released {
                record.released = true;
                self.vacant.push(index);
            }
        }
    }

    /// Records not yet released.
    pub fn live(&self) -> impl Iterator<Item = &ArenaRecord> {
        self.records.iter().filter(|r| !r.released)
    }

    /// Removes and returns every live record, leaving the registry empty.
    pub fn take_live(&mut self) -> Vec<ArenaRecord> {
        self.vacant.clear();
        let mut records = std::mem::take(&mut self.records);
        records.retain(|r| !r.released);
        records
    }
}
