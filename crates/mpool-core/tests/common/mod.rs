#![allow(dead_code, unsafe_code)]

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use mpool_core::{MmapProvider, PageProvider, PoolError};

/// Resource accounting shared between a test and the provider it lent to a
/// pool.
#[derive(Debug, Default)]
pub struct Ledger {
    pub acquired: Cell<usize>,
    pub released: Cell<usize>,
    pub acquired_bytes: Cell<usize>,
    /// Remaining successful acquires; `None` means unlimited.
    pub budget: Cell<Option<usize>>,
    /// Make every release fail after unmapping.
    pub fail_releases: Cell<bool>,
}

impl Ledger {
    pub fn outstanding(&self) -> usize {
        self.acquired.get() - self.released.get()
    }
}

/// Mmap provider that records every acquire and release in a [`Ledger`].
#[derive(Debug)]
pub struct CountingProvider {
    inner: MmapProvider,
    pub ledger: Rc<Ledger>,
}

impl CountingProvider {
    pub fn new() -> (Self, Rc<Ledger>) {
        let ledger = Rc::new(Ledger::default());
        (
            Self {
                inner: MmapProvider::new(),
                ledger: Rc::clone(&ledger),
            },
            ledger,
        )
    }
}

impl PageProvider for CountingProvider {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn acquire(&mut self, len: usize) -> Result<NonNull<u8>, PoolError> {
        if let Some(left) = self.ledger.budget.get() {
            if left == 0 {
                return Err(PoolError::MapFailed {
                    len,
                    errno: 12, // ENOMEM
                });
            }
            self.ledger.budget.set(Some(left - 1));
        }
        let base = self.inner.acquire(len)?;
        self.ledger.acquired.set(self.ledger.acquired.get() + 1);
        self.ledger
            .acquired_bytes
            .set(self.ledger.acquired_bytes.get() + len);
        Ok(base)
    }

    unsafe fn release(&mut self, base: NonNull<u8>, len: usize) -> Result<(), PoolError> {
        // SAFETY: forwarded from the pool.
        unsafe { self.inner.release(base, len)? };
        self.ledger.released.set(self.ledger.released.get() + 1);
        if self.ledger.fail_releases.get() {
            return Err(PoolError::UnmapFailed {
                addr: base.as_ptr() as usize,
                len,
                errno: 22,
            });
        }
        Ok(())
    }
}

/// Deterministic xorshift generator for reproducible churn.
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in `0..bound`.
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}
