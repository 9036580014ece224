//! Arena provider: the only code that talks to the OS mapping facility.
//!
//! A [`PageProvider`] hands out anonymous, read/write, page-aligned regions
//! and takes them back. [`MmapProvider`] is the default and maps with
//! `mmap(MAP_PRIVATE | MAP_ANON)`. Pools accept any provider, which is how
//! tests and embedders substitute the page-acquisition primitive.

use std::ptr::{self, NonNull};

use crate::error::PoolError;

/// Page size assumed when `sysconf` cannot report one.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Source of raw backing memory for arenas and bypass allocations.
pub trait PageProvider {
    /// Bytes per OS page. Queried once when a pool is built.
    fn page_size(&self) -> usize;

    /// Map at least `len` bytes of zero-permission-safe (read/write),
    /// anonymous, page-aligned memory.
    ///
    /// Never returns a null pointer on success.
    fn acquire(&mut self, len: usize) -> Result<NonNull<u8>, PoolError>;

    /// Return a region to the OS.
    ///
    /// # Safety
    ///
    /// `base` must have been returned by [`PageProvider::acquire`] on this
    /// provider, must not have been released already, and `len` must not
    /// exceed the acquired length rounded up to a whole page. Nothing may
    /// access the region afterwards.
    unsafe fn release(&mut self, base: NonNull<u8>, len: usize) -> Result<(), PoolError>;
}

/// Anonymous private `mmap` provider.
#[derive(Debug, Clone, Copy)]
pub struct MmapProvider {
    page_size: usize,
}

impl MmapProvider {
    /// Creates a provider, querying the page size once.
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: query_page_size(),
        }
    }
}

impl Default for MmapProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn query_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

impl PageProvider for MmapProvider {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn acquire(&mut self, len: usize) -> Result<NonNull<u8>, PoolError> {
        if len == 0 {
            return Err(PoolError::MapFailed {
                len,
                errno: libc::EINVAL,
            });
        }
        // SAFETY: anonymous mapping with no fd and no fixed address; the
        // kernel picks a fresh region that aliases nothing we own.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(PoolError::MapFailed {
                len,
                errno: last_errno(),
            });
        }
        NonNull::new(raw.cast::<u8>()).ok_or(PoolError::MapFailed {
            len,
            errno: libc::EFAULT,
        })
    }

    unsafe fn release(&mut self, base: NonNull<u8>, len: usize) -> Result<(), PoolError> {
        // SAFETY: caller guarantees base/len describe a live mapping from
        // `acquire` that nothing references any more.
        let rc = unsafe { libc::munmap(base.as_ptr().cast(), len) };
        if rc == 0 {
            Ok(())
        } else {
            Err(PoolError::UnmapFailed {
                addr: base.as_ptr() as usize,
                len,
                errno: last_errno(),
            })
        }
    }
}
