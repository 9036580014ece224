//! Intrusive free lists.
//!
//! A free cell stores the address of the next free cell in its first machine
//! word; 0 marks the end of the list. Allocated cells belong to the caller
//! and are never read here. All link reads and writes go through [`Link`],
//! which only this module can construct.

use std::ptr::NonNull;

use crate::arena::ArenaSlice;

/// Typed view of the link word at the start of a free cell.
struct Link(NonNull<Option<NonNull<u8>>>);

impl Link {
    /// # Safety
    ///
    /// `cell` must be word-aligned, writable for one word, and currently
    /// free (not owned by a caller).
    unsafe fn of(cell: NonNull<u8>) -> Self {
        Self(cell.cast())
    }

    fn next(&self) -> Option<NonNull<u8>> {
        // SAFETY: `Link::of` guarantees an aligned, readable free cell.
        // `Option<NonNull<u8>>` has the layout of a nullable pointer.
        unsafe { self.0.as_ptr().read() }
    }

    fn set_next(&mut self, next: Option<NonNull<u8>>) {
        // SAFETY: as in `next`; the cell is free so no caller data is lost.
        unsafe { self.0.as_ptr().write(next) }
    }
}

/// Writes the links of a freshly mapped arena: every cell points at the cell
/// one stride later and the last cell holds the end-of-list sentinel.
///
/// # Safety
///
/// `slice` must describe writable memory that nothing else references.
pub(crate) unsafe fn thread_cells(slice: &ArenaSlice) {
    let mut cells = slice.cells().peekable();
    while let Some(cell) = cells.next() {
        // SAFETY: cells of a checked slice are in bounds and word-aligned;
        // the arena is fresh, so every cell is free.
        let mut link = unsafe { Link::of(cell) };
        link.set_next(cells.peek().copied());
    }
}

/// Head of one size class's free list.
///
/// Invariant: when present, the head and every cell reachable from it are
/// free cells inside registered arenas of this class.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<NonNull<u8>>,
}

impl FreeList {
    /// A list that has never had an arena.
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head(&self) -> Option<NonNull<u8>> {
        self.head
    }

    /// True when the head is the last free cell: popping it would leave the
    /// class without free cells.
    pub(crate) fn head_is_last(&self) -> bool {
        match self.head {
            // SAFETY: list invariant, the head is a free cell.
            Some(head) => unsafe { Link::of(head) }.next().is_none(),
            None => false,
        }
    }

    /// Install the first arena of an empty list.
    ///
    /// # Safety
    ///
    /// `base` must be the first cell of a chain built by [`thread_cells`]
    /// for this class.
    pub(crate) unsafe fn install(&mut self, base: NonNull<u8>) {
        debug_assert!(self.head.is_none());
        self.head = Some(base);
    }

    /// Chain a fresh arena behind the head cell, which must be the last
    /// free cell.
    ///
    /// # Safety
    ///
    /// Same contract as [`FreeList::install`].
    pub(crate) unsafe fn splice_after_head(&mut self, base: NonNull<u8>) {
        debug_assert!(self.head_is_last());
        if let Some(head) = self.head {
            // SAFETY: list invariant, the head is a free cell.
            let mut link = unsafe { Link::of(head) };
            link.set_next(Some(base));
        }
    }

    /// Pop the head cell. The next cell becomes the head.
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let head = self.head?;
        // SAFETY: list invariant, the head is a free cell.
        self.head = unsafe { Link::of(head) }.next();
        Some(head)
    }

    /// Push a returned cell (LIFO).
    ///
    /// # Safety
    ///
    /// `cell` must be a cell of this class previously returned by `pop`,
    /// not already on the list, and no longer used by the caller.
    pub(crate) unsafe fn push(&mut self, cell: NonNull<u8>) {
        // SAFETY: caller hands the cell back; it is free from here on.
        let mut link = unsafe { Link::of(cell) };
        link.set_next(self.head);
        self.head = Some(cell);
    }

    /// Walks the list. O(free cells); diagnostics only.
    pub(crate) fn count(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while let Some(cell) = cursor {
            n += 1;
            // SAFETY: list invariant.
            cursor = unsafe { Link::of(cell) }.next();
        }
        n
    }
}
