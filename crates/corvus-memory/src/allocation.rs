//! Page-run ownership types.
//!
//! An [`Allocation`] is an ordered set of page runs handed out by the
//! non-contiguous allocator; a [`ContiguousAllocation`] is a single
//! virtually-contiguous range. Both own their pages: dropping a non-empty
//! value releases the pages through the allocator handle it was created
//! with.

use std::ptr::NonNull;
use std::sync::Arc;

use corvus_common::constants::PAGE_SIZE;
use corvus_common::MachinePageCount;

use crate::allocator::MemoryAllocator;

/// A virtually-contiguous run of pages inside an [`Allocation`].
#[derive(Debug, Clone, Copy)]
pub struct PageRun {
    data: NonNull<u8>,
    num_pages: MachinePageCount,
}

// SAFETY: a PageRun refers to pages owned exclusively by its Allocation.
unsafe impl Send for PageRun {}
unsafe impl Sync for PageRun {}

impl PageRun {
    pub(crate) fn new(data: NonNull<u8>, num_pages: MachinePageCount) -> Self {
        debug_assert!(num_pages >= 1);
        debug_assert_eq!(data.as_ptr() as usize % PAGE_SIZE, 0);
        Self { data, num_pages }
    }

    /// Returns the base address of the run.
    #[inline]
    #[must_use]
    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub(crate) fn as_non_null(&self) -> NonNull<u8> {
        self.data
    }

    /// Returns the run length in pages.
    #[inline]
    #[must_use]
    pub fn num_pages(&self) -> MachinePageCount {
        self.num_pages
    }

    /// Returns the run length in bytes.
    #[inline]
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.num_pages * PAGE_SIZE as u64
    }
}

/// A non-contiguous page allocation: an ordered sequence of page runs.
///
/// Created with [`Allocation::new`] against the allocator that will serve
/// it. Moving an allocation transfers the runs and empties the source;
/// dropping a non-empty allocation releases its pages through the owner.
#[derive(Default)]
pub struct Allocation {
    owner: Option<Arc<dyn MemoryAllocator>>,
    runs: Vec<PageRun>,
    num_pages: MachinePageCount,
}

impl Allocation {
    /// Creates an empty allocation owned by `allocator`.
    #[must_use]
    pub fn new(allocator: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            owner: Some(allocator),
            runs: Vec::new(),
            num_pages: 0,
        }
    }

    /// Number of runs.
    #[inline]
    #[must_use]
    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    /// Total pages over all runs.
    #[inline]
    #[must_use]
    pub fn num_pages(&self) -> MachinePageCount {
        self.num_pages
    }

    /// Returns true if the allocation holds no pages.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Returns the run at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn run_at(&self, index: usize) -> PageRun {
        self.runs[index]
    }

    /// Returns the runs as a slice.
    #[must_use]
    pub fn runs(&self) -> &[PageRun] {
        &self.runs
    }

    /// Appends a run. Only meaningful while an allocation is being
    /// constructed; results handed to callers are structurally read-only
    /// until freed.
    ///
    /// # Panics
    ///
    /// Panics if `data` is null.
    pub fn append(&mut self, data: *mut u8, num_pages: MachinePageCount) {
        let data = NonNull::new(data).expect("run address must be non-null");
        self.runs.push(PageRun::new(data, num_pages));
        self.num_pages += num_pages;
    }

    /// Locates the run containing byte `offset` from the logical start of
    /// the allocation. Returns the run index and the offset within it.
    #[must_use]
    pub fn find_run(&self, offset: u64) -> Option<(usize, u64)> {
        let mut skipped = 0u64;
        for (index, run) in self.runs.iter().enumerate() {
            if offset < skipped + run.num_bytes() {
                return Some((index, offset - skipped));
            }
            skipped += run.num_bytes();
        }
        None
    }

    /// Forgets all runs without releasing pages. Only for construction and
    /// test contexts where the pages are not owned by an allocator.
    pub fn clear(&mut self) {
        self.runs.clear();
        self.num_pages = 0;
    }

    /// Empties the allocation and returns its runs. Counters are the
    /// caller's responsibility.
    pub(crate) fn take_runs(&mut self) -> Vec<PageRun> {
        self.num_pages = 0;
        std::mem::take(&mut self.runs)
    }

    /// Takes the runs and detaches the owner, so neither the returned runs
    /// nor the remaining value release anything on drop.
    pub(crate) fn disown(&mut self) -> Vec<PageRun> {
        self.owner = None;
        self.take_runs()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        match self.owner.take() {
            Some(owner) => {
                owner.free_non_contiguous(self);
            }
            None => {
                tracing::error!(
                    num_pages = self.num_pages,
                    "dropping non-empty allocation without an owner; pages leak"
                );
            }
        }
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("num_runs", &self.num_runs())
            .field("num_pages", &self.num_pages)
            .finish()
    }
}

/// A single virtually-contiguous page allocation.
#[derive(Default)]
pub struct ContiguousAllocation {
    owner: Option<Arc<dyn MemoryAllocator>>,
    data: Option<NonNull<u8>>,
    size: u64,
}

// SAFETY: the range is owned exclusively by this value.
unsafe impl Send for ContiguousAllocation {}
unsafe impl Sync for ContiguousAllocation {}

impl ContiguousAllocation {
    /// Creates an empty contiguous allocation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the base address, or null when empty.
    #[inline]
    #[must_use]
    pub fn data(&self) -> *mut u8 {
        self.data.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size in pages.
    #[inline]
    #[must_use]
    pub fn num_pages(&self) -> MachinePageCount {
        self.size / PAGE_SIZE as u64
    }

    /// Returns true if no range is held.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub(crate) fn set(&mut self, data: NonNull<u8>, size: u64) {
        self.data = Some(data);
        self.size = size;
    }

    pub(crate) fn set_owner(&mut self, owner: Arc<dyn MemoryAllocator>) {
        self.owner = Some(owner);
    }

    /// Empties the value, returning the held range if any. The owner link
    /// is left in place.
    pub(crate) fn take_parts(&mut self) -> Option<(NonNull<u8>, u64)> {
        let data = self.data.take()?;
        let size = self.size;
        self.size = 0;
        Some((data, size))
    }

    /// Empties the value and detaches the owner without releasing pages.
    pub(crate) fn release(&mut self) -> Option<(NonNull<u8>, u64)> {
        self.owner = None;
        self.take_parts()
    }
}

impl Drop for ContiguousAllocation {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        match self.owner.take() {
            Some(owner) => owner.free_contiguous(self),
            None => {
                tracing::error!(
                    size = self.size,
                    "dropping non-empty contiguous allocation without an owner; range leaks"
                );
            }
        }
    }
}

impl std::fmt::Debug for ContiguousAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContiguousAllocation")
            .field("size", &self.size)
            .finish()
    }
}
