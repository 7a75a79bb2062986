//! Bump-pointer sub-allocator over non-contiguous page allocations.

use std::ptr::NonNull;
use std::sync::Arc;

use corvus_common::bits::divide_round_up;
use corvus_common::constants::PAGE_SIZE;
use corvus_common::MachinePageCount;

use crate::allocation::Allocation;
use crate::allocator::MemoryAllocator;
use crate::error::{MemoryError, MemoryResult};

/// Smallest underlying allocation, in pages.
const MIN_PAGES: MachinePageCount = 16;

/// A bump allocator that accumulates growing requests into a chain of
/// underlying page allocations.
///
/// Fixed-size requests carve bytes off the current page run. When the run
/// is exhausted the pool advances to the next run of the current underlying
/// allocation, or requests a new one of at least [`MIN_PAGES`] pages.
/// Requests larger than the largest size class get a dedicated multi-run
/// allocation and leave the bump cursor untouched; the returned pointer
/// covers the request only up to the end of its first run, which on a
/// lightly fragmented allocator is the whole of it.
pub struct AllocationPool {
    allocator: Arc<dyn MemoryAllocator>,
    allocations: Vec<Allocation>,
    current_run: usize,
    current_offset: u64,
    num_total_allocations: u64,
}

impl AllocationPool {
    /// Creates an empty pool over `allocator`.
    #[must_use]
    pub fn new(allocator: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            allocator,
            allocations: Vec::new(),
            current_run: 0,
            current_offset: 0,
            num_total_allocations: 0,
        }
    }

    /// Allocates `bytes` bytes from the pool.
    pub fn allocate_fixed(&mut self, bytes: u64) -> MemoryResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(MemoryError::invalid_argument("cannot allocate zero bytes"));
        }
        if self.available_in_run() >= bytes {
            return Ok(self.bump(bytes));
        }
        let num_pages = divide_round_up(bytes, PAGE_SIZE as u64);
        if num_pages > self.allocator.largest_size_class() {
            return self.allocate_oversized(num_pages);
        }
        self.next_run(num_pages, bytes)?;
        Ok(self.bump(bytes))
    }

    /// Releases all underlying allocations and resets the counters.
    pub fn clear(&mut self) {
        self.allocations.clear();
        self.current_run = 0;
        self.current_offset = 0;
        self.num_total_allocations = 0;
    }

    /// Number of underlying allocations made since the last clear.
    #[must_use]
    pub fn num_total_allocations(&self) -> u64 {
        self.num_total_allocations
    }

    /// Index of the run the bump cursor is in.
    #[must_use]
    pub fn current_run_index(&self) -> usize {
        self.current_run
    }

    /// Byte offset of the bump cursor within its run.
    #[must_use]
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    fn available_in_run(&self) -> u64 {
        match self.allocations.last() {
            Some(allocation) if !allocation.is_empty() => {
                allocation.run_at(self.current_run).num_bytes() - self.current_offset
            }
            _ => 0,
        }
    }

    fn bump(&mut self, bytes: u64) -> NonNull<u8> {
        let allocation = self.allocations.last().expect("pool has a current allocation");
        let run = allocation.run_at(self.current_run);
        // SAFETY: the cursor plus bytes fits the run, checked by callers.
        let pointer = unsafe { run.data().add(self.current_offset as usize) };
        self.current_offset += bytes;
        NonNull::new(pointer).expect("run addresses are non-null")
    }

    /// Advances the cursor to a run with at least `bytes` free, allocating
    /// a new underlying allocation if the current one is exhausted.
    fn next_run(&mut self, num_pages: MachinePageCount, bytes: u64) -> MemoryResult<()> {
        if let Some(allocation) = self.allocations.last() {
            let next = self.current_run + 1;
            if next < allocation.num_runs() && allocation.run_at(next).num_bytes() >= bytes {
                self.current_run = next;
                self.current_offset = 0;
                return Ok(());
            }
        }
        // A floor of the rounded-up page count makes the result a single
        // run, so the whole request is addressable from the run start.
        let mut allocation = Allocation::new(Arc::clone(&self.allocator));
        self.allocator
            .allocate_non_contiguous(num_pages.max(MIN_PAGES), &mut allocation, None, num_pages)?;
        self.allocations.push(allocation);
        self.num_total_allocations += 1;
        self.current_run = 0;
        self.current_offset = 0;
        Ok(())
    }

    /// Serves a request beyond the largest size class from a dedicated
    /// allocation, leaving the bump cursor where it is.
    fn allocate_oversized(&mut self, num_pages: MachinePageCount) -> MemoryResult<NonNull<u8>> {
        let largest = self.allocator.largest_size_class();
        let mut allocation = Allocation::new(Arc::clone(&self.allocator));
        self.allocator
            .allocate_non_contiguous(num_pages, &mut allocation, None, largest)?;
        self.num_total_allocations += 1;
        let pointer = allocation.run_at(0).as_non_null();
        if self.allocations.is_empty() {
            // No cursor exists yet; park it at the end of the new
            // allocation's last run so nothing bumps into the data.
            self.current_run = allocation.num_runs() - 1;
            self.current_offset = allocation.run_at(self.current_run).num_bytes();
            self.allocations.push(allocation);
        } else {
            // Keep the cursor's allocation last.
            let last = self.allocations.len() - 1;
            self.allocations.insert(last, allocation);
        }
        Ok(pointer)
    }
}

impl std::fmt::Debug for AllocationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationPool")
            .field("num_total_allocations", &self.num_total_allocations)
            .field("current_run", &self.current_run)
            .field("current_offset", &self.current_offset)
            .finish()
    }
}
