//! The page allocator interface and its backends.
//!
//! [`MemoryAllocator`] is the contract shared by the process-heap backend
//! ([`HeapAllocator`]), the mmap backend with advise-away semantics
//! ([`MmapAllocator`]), and tracker-scoped children ([`ScopedAllocator`]).
//! It carries the page API (non-contiguous and contiguous allocation) and
//! the byte-granularity facade layered on top of it.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use corvus_common::bits::divide_round_up;
use corvus_common::constants::{MALLOC_ALIGNMENT, MAX_MALLOC_BYTES, PAGE_SIZE};
use corvus_common::MachinePageCount;
use parking_lot::Mutex;

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::config::AllocatorOptions;
use crate::error::{MemoryError, MemoryResult};
use crate::stats::{self, ByteAllocClass, Stats};
use crate::tracker::MemoryUsageTracker;

mod heap;
mod mmap;
mod scoped;

pub use heap::HeapAllocator;
pub use mmap::{Failure, MmapAllocator};
pub use scoped::ScopedAllocator;

/// Callback observing byte reservations around backend work.
///
/// Invoked as `cb(delta, true)` with a signed byte delta before the backend
/// commits to an allocation; this application may fail (for example a
/// tracker cap) and aborts the operation. Invoked as `cb(delta, false)` to
/// reverse a previous application; reversals must not fail. Deltas are net
/// of any collateral released by the same call, so summing
/// `if pre { delta } else { -delta }` over all invocations yields the true
/// byte movement.
pub type ReservationCallback<'a> = dyn Fn(i64, bool) -> MemoryResult<()> + Sync + 'a;

/// A page-granularity memory allocator.
///
/// Implementations are created as `Arc` and handed around as
/// `Arc<dyn MemoryAllocator>`; allocations hold such a handle and release
/// their pages through it when dropped.
pub trait MemoryAllocator: Send + Sync {
    /// Returns an owning handle to this allocator.
    fn handle(&self) -> Arc<dyn MemoryAllocator>;

    /// Allocates at least `num_pages` pages as a set of size-class runs
    /// into `out`.
    ///
    /// A non-empty `out` is collateral: its pages are released before the
    /// new allocation is attempted and stay released if it fails. With
    /// `min_size_class > 0` every run is at least that many pages. On error
    /// `out` is empty and allocator counters are as before the call, modulo
    /// the released collateral.
    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation_cb: Option<&ReservationCallback<'_>>,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<()>;

    /// Releases every run of `allocation` back to its size class. Returns
    /// the number of bytes freed.
    fn free_non_contiguous(&self, allocation: &mut Allocation) -> u64;

    /// Allocates a single contiguous range of `num_pages` pages into `out`.
    ///
    /// `collateral` and a non-empty `out` are released first and their
    /// pages count against the new request. On any failure both are left
    /// observably empty and all counter changes beyond those releases are
    /// rolled back.
    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        out: &mut ContiguousAllocation,
        reservation_cb: Option<&ReservationCallback<'_>>,
    ) -> MemoryResult<()>;

    /// Releases a contiguous allocation.
    fn free_contiguous(&self, allocation: &mut ContiguousAllocation);

    /// The supported run sizes in pages, ascending.
    fn size_classes(&self) -> &[MachinePageCount];

    /// Pages currently handed out.
    fn num_allocated(&self) -> MachinePageCount;

    /// Pages currently backed by memory (mmap backend); equals
    /// [`Self::num_allocated`] for the heap backend.
    fn num_mapped(&self) -> MachinePageCount;

    /// Snapshot of per-size-class counters.
    fn stats(&self) -> Stats;

    /// Verifies internal bookkeeping. Call while no operation is in
    /// flight; violations are logged and make this return false.
    fn check_consistency(&self) -> bool;

    /// The usage tracker scoped to this allocator, if any.
    fn tracker(&self) -> Option<Arc<MemoryUsageTracker>> {
        None
    }

    /// The largest supported size class in pages.
    fn largest_size_class(&self) -> MachinePageCount {
        *self
            .size_classes()
            .last()
            .expect("size classes are never empty")
    }

    /// Creates a child allocator sharing this backend and charging the
    /// given tracker.
    fn add_child(&self, tracker: Arc<MemoryUsageTracker>) -> Arc<dyn MemoryAllocator> {
        ScopedAllocator::new(self.handle(), tracker)
    }

    /// Allocates `bytes` bytes, dispatching by size: small requests go to
    /// the process heap, medium ones to the size-classed page allocator as
    /// a single run, large ones to the contiguous allocator.
    ///
    /// The returned pointer must be released with [`Self::free_bytes`]
    /// using the same byte count.
    fn allocate_bytes(&self, bytes: u64) -> MemoryResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(MemoryError::invalid_argument("cannot allocate zero bytes"));
        }
        if bytes <= MAX_MALLOC_BYTES {
            let layout = small_layout(bytes)?;
            // SAFETY: layout has non-zero size.
            let pointer = unsafe { std::alloc::alloc(layout) };
            let pointer = NonNull::new(pointer).ok_or(MemoryError::OutOfCapacity {
                requested: bytes,
                available: 0,
            })?;
            stats::record_byte_alloc(ByteAllocClass::Small, bytes);
            return Ok(pointer);
        }
        let num_pages = divide_round_up(bytes, PAGE_SIZE as u64);
        if bytes <= self.largest_size_class() * PAGE_SIZE as u64 {
            // Asking for a minimum size class of the rounded-up page count
            // guarantees a single run.
            let mut allocation = Allocation::new(self.handle());
            self.allocate_non_contiguous(num_pages, &mut allocation, None, num_pages)?;
            debug_assert_eq!(allocation.num_runs(), 1);
            let runs = allocation.disown();
            stats::record_byte_alloc(ByteAllocClass::InSizeClasses, bytes);
            Ok(runs[0].as_non_null())
        } else {
            let mut allocation = ContiguousAllocation::new();
            self.allocate_contiguous(num_pages, None, &mut allocation, None)?;
            let (pointer, _len) = allocation
                .release()
                .expect("successful contiguous allocation is non-empty");
            stats::record_byte_alloc(ByteAllocClass::Large, bytes);
            Ok(pointer)
        }
    }

    /// Releases a pointer obtained from [`Self::allocate_bytes`] with the
    /// original request size.
    fn free_bytes(&self, pointer: NonNull<u8>, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if bytes <= MAX_MALLOC_BYTES {
            if let Ok(layout) = small_layout(bytes) {
                // SAFETY: allocated by allocate_bytes with this layout.
                unsafe { std::alloc::dealloc(pointer.as_ptr(), layout) };
            }
            stats::record_byte_free(ByteAllocClass::Small, bytes);
            return;
        }
        let num_pages = divide_round_up(bytes, PAGE_SIZE as u64);
        if bytes <= self.largest_size_class() * PAGE_SIZE as u64 {
            let run_pages = size_class_for(self.size_classes(), num_pages)
                .expect("facade sizes fit a size class");
            let mut allocation = Allocation::new(self.handle());
            allocation.append(pointer.as_ptr(), run_pages);
            self.free_non_contiguous(&mut allocation);
            stats::record_byte_free(ByteAllocClass::InSizeClasses, bytes);
        } else {
            let mut allocation = ContiguousAllocation::new();
            allocation.set(pointer, num_pages * PAGE_SIZE as u64);
            self.free_contiguous(&mut allocation);
            stats::record_byte_free(ByteAllocClass::Large, bytes);
        }
    }
}

fn small_layout(bytes: u64) -> MemoryResult<Layout> {
    Layout::from_size_align(bytes as usize, MALLOC_ALIGNMENT)
        .map_err(|_| MemoryError::invalid_argument("bad byte allocation size"))
}

/// Smallest size class that can hold `num_pages` as a single run.
pub(crate) fn size_class_for(
    sizes: &[MachinePageCount],
    num_pages: MachinePageCount,
) -> Option<MachinePageCount> {
    sizes.iter().copied().find(|size| *size >= num_pages)
}

/// How a request decomposes into size-class runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SizeMix {
    /// `(class index, run count)` pairs, larger classes first.
    pub classes: Vec<(usize, MachinePageCount)>,
    /// Total pages over all runs; at least the requested count.
    pub total_pages: MachinePageCount,
}

impl SizeMix {
    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_pages * PAGE_SIZE as u64
    }
}

/// Decomposes `num_pages` into size-class runs.
///
/// Starting from the largest class that fits, each class contributes as
/// many whole runs as fit into the remainder, stopping at the floor class
/// (the smallest class at least `min_size_class` pages). A leftover smaller
/// than the floor is promoted to one extra floor-sized run, so the result
/// overshoots the request by less than one floor run.
pub(crate) fn allocation_size(
    sizes: &[MachinePageCount],
    num_pages: MachinePageCount,
    min_size_class: MachinePageCount,
) -> SizeMix {
    let floor_index = sizes
        .iter()
        .position(|size| *size >= min_size_class)
        .unwrap_or(sizes.len() - 1);

    let mut classes: Vec<(usize, MachinePageCount)> = Vec::new();
    let mut remaining = num_pages;
    for index in (floor_index..sizes.len()).rev() {
        let size = sizes[index];
        if size > remaining {
            continue;
        }
        let count = remaining / size;
        classes.push((index, count));
        remaining -= count * size;
    }

    let mut total_pages = num_pages - remaining;
    if remaining > 0 {
        if let Some(entry) = classes.iter_mut().find(|(index, _)| *index == floor_index) {
            entry.1 += 1;
        } else {
            classes.push((floor_index, 1));
        }
        total_pages += sizes[floor_index];
    }
    SizeMix {
        classes,
        total_pages,
    }
}

/// Builds an allocator instance from options.
pub fn create_allocator(options: AllocatorOptions) -> MemoryResult<Arc<dyn MemoryAllocator>> {
    let instance: Arc<dyn MemoryAllocator> = if options.use_mmap {
        MmapAllocator::new(options)?
    } else {
        HeapAllocator::new(options)?
    };
    Ok(instance)
}

static DEFAULT_INSTANCE: Mutex<Option<Arc<dyn MemoryAllocator>>> = Mutex::new(None);

/// Installs (or with `None`, clears) the process-default allocator.
pub fn set_default_instance(instance: Option<Arc<dyn MemoryAllocator>>) {
    *DEFAULT_INSTANCE.lock() = instance;
}

/// Returns the process-default allocator, creating a heap-backed one with
/// default options on first use.
pub fn default_instance() -> MemoryResult<Arc<dyn MemoryAllocator>> {
    let mut guard = DEFAULT_INSTANCE.lock();
    if guard.is_none() {
        let instance: Arc<dyn MemoryAllocator> = HeapAllocator::new(AllocatorOptions::default())?;
        *guard = Some(instance);
    }
    Ok(Arc::clone(guard.as_ref().expect("instance installed above")))
}

/// Drops the process-default allocator. Test use only.
pub fn destroy_default_instance() {
    *DEFAULT_INSTANCE.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [MachinePageCount; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

    fn total(mix: &SizeMix, sizes: &[MachinePageCount]) -> MachinePageCount {
        mix.classes
            .iter()
            .map(|(index, count)| sizes[*index] * count)
            .sum()
    }

    #[test]
    fn test_exact_single_class() {
        let mix = allocation_size(&SIZES, 128, 0);
        assert_eq!(mix.classes, vec![(7, 1)]);
        assert_eq!(mix.total_pages, 128);
    }

    #[test]
    fn test_mixed_classes() {
        let mix = allocation_size(&SIZES, 300, 0);
        // 256 + 32 + 8 + 4 = 300, no rounding needed.
        assert_eq!(mix.total_pages, 300);
        assert_eq!(total(&mix, &SIZES), 300);
        for pair in mix.classes.windows(2) {
            assert!(pair[0].0 > pair[1].0);
        }
    }

    #[test]
    fn test_rounds_up_to_smallest_class() {
        let sizes = [4u64, 8, 16];
        let mix = allocation_size(&sizes, 3, 0);
        assert_eq!(mix.classes, vec![(0, 1)]);
        assert_eq!(mix.total_pages, 4);
    }

    #[test]
    fn test_min_size_class_floor() {
        // One page beyond the largest class with that class as the floor
        // yields two largest-class runs.
        let mix = allocation_size(&SIZES, 257, 256);
        assert_eq!(mix.classes, vec![(8, 2)]);
        assert_eq!(mix.total_pages, 512);
    }

    #[test]
    fn test_min_size_class_merges_floor_unit() {
        // 48 = 32 + 16 with floor 16; the remainder 0 adds nothing.
        let mix = allocation_size(&SIZES, 48, 16);
        assert_eq!(mix.total_pages, 48);
        // 40 with floor 16: one 32-run, remainder 8 promotes one 16-run.
        let mix = allocation_size(&SIZES, 40, 16);
        assert_eq!(mix.total_pages, 48);
        assert!(mix
            .classes
            .iter()
            .all(|(index, _)| SIZES[*index] >= 16));
    }

    #[test]
    fn test_size_class_for() {
        assert_eq!(size_class_for(&SIZES, 1), Some(1));
        assert_eq!(size_class_for(&SIZES, 3), Some(4));
        assert_eq!(size_class_for(&SIZES, 256), Some(256));
        assert_eq!(size_class_for(&SIZES, 257), None);
    }
}
