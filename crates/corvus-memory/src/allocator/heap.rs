//! Process-heap backend.
//!
//! Serves size-class runs with individual heap allocations and contiguous
//! requests with fresh anonymous mappings. There is no advise-away
//! machinery; mapped pages equal allocated pages.

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use corvus_common::constants::PAGE_SIZE;
use corvus_common::MachinePageCount;
use parking_lot::Mutex;

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::config::AllocatorOptions;
use crate::error::{MemoryError, MemoryResult};
use crate::mapping;
use crate::stats::{ClassCounters, Stats};

use super::{allocation_size, MemoryAllocator, ReservationCallback};

/// Size-classed page allocator over the process heap.
pub struct HeapAllocator {
    self_ref: Weak<HeapAllocator>,
    capacity_pages: MachinePageCount,
    size_class_sizes: Vec<MachinePageCount>,
    num_allocated: AtomicU64,
    num_contiguous_pages: AtomicU64,
    /// Live run base addresses and their page counts.
    outstanding: Mutex<HashMap<usize, MachinePageCount>>,
    counters: Vec<ClassCounters>,
}

impl HeapAllocator {
    /// Creates a heap-backed allocator.
    pub fn new(options: AllocatorOptions) -> MemoryResult<Arc<Self>> {
        options.validate()?;
        let counters = options.size_classes.iter().map(|_| ClassCounters::new()).collect();
        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            capacity_pages: options.capacity_pages(),
            size_class_sizes: options.size_classes,
            num_allocated: AtomicU64::new(0),
            num_contiguous_pages: AtomicU64::new(0),
            outstanding: Mutex::new(HashMap::new()),
            counters,
        }))
    }

    /// Capacity in pages.
    #[must_use]
    pub fn capacity(&self) -> MachinePageCount {
        self.capacity_pages
    }

    fn run_layout(num_pages: MachinePageCount) -> Layout {
        Layout::from_size_align(num_pages as usize * PAGE_SIZE, PAGE_SIZE)
            .expect("run layout is valid")
    }

    fn try_reserve(&self, pages: MachinePageCount) -> bool {
        let mut current = self.num_allocated.load(Ordering::Relaxed);
        loop {
            if current + pages > self.capacity_pages {
                return false;
            }
            match self.num_allocated.compare_exchange_weak(
                current,
                current + pages,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_reservation(&self, pages: MachinePageCount) {
        self.num_allocated.fetch_sub(pages, Ordering::AcqRel);
    }

    /// Returns runs to the heap without touching `num_allocated`.
    fn free_internal(&self, allocation: &mut Allocation) -> MachinePageCount {
        let runs = allocation.take_runs();
        if runs.is_empty() {
            return 0;
        }
        let mut freed = 0;
        let mut outstanding = self.outstanding.lock();
        for run in runs {
            let address = run.data() as usize;
            match outstanding.remove(&address) {
                Some(pages) if pages == run.num_pages() => {
                    // SAFETY: allocated in allocate_non_contiguous with
                    // this exact layout.
                    unsafe { std::alloc::dealloc(run.data(), Self::run_layout(pages)) };
                    freed += pages;
                }
                other => {
                    if let Some(pages) = other {
                        outstanding.insert(address, pages);
                    }
                    tracing::error!(address, pages = run.num_pages(), "freeing unknown run");
                }
            }
        }
        freed
    }

    fn unmap_contiguous(&self, allocation: &mut ContiguousAllocation) -> MachinePageCount {
        let Some((pointer, size)) = allocation.take_parts() else {
            return 0;
        };
        if let Err(error) = mapping::unmap(pointer, size as usize) {
            tracing::error!(%error, "failed to unmap contiguous allocation");
        }
        let pages = size / PAGE_SIZE as u64;
        self.num_allocated.fetch_sub(pages, Ordering::AcqRel);
        self.num_contiguous_pages.fetch_sub(pages, Ordering::AcqRel);
        pages
    }
}

impl MemoryAllocator for HeapAllocator {
    fn handle(&self) -> Arc<dyn MemoryAllocator> {
        self.self_ref.upgrade().expect("allocator is alive")
    }

    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation_cb: Option<&ReservationCallback<'_>>,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<()> {
        if num_pages == 0 {
            return Err(MemoryError::invalid_argument("cannot allocate zero pages"));
        }
        let freed_pages = self.free_internal(out);
        if freed_pages > 0 {
            self.release_reservation(freed_pages);
        }
        let freed_bytes = freed_pages * PAGE_SIZE as u64;

        let mix = allocation_size(&self.size_class_sizes, num_pages, min_size_class);
        if !self.try_reserve(mix.total_pages) {
            if freed_pages > 0 {
                if let Some(cb) = reservation_cb {
                    let _ = cb(freed_bytes as i64, false);
                }
            }
            let available = self.capacity_pages.saturating_sub(self.num_allocated());
            return Err(MemoryError::OutOfCapacity {
                requested: mix.total_bytes(),
                available: available * PAGE_SIZE as u64,
            });
        }
        if let Some(cb) = reservation_cb {
            let delta = mix.total_bytes() as i64 - freed_bytes as i64;
            if let Err(error) = cb(delta, true) {
                self.release_reservation(mix.total_pages);
                if freed_pages > 0 {
                    let _ = cb(freed_bytes as i64, false);
                }
                return Err(error);
            }
        }

        let mut failed = false;
        for (class_index, count) in &mix.classes {
            let class_pages = self.size_class_sizes[*class_index];
            let started = Instant::now();
            for _ in 0..*count {
                // SAFETY: non-zero page-aligned layout.
                let pointer = unsafe { std::alloc::alloc(Self::run_layout(class_pages)) };
                match NonNull::new(pointer) {
                    Some(pointer) => {
                        self.outstanding
                            .lock()
                            .insert(pointer.as_ptr() as usize, class_pages);
                        out.append(pointer.as_ptr(), class_pages);
                    }
                    None => {
                        failed = true;
                        break;
                    }
                }
            }
            self.counters[*class_index]
                .record(count * class_pages * PAGE_SIZE as u64, started.elapsed());
            if failed {
                break;
            }
        }
        if failed {
            self.free_internal(out);
            self.release_reservation(mix.total_pages);
            if let Some(cb) = reservation_cb {
                let _ = cb(mix.total_bytes() as i64, false);
            }
            return Err(MemoryError::OutOfCapacity {
                requested: mix.total_bytes(),
                available: 0,
            });
        }
        Ok(())
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> u64 {
        let freed_pages = self.free_internal(allocation);
        if freed_pages > 0 {
            self.release_reservation(freed_pages);
        }
        freed_pages * PAGE_SIZE as u64
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        out: &mut ContiguousAllocation,
        reservation_cb: Option<&ReservationCallback<'_>>,
    ) -> MemoryResult<()> {
        if num_pages == 0 {
            return Err(MemoryError::invalid_argument("cannot allocate zero pages"));
        }
        let collateral_pages = match collateral {
            Some(collateral) => {
                let pages = self.free_internal(collateral);
                self.release_reservation(pages);
                pages
            }
            None => 0,
        };
        let large_pages = self.unmap_contiguous(out);
        let freed_bytes = (collateral_pages + large_pages) * PAGE_SIZE as u64;
        let new_bytes = num_pages * PAGE_SIZE as u64;

        if let Some(cb) = reservation_cb {
            let delta = new_bytes as i64 - freed_bytes as i64;
            if let Err(error) = cb(delta, true) {
                if freed_bytes > 0 {
                    let _ = cb(freed_bytes as i64, false);
                }
                return Err(error);
            }
        }
        if !self.try_reserve(num_pages) {
            if let Some(cb) = reservation_cb {
                let _ = cb(new_bytes as i64, false);
            }
            let available = self.capacity_pages.saturating_sub(self.num_allocated());
            return Err(MemoryError::OutOfCapacity {
                requested: new_bytes,
                available: available * PAGE_SIZE as u64,
            });
        }
        match mapping::map_anonymous(new_bytes as usize) {
            Ok(pointer) => {
                self.num_contiguous_pages.fetch_add(num_pages, Ordering::AcqRel);
                out.set(pointer, new_bytes);
                out.set_owner(self.handle());
                Ok(())
            }
            Err(error) => {
                self.release_reservation(num_pages);
                if let Some(cb) = reservation_cb {
                    let _ = cb(new_bytes as i64, false);
                }
                Err(error)
            }
        }
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        self.unmap_contiguous(allocation);
    }

    fn size_classes(&self) -> &[MachinePageCount] {
        &self.size_class_sizes
    }

    fn num_allocated(&self) -> MachinePageCount {
        self.num_allocated.load(Ordering::Acquire)
    }

    fn num_mapped(&self) -> MachinePageCount {
        self.num_allocated()
    }

    fn stats(&self) -> Stats {
        Stats {
            size_classes: self
                .counters
                .iter()
                .zip(&self.size_class_sizes)
                .map(|(counters, size)| counters.snapshot(*size))
                .collect(),
        }
    }

    fn check_consistency(&self) -> bool {
        let run_pages: MachinePageCount = self.outstanding.lock().values().sum();
        let contiguous = self.num_contiguous_pages.load(Ordering::Acquire);
        let allocated = self.num_allocated();
        let mut ok = true;
        if run_pages + contiguous != allocated {
            tracing::error!(
                run_pages,
                contiguous,
                allocated,
                "allocated pages do not match outstanding runs"
            );
            ok = false;
        }
        if allocated > self.capacity_pages {
            tracing::error!(allocated, capacity = self.capacity_pages, "over capacity");
            ok = false;
        }
        ok
    }
}

impl std::fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("capacity_pages", &self.capacity_pages)
            .field("num_allocated", &self.num_allocated())
            .finish()
    }
}
