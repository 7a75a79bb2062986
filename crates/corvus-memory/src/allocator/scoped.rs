//! Tracker-scoped child allocators.

use std::sync::{Arc, Weak};

use corvus_common::MachinePageCount;

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::error::MemoryResult;
use crate::stats::Stats;
use crate::tracker::MemoryUsageTracker;

use super::{MemoryAllocator, ReservationCallback};

/// A child allocator sharing a backend and charging a usage tracker.
///
/// Every byte handed out through this handle is charged to the tracker
/// before the backend commits, and credited back when released. A tracker
/// cap violation fails the allocation with the backend fully rolled back.
pub struct ScopedAllocator {
    self_ref: Weak<ScopedAllocator>,
    parent: Arc<dyn MemoryAllocator>,
    usage_tracker: Arc<MemoryUsageTracker>,
}

impl ScopedAllocator {
    pub(crate) fn new(
        parent: Arc<dyn MemoryAllocator>,
        usage_tracker: Arc<MemoryUsageTracker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            parent,
            usage_tracker,
        })
    }
}

impl MemoryAllocator for ScopedAllocator {
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
        let tracker = &self.usage_tracker;
        let wrapped = move |delta: i64, pre_alloc: bool| -> MemoryResult<()> {
            tracker.update(if pre_alloc { delta } else { -delta })?;
            match reservation_cb {
                Some(cb) => cb(delta, pre_alloc),
                None => Ok(()),
            }
        };
        self.parent
            .allocate_non_contiguous(num_pages, out, Some(&wrapped), min_size_class)
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> u64 {
        let freed_bytes = self.parent.free_non_contiguous(allocation);
        if freed_bytes > 0 {
            self.usage_tracker.release(freed_bytes);
        }
        freed_bytes
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        out: &mut ContiguousAllocation,
        reservation_cb: Option<&ReservationCallback<'_>>,
    ) -> MemoryResult<()> {
        let tracker = &self.usage_tracker;
        let wrapped = move |delta: i64, pre_alloc: bool| -> MemoryResult<()> {
            tracker.update(if pre_alloc { delta } else { -delta })?;
            match reservation_cb {
                Some(cb) => cb(delta, pre_alloc),
                None => Ok(()),
            }
        };
        self.parent
            .allocate_contiguous(num_pages, collateral, out, Some(&wrapped))?;
        // Frees of the result must credit this scope, not the backend.
        out.set_owner(self.handle());
        Ok(())
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        let freed_bytes = allocation.size();
        self.parent.free_contiguous(allocation);
        if freed_bytes > 0 {
            self.usage_tracker.release(freed_bytes);
        }
    }

    fn size_classes(&self) -> &[MachinePageCount] {
        self.parent.size_classes()
    }

    fn num_allocated(&self) -> MachinePageCount {
        self.parent.num_allocated()
    }

    fn num_mapped(&self) -> MachinePageCount {
        self.parent.num_mapped()
    }

    fn stats(&self) -> Stats {
        self.parent.stats()
    }

    fn check_consistency(&self) -> bool {
        self.parent.check_consistency()
    }

    fn tracker(&self) -> Option<Arc<MemoryUsageTracker>> {
        Some(Arc::clone(&self.usage_tracker))
    }
}

impl std::fmt::Debug for ScopedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedAllocator")
            .field("tracker", &self.usage_tracker)
            .finish()
    }
}
