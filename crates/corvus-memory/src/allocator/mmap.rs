//! Mmap backend with advise-away semantics.
//!
//! Each size class reserves address space for the full allocator capacity
//! up front (`MAP_NORESERVE`) and hands out class-sized units from it.
//! A unit is in one of three states: free-unmapped (address reserved, no
//! physical backing yet or backing advised away), free-mapped (backed from
//! an earlier use, reusable without touching the kernel), or allocated.
//!
//! `num_mapped` counts backed pages: mapped class units plus externally
//! mmapped contiguous allocations. When the mapped total would exceed its
//! cap, free-mapped units are advised away (lowest address first) to make
//! room, which is what lets freed-but-still-mapped class pages back later
//! contiguous allocations.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use corvus_common::constants::PAGE_SIZE;
use corvus_common::MachinePageCount;
use parking_lot::Mutex;

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::config::AllocatorOptions;
use crate::error::{MemoryError, MemoryResult, SyscallKind};
use crate::mapping::{self, MmapRegion};
use crate::stats::{ClassCounters, Stats};

use super::{allocation_size, MemoryAllocator, ReservationCallback};

/// Injectable backend failures. An armed failure fires exactly once, on the
/// next operation that would hit the corresponding primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Failure {
    /// Nothing armed.
    None = 0,
    /// Fail the next advise-away.
    Madvise = 1,
    /// Fail the next contiguous mmap.
    Mmap = 2,
    /// Fail the next non-contiguous allocation after reservation.
    Allocate = 3,
}

struct ClassState {
    free_mapped: BTreeSet<u32>,
    free_unmapped: BTreeSet<u32>,
    unit_mapped: Vec<bool>,
}

/// One size class: a full-capacity address reservation carved into
/// class-sized units.
struct SizeClass {
    unit_pages: MachinePageCount,
    num_units: usize,
    region: MmapRegion,
    state: Mutex<ClassState>,
    counters: ClassCounters,
}

impl SizeClass {
    fn new(unit_pages: MachinePageCount, num_units: usize) -> MemoryResult<Self> {
        let region = MmapRegion::anonymous(num_units * unit_pages as usize * PAGE_SIZE)?;
        Ok(Self {
            unit_pages,
            num_units,
            region,
            state: Mutex::new(ClassState {
                free_mapped: BTreeSet::new(),
                free_unmapped: (0..num_units as u32).collect(),
                unit_mapped: vec![false; num_units],
            }),
            counters: ClassCounters::new(),
        })
    }

    fn unit_bytes(&self) -> usize {
        self.unit_pages as usize * PAGE_SIZE
    }

    fn unit_address(&self, index: u32) -> *mut u8 {
        // SAFETY: index < num_units, so the offset stays inside the region.
        unsafe { self.region.base().add(index as usize * self.unit_bytes()) }
    }

    /// Grabs up to `count` free units, preferring already-mapped ones.
    /// Each entry records whether the unit still needs backing.
    fn take_units(&self, count: usize, taken: &mut Vec<(u32, bool)>) {
        let mut state = self.state.lock();
        for _ in 0..count {
            if let Some(index) = state.free_mapped.pop_first() {
                taken.push((index, false));
            } else if let Some(index) = state.free_unmapped.pop_first() {
                taken.push((index, true));
            } else {
                break;
            }
        }
    }

    /// Puts units grabbed by [`Self::take_units`] back, preserving their
    /// mapped state.
    fn return_units(&self, units: &[(u32, bool)]) {
        let mut state = self.state.lock();
        for (index, was_unmapped) in units {
            if *was_unmapped {
                state.free_unmapped.insert(*index);
            } else {
                state.free_mapped.insert(*index);
            }
        }
    }

    /// Marks freshly backed units as mapped. Call once the mapped-page
    /// budget covers them.
    fn commit_mapped(&self, units: &[(u32, bool)]) {
        let mut state = self.state.lock();
        for (index, was_unmapped) in units {
            if *was_unmapped {
                state.unit_mapped[*index as usize] = true;
            }
        }
    }

    /// Returns a run to the free lists. The run must cover whole units of
    /// this class. Freed units stay mapped.
    fn free_run(&self, address: *mut u8, run_pages: MachinePageCount) -> Option<MachinePageCount> {
        let offset = self.region.offset_of(address)?;
        if offset % self.unit_bytes() != 0 || run_pages % self.unit_pages != 0 {
            return None;
        }
        let first = (offset / self.unit_bytes()) as u32;
        let unit_count = (run_pages / self.unit_pages) as u32;
        if first as usize + unit_count as usize > self.num_units {
            return None;
        }
        let mut state = self.state.lock();
        for index in first..first + unit_count {
            if state.free_mapped.contains(&index) || state.free_unmapped.contains(&index) {
                tracing::error!(index, unit_pages = self.unit_pages, "double free of class unit");
                return None;
            }
        }
        for index in first..first + unit_count {
            if state.unit_mapped[index as usize] {
                state.free_mapped.insert(index);
            } else {
                state.free_unmapped.insert(index);
            }
        }
        Some(run_pages)
    }

    /// Advises away free-mapped units, lowest address first, until
    /// `max_pages` pages are released or none remain. Returns the pages
    /// actually advised and the error that stopped the sweep, if any.
    fn advise_away(
        &self,
        max_pages: MachinePageCount,
        should_inject: &dyn Fn() -> bool,
    ) -> (MachinePageCount, Option<MemoryError>) {
        let mut advised = 0;
        while advised < max_pages {
            let index = {
                let mut state = self.state.lock();
                match state.free_mapped.pop_first() {
                    Some(index) => index,
                    None => break,
                }
            };
            // The unit is in neither free list here, so no allocation can
            // grab it while the class lock is released for the syscall.
            let result = if should_inject() {
                Err(MemoryError::injected(SyscallKind::Madvise))
            } else {
                self.region
                    .advise_dont_need(index as usize * self.unit_bytes(), self.unit_bytes())
            };
            let mut state = self.state.lock();
            match result {
                Ok(()) => {
                    state.unit_mapped[index as usize] = false;
                    state.free_unmapped.insert(index);
                    advised += self.unit_pages;
                }
                Err(error) => {
                    state.free_mapped.insert(index);
                    return (advised, Some(error));
                }
            }
        }
        (advised, None)
    }

    /// Per-class accounting snapshot: `(allocated_pages, mapped_pages, ok)`.
    fn consistency(&self) -> (MachinePageCount, MachinePageCount, bool) {
        let state = self.state.lock();
        let mut ok = true;
        if state
            .free_mapped
            .intersection(&state.free_unmapped)
            .next()
            .is_some()
        {
            tracing::error!(unit_pages = self.unit_pages, "free lists overlap");
            ok = false;
        }
        for index in &state.free_mapped {
            if !state.unit_mapped[*index as usize] {
                tracing::error!(index, "free-mapped unit not flagged mapped");
                ok = false;
            }
        }
        for index in &state.free_unmapped {
            if state.unit_mapped[*index as usize] {
                tracing::error!(index, "free-unmapped unit flagged mapped");
                ok = false;
            }
        }
        let free_units = state.free_mapped.len() + state.free_unmapped.len();
        if free_units > self.num_units {
            tracing::error!(free_units, num_units = self.num_units, "too many free units");
            ok = false;
        }
        let allocated_units = self.num_units - free_units.min(self.num_units);
        let mapped_units = state.unit_mapped.iter().filter(|mapped| **mapped).count();
        (
            allocated_units as u64 * self.unit_pages,
            mapped_units as u64 * self.unit_pages,
            ok,
        )
    }
}

/// Size-classed page allocator over a bounded mmap-backed region.
pub struct MmapAllocator {
    self_ref: Weak<MmapAllocator>,
    capacity_pages: MachinePageCount,
    max_mapped_pages: MachinePageCount,
    size_class_sizes: Vec<MachinePageCount>,
    classes: Vec<SizeClass>,
    /// Class indices ordered by region base address, the advise-away scan
    /// order.
    advise_order: Vec<usize>,
    num_allocated: AtomicU64,
    num_mapped: AtomicU64,
    num_external_mapped: AtomicU64,
    /// Serializes mapped-budget checks and advise-away sweeps.
    mapped_lock: Mutex<()>,
    injected_failure: AtomicU8,
}

impl MmapAllocator {
    /// Creates an mmap-backed allocator.
    pub fn new(options: AllocatorOptions) -> MemoryResult<Arc<Self>> {
        options.validate()?;
        let capacity_pages = options.capacity_pages();
        let mut classes = Vec::with_capacity(options.size_classes.len());
        for size in &options.size_classes {
            classes.push(SizeClass::new(*size, (capacity_pages / size) as usize)?);
        }
        let mut advise_order: Vec<usize> = (0..classes.len()).collect();
        advise_order.sort_by_key(|index| classes[*index].region.base() as usize);
        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            capacity_pages,
            max_mapped_pages: options.max_mapped_pages.unwrap_or(capacity_pages),
            size_class_sizes: options.size_classes,
            classes,
            advise_order,
            num_allocated: AtomicU64::new(0),
            num_mapped: AtomicU64::new(0),
            num_external_mapped: AtomicU64::new(0),
            mapped_lock: Mutex::new(()),
            injected_failure: AtomicU8::new(Failure::None as u8),
        }))
    }

    /// Capacity in pages.
    #[must_use]
    pub fn capacity(&self) -> MachinePageCount {
        self.capacity_pages
    }

    /// Arms a one-shot failure.
    pub fn inject_failure(&self, failure: Failure) {
        self.injected_failure.store(failure as u8, Ordering::Release);
    }

    fn should_inject(&self, failure: Failure) -> bool {
        self.injected_failure
            .compare_exchange(
                failure as u8,
                Failure::None as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
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

    fn class_for(&self, address: *mut u8) -> Option<&SizeClass> {
        self.classes.iter().find(|class| class.region.contains(address))
    }

    /// Returns runs to their classes without touching `num_allocated`.
    fn free_internal(&self, allocation: &mut Allocation) -> MachinePageCount {
        let runs = allocation.take_runs();
        let mut freed = 0;
        for run in runs {
            let returned = self
                .class_for(run.data())
                .and_then(|class| class.free_run(run.data(), run.num_pages()));
            match returned {
                Some(pages) => freed += pages,
                None => {
                    tracing::error!(
                        address = run.data() as usize,
                        pages = run.num_pages(),
                        "freeing run outside any size class"
                    );
                }
            }
        }
        freed
    }

    /// Reserves `need` pages of mapped budget, advising away free-mapped
    /// class units when the cap would be exceeded.
    fn ensure_mapped_budget(&self, need: MachinePageCount) -> MemoryResult<()> {
        let _guard = self.mapped_lock.lock();
        loop {
            let mapped = self.num_mapped.load(Ordering::Acquire);
            if mapped + need <= self.max_mapped_pages {
                self.num_mapped.fetch_add(need, Ordering::AcqRel);
                return Ok(());
            }
            let mut target = mapped + need - self.max_mapped_pages;
            let mut advised_any = false;
            for class_index in &self.advise_order {
                if target == 0 {
                    break;
                }
                let class = &self.classes[*class_index];
                let (advised, error) =
                    class.advise_away(target, &|| self.should_inject(Failure::Madvise));
                if advised > 0 {
                    self.num_mapped.fetch_sub(advised, Ordering::AcqRel);
                    target = target.saturating_sub(advised);
                    advised_any = true;
                    tracing::debug!(
                        pages = advised,
                        unit_pages = class.unit_pages,
                        "advised away free class units"
                    );
                }
                if let Some(error) = error {
                    return Err(error);
                }
            }
            if !advised_any {
                let available = self
                    .max_mapped_pages
                    .saturating_sub(self.num_mapped.load(Ordering::Acquire));
                return Err(MemoryError::OutOfCapacity {
                    requested: need * PAGE_SIZE as u64,
                    available: available * PAGE_SIZE as u64,
                });
            }
        }
    }

    fn unmap_external(&self, allocation: &mut ContiguousAllocation) -> MachinePageCount {
        let Some((pointer, size)) = allocation.take_parts() else {
            return 0;
        };
        if let Err(error) = mapping::unmap(pointer, size as usize) {
            tracing::error!(%error, "failed to unmap contiguous allocation");
        }
        let pages = size / PAGE_SIZE as u64;
        self.num_allocated.fetch_sub(pages, Ordering::AcqRel);
        self.num_mapped.fetch_sub(pages, Ordering::AcqRel);
        self.num_external_mapped.fetch_sub(pages, Ordering::AcqRel);
        pages
    }
}

impl MemoryAllocator for MmapAllocator {
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

        let started = Instant::now();
        let mut taken: Vec<(usize, Vec<(u32, bool)>)> = Vec::with_capacity(mix.classes.len());
        let mut error: Option<MemoryError> = None;
        if self.should_inject(Failure::Allocate) {
            error = Some(MemoryError::injected(SyscallKind::Mmap));
        }
        if error.is_none() {
            for (class_index, count) in &mix.classes {
                let mut units = Vec::with_capacity(*count as usize);
                self.classes[*class_index].take_units(*count as usize, &mut units);
                let short = units.len() < *count as usize;
                taken.push((*class_index, units));
                if short {
                    error = Some(MemoryError::OutOfCapacity {
                        requested: mix.total_bytes(),
                        available: 0,
                    });
                    break;
                }
            }
        }
        if error.is_none() {
            let unmapped_pages: MachinePageCount = taken
                .iter()
                .map(|(class_index, units)| {
                    units.iter().filter(|(_, unmapped)| *unmapped).count() as u64
                        * self.classes[*class_index].unit_pages
                })
                .sum();
            if unmapped_pages > 0 {
                if let Err(budget_error) = self.ensure_mapped_budget(unmapped_pages) {
                    error = Some(budget_error);
                }
            }
        }
        if let Some(error) = error {
            for (class_index, units) in &taken {
                self.classes[*class_index].return_units(units);
            }
            self.release_reservation(mix.total_pages);
            if let Some(cb) = reservation_cb {
                let _ = cb(mix.total_bytes() as i64, false);
            }
            return Err(error);
        }

        let elapsed = started.elapsed();
        for (class_index, units) in &taken {
            let class = &self.classes[*class_index];
            class.commit_mapped(units);
            class
                .counters
                .record(units.len() as u64 * class.unit_pages * PAGE_SIZE as u64, elapsed);

            // Merge consecutive units into single runs so that a request
            // served from adjacent units stays virtually contiguous.
            let mut indices: Vec<u32> = units.iter().map(|(index, _)| *index).collect();
            indices.sort_unstable();
            let mut position = 0;
            while position < indices.len() {
                let start = indices[position];
                let mut span = 1;
                while position + span < indices.len()
                    && indices[position + span] == start + span as u32
                {
                    span += 1;
                }
                out.append(class.unit_address(start), span as u64 * class.unit_pages);
                position += span;
            }
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
                if pages > 0 {
                    self.release_reservation(pages);
                }
                pages
            }
            None => 0,
        };
        let large_pages = self.unmap_external(out);
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
        if let Err(error) = self.ensure_mapped_budget(num_pages) {
            self.release_reservation(num_pages);
            if let Some(cb) = reservation_cb {
                let _ = cb(new_bytes as i64, false);
            }
            return Err(error);
        }
        let mapped = if self.should_inject(Failure::Mmap) {
            Err(MemoryError::injected(SyscallKind::Mmap))
        } else {
            mapping::map_anonymous(new_bytes as usize)
        };
        match mapped {
            Ok(pointer) => {
                self.num_external_mapped.fetch_add(num_pages, Ordering::AcqRel);
                out.set(pointer, new_bytes);
                out.set_owner(self.handle());
                Ok(())
            }
            Err(error) => {
                self.num_mapped.fetch_sub(num_pages, Ordering::AcqRel);
                self.release_reservation(num_pages);
                if let Some(cb) = reservation_cb {
                    let _ = cb(new_bytes as i64, false);
                }
                Err(error)
            }
        }
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        self.unmap_external(allocation);
    }

    fn size_classes(&self) -> &[MachinePageCount] {
        &self.size_class_sizes
    }

    fn num_allocated(&self) -> MachinePageCount {
        self.num_allocated.load(Ordering::Acquire)
    }

    fn num_mapped(&self) -> MachinePageCount {
        self.num_mapped.load(Ordering::Acquire)
    }

    fn stats(&self) -> Stats {
        Stats {
            size_classes: self
                .classes
                .iter()
                .map(|class| class.counters.snapshot(class.unit_pages))
                .collect(),
        }
    }

    fn check_consistency(&self) -> bool {
        let mut ok = true;
        let mut class_allocated = 0;
        let mut class_mapped = 0;
        for class in &self.classes {
            let (allocated, mapped, class_ok) = class.consistency();
            class_allocated += allocated;
            class_mapped += mapped;
            ok &= class_ok;
        }
        let external = self.num_external_mapped.load(Ordering::Acquire);
        let allocated = self.num_allocated();
        let mapped = self.num_mapped();
        if class_allocated + external != allocated {
            tracing::error!(
                class_allocated,
                external,
                allocated,
                "allocated pages do not match class bookkeeping"
            );
            ok = false;
        }
        if class_mapped + external != mapped {
            tracing::error!(
                class_mapped,
                external,
                mapped,
                "mapped pages do not match class bookkeeping"
            );
            ok = false;
        }
        if allocated > self.capacity_pages {
            tracing::error!(allocated, capacity = self.capacity_pages, "over capacity");
            ok = false;
        }
        if mapped > self.max_mapped_pages {
            tracing::error!(mapped, max_mapped = self.max_mapped_pages, "over mapped cap");
            ok = false;
        }
        ok
    }
}

impl std::fmt::Debug for MmapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapAllocator")
            .field("capacity_pages", &self.capacity_pages)
            .field("num_allocated", &self.num_allocated())
            .field("num_mapped", &self.num_mapped())
            .finish()
    }
}
