//! End-to-end allocator scenarios covering both backends.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use corvus_common::constants::{MAX_MALLOC_BYTES, PAGE_SIZE};
use corvus_common::MachinePageCount;
use corvus_memory::{
    allocate_bytes_stats, create_allocator, default_instance, destroy_default_instance,
    set_default_instance, testing_clear_allocate_bytes_stats, Allocation, AllocationPool,
    AllocatorOptions, ContiguousAllocation, Failure, MemoryAllocator, MemoryUsageTracker,
    MmapAllocator, TypedAllocator,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CAPACITY_BYTES: u64 = 128 * 1024 * 1024;
const CAPACITY_PAGES: MachinePageCount = CAPACITY_BYTES / PAGE_SIZE as u64;

/// Serializes tests that touch process-global state (byte-allocation stats
/// and the default instance registry).
static GLOBAL_STATE_LOCK: Mutex<()> = Mutex::new(());

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn options(use_mmap: bool) -> AllocatorOptions {
    AllocatorOptions::new(CAPACITY_BYTES).with_mmap(use_mmap)
}

fn instance(use_mmap: bool) -> Arc<dyn MemoryAllocator> {
    create_allocator(options(use_mmap)).unwrap()
}

fn mmap_instance() -> Arc<MmapAllocator> {
    MmapAllocator::new(options(true)).unwrap()
}

/// Writes a sparse pattern over every run, unique per call.
fn initialize_contents(allocation: &Allocation) -> u64 {
    let seed = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    for run in allocation.runs() {
        let words = run.num_bytes() as usize / 8;
        let data = run.data() as *mut u64;
        // SAFETY: the run spans `words` u64 slots.
        unsafe {
            let mut index = 0;
            while index < words {
                data.add(index).write(seed ^ index as u64);
                index += 64;
            }
            data.add(words - 1).write(seed ^ (words - 1) as u64);
        }
    }
    seed
}

fn check_contents(allocation: &Allocation, seed: u64) {
    for run in allocation.runs() {
        let words = run.num_bytes() as usize / 8;
        let data = run.data() as *mut u64;
        // SAFETY: same spans as in initialize_contents.
        unsafe {
            let mut index = 0;
            while index < words {
                assert_eq!(data.add(index).read(), seed ^ index as u64);
                index += 64;
            }
            assert_eq!(data.add(words - 1).read(), seed ^ (words - 1) as u64);
        }
    }
}

/// An allocation paired with the pattern written into it.
struct Checked {
    allocation: Allocation,
    seed: u64,
}

fn allocate(
    instance: &Arc<dyn MemoryAllocator>,
    num_pages: MachinePageCount,
) -> Option<Checked> {
    let mut allocation = Allocation::new(Arc::clone(instance));
    match instance.allocate_non_contiguous(num_pages, &mut allocation, None, 0) {
        Ok(()) => {
            assert!(allocation.num_pages() >= num_pages);
            let seed = initialize_contents(&allocation);
            Some(Checked { allocation, seed })
        }
        Err(_) => {
            assert_eq!(allocation.num_runs(), 0);
            None
        }
    }
}

fn free(instance: &Arc<dyn MemoryAllocator>, mut checked: Checked) {
    check_contents(&checked.allocation, checked.seed);
    instance.free_non_contiguous(&mut checked.allocation);
}

// The pool bumps within a run, grows when a run is exhausted, and parks
// oversized requests in their own allocation without moving the cursor.
#[test]
fn allocation_pool_growth() {
    for use_mmap in [true, false] {
        let instance = instance(use_mmap);
        let large_bytes = 2 * instance.largest_size_class() * PAGE_SIZE as u64;
        let mut pool = AllocationPool::new(Arc::clone(&instance));

        pool.allocate_fixed(10).unwrap();
        assert_eq!(pool.num_total_allocations(), 1);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 10);

        pool.allocate_fixed(large_bytes).unwrap();
        assert_eq!(pool.num_total_allocations(), 2);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 10);

        pool.allocate_fixed(20).unwrap();
        assert_eq!(pool.num_total_allocations(), 2);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 30);

        // Leaves 10 bytes of room in a fresh 128-page run.
        pool.allocate_fixed(128 * 4096 - 10).unwrap();
        assert_eq!(pool.num_total_allocations(), 3);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 524278);

        pool.allocate_fixed(5).unwrap();
        assert_eq!(pool.num_total_allocations(), 3);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 524283);

        pool.allocate_fixed(100).unwrap();
        assert_eq!(pool.num_total_allocations(), 4);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 100);

        pool.clear();
        assert_eq!(instance.num_allocated(), 0);
    }
}

// Fill each size class to capacity, fail the next request, then free.
#[test]
fn single_class_fill() {
    for use_mmap in [true, false] {
        let instance = instance(use_mmap);
        let sizes = instance.size_classes().to_vec();
        for (class_index, size) in sizes.iter().enumerate() {
            let count = CAPACITY_PAGES / size;
            let mut allocations = Vec::with_capacity(count as usize);
            for _ in 0..count {
                allocations.push(allocate(&instance, *size).expect("within capacity"));
            }
            assert_eq!(allocations[0].allocation.num_pages(), *size);
            assert!(allocate(&instance, *size).is_none());
            assert_eq!(instance.num_allocated(), CAPACITY_PAGES);
            assert!(instance.check_consistency());

            for checked in allocations.drain(..) {
                free(&instance, checked);
            }
            assert_eq!(instance.num_allocated(), 0);

            let stats = instance.stats();
            assert!(stats.size_classes[class_index].clocks > 0);
            assert!(stats.size_classes[class_index].total_bytes >= CAPACITY_BYTES);
            assert!(stats.size_classes[class_index].num_allocations >= count);

            if use_mmap {
                assert_eq!(instance.num_mapped(), CAPACITY_PAGES);
            }
            assert!(instance.check_consistency());
        }

        // Refill in descending class order to exercise reuse of pages left
        // mapped by larger classes.
        for size in sizes.iter().rev().skip(1) {
            let count = CAPACITY_PAGES / size;
            let mut allocations = Vec::with_capacity(count as usize);
            for _ in 0..count {
                allocations.push(allocate(&instance, *size).expect("within capacity"));
            }
            assert!(allocate(&instance, *size).is_none());
            for checked in allocations.drain(..) {
                free(&instance, checked);
            }
            assert_eq!(instance.num_allocated(), 0);
            if use_mmap {
                assert_eq!(instance.num_mapped(), CAPACITY_PAGES);
            }
            assert!(instance.check_consistency());
        }
    }
}

fn allocate_increasing(
    instance: &Arc<dyn MemoryAllocator>,
    slots: &mut Vec<Option<Checked>>,
    start: MachinePageCount,
    end: MachinePageCount,
    repeat: usize,
) {
    let mut hand = 0;
    let mut count = 0;
    while count < repeat {
        let mut size = start;
        while size < end {
            count += 1;
            loop {
                if let Some(previous) = slots[hand].take() {
                    free(instance, previous);
                }
                if let Some(checked) = allocate(instance, size) {
                    slots[hand] = Some(checked);
                    break;
                }
                // Out of space: free forward from the next slot.
                let mut iterations = 0;
                let mut made_space = false;
                let mut scan = (hand + 1) % slots.len();
                while iterations < slots.len() {
                    if let Some(previous) = slots[scan].take() {
                        free(instance, previous);
                        made_space = true;
                        break;
                    }
                    scan = (scan + 1) % slots.len();
                    iterations += 1;
                }
                if !made_space {
                    return;
                }
            }
            hand = (hand + 1) % slots.len();
            size += (size / 5).max(1);
        }
    }
}

#[test]
fn increasing_size_churn() {
    for use_mmap in [true, false] {
        let instance = instance(use_mmap);
        let mut slots: Vec<Option<Checked>> = (0..1000).map(|_| None).collect();
        allocate_increasing(&instance, &mut slots, 10, 300, 300);
        assert!(instance.check_consistency());
        assert!(instance.num_allocated() > 0);

        for slot in &mut slots {
            if let Some(checked) = slot.take() {
                free(&instance, checked);
            }
        }
        assert!(instance.check_consistency());
        assert_eq!(instance.num_allocated(), 0);
    }
}

#[test]
fn increasing_size_churn_with_threads() {
    for use_mmap in [true, false] {
        let instance = instance(use_mmap);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let instance = Arc::clone(&instance);
            handles.push(thread::spawn(move || {
                let mut slots: Vec<Option<Checked>> = (0..200).map(|_| None).collect();
                allocate_increasing(&instance, &mut slots, 10, 200, 200);
                slots
            }));
        }
        let mut all_slots = Vec::new();
        for handle in handles {
            all_slots.push(handle.join().unwrap());
        }
        assert!(instance.check_consistency());
        assert!(instance.num_allocated() > 0);

        for mut slots in all_slots {
            for slot in &mut slots {
                if let Some(checked) = slot.take() {
                    free(&instance, checked);
                }
            }
        }
        assert!(instance.check_consistency());
        assert_eq!(instance.num_allocated(), 0);
    }
}

#[test]
fn scoped_memory_usage_tracking() {
    for use_mmap in [true, false] {
        let backend = instance(use_mmap);
        let num_pages = 32;
        {
            let tracker = MemoryUsageTracker::create();
            let scoped = backend.add_child(Arc::clone(&tracker));

            let mut result = Allocation::new(scoped.clone());
            scoped
                .allocate_non_contiguous(num_pages, &mut result, None, 0)
                .unwrap();
            assert!(result.num_pages() >= num_pages);
            assert_eq!(
                result.num_pages() * PAGE_SIZE as u64,
                tracker.current_bytes()
            );
            scoped.free_non_contiguous(&mut result);
            assert_eq!(tracker.current_bytes(), 0);
        }

        let tracker = MemoryUsageTracker::create();
        let scoped = backend.add_child(Arc::clone(&tracker));
        {
            let mut first = Allocation::new(scoped.clone());
            let mut second = Allocation::new(scoped.clone());
            scoped
                .allocate_non_contiguous(num_pages, &mut first, None, 0)
                .unwrap();
            scoped
                .allocate_non_contiguous(num_pages, &mut second, None, 0)
                .unwrap();
            assert_eq!(
                (first.num_pages() + second.num_pages()) * PAGE_SIZE as u64,
                tracker.current_bytes()
            );
        }
        // Dropping the allocations returned everything.
        assert_eq!(tracker.current_bytes(), 0);
        assert_eq!(backend.num_allocated(), 0);
    }
}

// A zero-cap tracker rejects every page allocation with no residue.
#[test]
fn zero_cap_tracker_rollback() {
    for use_mmap in [true, false] {
        let backend = instance(use_mmap);
        let tracker = MemoryUsageTracker::create_with_limit(0);
        let scoped = backend.add_child(Arc::clone(&tracker));

        let mut allocation = Allocation::new(scoped.clone());
        for num_pages in [1u64, 16, 300] {
            assert!(scoped
                .allocate_non_contiguous(num_pages, &mut allocation, None, 0)
                .is_err());
            assert!(allocation.is_empty());
            assert_eq!(tracker.current_bytes(), 0);
        }
        let mut large = ContiguousAllocation::new();
        assert!(scoped
            .allocate_contiguous(300, None, &mut large, None)
            .is_err());
        assert!(large.is_empty());
        assert_eq!(tracker.current_bytes(), 0);
        assert_eq!(backend.num_allocated(), 0);
        assert!(backend.check_consistency());
    }
}

#[test]
fn min_size_class_floor() {
    for use_mmap in [true, false] {
        let backend = instance(use_mmap);
        let tracker = MemoryUsageTracker::create();
        let scoped = backend.add_child(Arc::clone(&tracker));

        let size_class = scoped.largest_size_class();
        let mut result = Allocation::new(scoped.clone());
        scoped
            .allocate_non_contiguous(size_class + 1, &mut result, None, size_class)
            .unwrap();
        assert!(result.num_pages() >= size_class * 2);
        for run in result.runs() {
            assert!(run.num_pages() >= size_class);
        }
        assert_eq!(
            result.num_pages() * PAGE_SIZE as u64,
            tracker.current_bytes()
        );
        scoped.free_non_contiguous(&mut result);
        assert_eq!(tracker.current_bytes(), 0);
    }
}

// Contiguous allocation taking non-contiguous collateral.
#[test]
fn contiguous_with_collateral() {
    for use_mmap in [true, false] {
        let backend = instance(use_mmap);
        let tracker = MemoryUsageTracker::create_with_limit(CAPACITY_BYTES);
        let scoped = backend.add_child(Arc::clone(&tracker));

        // Fill half of the capacity with 16-page allocations.
        let small_size = 16;
        let mut smalls = Vec::new();
        for _ in 0..CAPACITY_PAGES / small_size / 2 {
            let mut allocation = Allocation::new(scoped.clone());
            scoped
                .allocate_non_contiguous(small_size, &mut allocation, None, 0)
                .unwrap();
            smalls.push(allocation);
        }
        let available = CAPACITY_PAGES - scoped.num_allocated();

        let mut large = ContiguousAllocation::new();
        scoped
            .allocate_contiguous(available / 2, None, &mut large, None)
            .unwrap();
        let mut small = Allocation::new(scoped.clone());
        scoped
            .allocate_non_contiguous(available / 4, &mut small, None, 0)
            .unwrap();

        // More than the whole capacity: fails, and the collateral passed in
        // is gone along with the previous contents of the target.
        let err = scoped
            .allocate_contiguous(available + 1, Some(&mut small), &mut large, None)
            .unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(small.num_pages(), 0);
        assert_eq!(large.num_pages(), 0);
        assert_eq!(
            tracker.current_bytes(),
            scoped.num_allocated() * PAGE_SIZE as u64
        );
        assert!(scoped.check_consistency());

        // The rest of the capacity is allocatable again.
        scoped
            .allocate_contiguous(available, None, &mut large, None)
            .unwrap();
        assert!(large.num_pages() >= available);
        assert_eq!(scoped.num_allocated(), CAPACITY_PAGES);
        if use_mmap {
            assert_eq!(scoped.num_mapped(), CAPACITY_PAGES);
        }

        // Exchange all of available for half of it, with the target itself
        // as collateral.
        scoped
            .allocate_contiguous(available / 2, None, &mut large, None)
            .unwrap();
        assert!(large.num_pages() >= available / 2);
        assert!(scoped.check_consistency());

        drop(large);
        smalls.clear();
        assert_eq!(scoped.num_allocated(), 0);
        assert_eq!(tracker.current_bytes(), 0);
    }
}

// Advise-away of free-mapped pages funds contiguous allocations.
#[test]
fn external_advise() {
    let small_size: MachinePageCount = 16;
    let large_size: MachinePageCount = 32 * small_size + 1;
    let mmap = mmap_instance();
    let instance: Arc<dyn MemoryAllocator> = mmap.clone();

    let num_allocs = CAPACITY_PAGES / small_size;
    let mut allocations = Vec::new();
    for _ in 0..num_allocs {
        allocations.push(allocate(&instance, small_size).expect("within capacity"));
    }
    // Capacity is allocated and mapped. Free half, leaving it mapped.
    for checked in allocations.drain(num_allocs as usize / 2..) {
        free(&instance, checked);
    }
    assert!(mmap.check_consistency());
    assert_eq!(mmap.num_mapped(), num_allocs * small_size);
    assert_eq!(mmap.num_allocated(), num_allocs / 2 * small_size);

    let mut larges = vec![ContiguousAllocation::new(), ContiguousAllocation::new()];
    instance
        .allocate_contiguous(large_size, None, &mut larges[0], None)
        .unwrap();
    // Whole 16-page units get advised away, so one unit was released but
    // not fully consumed because the large size is not a unit multiple.
    assert_eq!(
        mmap.num_mapped(),
        num_allocs * small_size - small_size + 1
    );
    assert_eq!(
        mmap.num_allocated(),
        num_allocs / 2 * small_size + large_size
    );
    instance
        .allocate_contiguous(large_size, None, &mut larges[1], None)
        .unwrap();
    larges.clear();
    assert_eq!(
        mmap.num_allocated(),
        allocations.len() as u64 * small_size
    );
    // Both larges were unmapped on free, and advising for them released
    // whole units beyond the exact need.
    assert_eq!(
        mmap.num_mapped(),
        small_size * num_allocs - 2 * large_size - (small_size - 2 * (large_size % small_size))
    );
    assert!(mmap.check_consistency());
}

// Injected madvise/mmap failures roll contiguous allocation back.
#[test]
fn contiguous_failure_injection() {
    let small_size: MachinePageCount = 16;
    let large_size: MachinePageCount = CAPACITY_PAGES / 2;
    let mmap = mmap_instance();
    let instance: Arc<dyn MemoryAllocator> = mmap.clone();

    let tracked = AtomicI64::new(0);
    let track_cb = |delta: i64, pre_alloc: bool| -> corvus_memory::MemoryResult<()> {
        tracked.fetch_add(if pre_alloc { delta } else { -delta }, Ordering::Relaxed);
        Ok(())
    };

    let num_allocs = CAPACITY_PAGES / small_size;
    let mut allocations = Vec::new();
    for _ in 0..num_allocs {
        allocations.push(allocate(&instance, small_size).expect("within capacity"));
    }
    for checked in allocations.drain(num_allocs as usize / 2..) {
        free(&instance, checked);
    }
    assert_eq!(mmap.num_mapped(), num_allocs * small_size);

    let mut large = ContiguousAllocation::new();
    instance
        .allocate_contiguous(large_size / 2, None, &mut large, Some(&track_cb))
        .unwrap();
    assert!(mmap.check_consistency());

    // The request would fit, but advising away the collateral fails.
    mmap.inject_failure(Failure::Madvise);
    let mut collateral = allocations.pop().unwrap();
    let err = instance
        .allocate_contiguous(
            large_size + small_size,
            Some(&mut collateral.allocation),
            &mut large,
            Some(&track_cb),
        )
        .unwrap_err();
    assert!(err.is_syscall());
    assert!(collateral.allocation.is_empty());
    assert!(large.is_empty());
    assert!(mmap.check_consistency());
    // Both the collateral and the previous large were freed, nothing was
    // allocated.
    assert_eq!(
        mmap.num_allocated(),
        small_size * allocations.len() as u64
    );
    // Net effect seen by the callback: one small allocation released.
    assert_eq!(
        tracked.load(Ordering::Relaxed),
        -((small_size * PAGE_SIZE as u64) as i64)
    );

    tracked.store(0, Ordering::Relaxed);
    instance
        .allocate_contiguous(large_size / 2, None, &mut large, Some(&track_cb))
        .unwrap();
    mmap.inject_failure(Failure::Mmap);
    let mut collateral = allocations.pop().unwrap();
    let err = instance
        .allocate_contiguous(
            large_size + 2 * small_size,
            Some(&mut collateral.allocation),
            &mut large,
            Some(&track_cb),
        )
        .unwrap_err();
    assert!(err.is_syscall());
    assert!(collateral.allocation.is_empty());
    assert!(large.is_empty());
    assert_eq!(
        mmap.num_allocated(),
        small_size * allocations.len() as u64
    );
    assert_eq!(
        tracked.load(Ordering::Relaxed),
        -((small_size * PAGE_SIZE as u64) as i64)
    );
    assert!(mmap.check_consistency());

    // Without injection the same exchange succeeds and lands exactly on
    // capacity.
    tracked.store(0, Ordering::Relaxed);
    instance
        .allocate_contiguous(large_size / 2, None, &mut large, Some(&track_cb))
        .unwrap();
    let mut collateral = allocations.pop().unwrap();
    instance
        .allocate_contiguous(
            large_size + 3 * small_size,
            Some(&mut collateral.allocation),
            &mut large,
            Some(&track_cb),
        )
        .unwrap();
    assert_eq!(mmap.num_mapped(), CAPACITY_PAGES);
    assert_eq!(mmap.num_allocated(), CAPACITY_PAGES);
    // One small collateral was consumed, so the net growth is the large
    // size plus two smalls.
    assert_eq!(
        tracked.load(Ordering::Relaxed),
        ((large_size + 2 * small_size) * PAGE_SIZE as u64) as i64
    );
    assert!(mmap.check_consistency());
}

// Injected failure on the non-contiguous path after reservation.
#[test]
fn non_contiguous_failure_injection() {
    let mmap = mmap_instance();
    let tracker = MemoryUsageTracker::create();
    let scoped = mmap.add_child(Arc::clone(&tracker));

    mmap.inject_failure(Failure::Allocate);
    let mut allocation = Allocation::new(scoped.clone());
    assert!(scoped
        .allocate_non_contiguous(8, &mut allocation, None, 0)
        .is_err());
    assert_eq!(tracker.current_bytes(), 0);
    assert!(allocation.is_empty());
    assert!(mmap.check_consistency());

    scoped
        .allocate_non_contiguous(8, &mut allocation, None, 0)
        .unwrap();
    assert!(tracker.current_bytes() > 0);
    drop(allocation);
    assert_eq!(tracker.current_bytes(), 0);
}

#[test]
fn allocate_bytes_mixed_sizes() {
    let _guard = GLOBAL_STATE_LOCK.lock();
    for use_mmap in [true, false] {
        let instance = instance(use_mmap);
        testing_clear_allocate_bytes_stats();

        let largest_bytes = instance.largest_size_class() * PAGE_SIZE as u64;
        let sizes = [
            MAX_MALLOC_BYTES / 2,
            100_000,
            1_000_000,
            largest_bytes + 100_000,
        ];
        let mut rng = StdRng::seed_from_u64(1);

        let mut data: Vec<Option<(NonNull<u8>, u64)>> = (0..50).map(|_| None).collect();
        for _ in 0..4 * data.len() {
            let index = rng.gen_range(0..data.len());
            let bytes = sizes[rng.gen_range(0..sizes.len())];
            let expected = index as u8;
            if let Some((pointer, size)) = data[index].take() {
                // Prior contents survived all interleaved allocations.
                // SAFETY: size bytes were allocated and filled below.
                unsafe {
                    for offset in (0..size as usize).step_by(997) {
                        assert_eq!(*pointer.as_ptr().add(offset), expected);
                    }
                }
                instance.free_bytes(pointer, size);
            }
            let pointer = instance.allocate_bytes(bytes).unwrap();
            // SAFETY: bytes were just allocated.
            unsafe { std::ptr::write_bytes(pointer.as_ptr(), expected, bytes as usize) };
            data[index] = Some((pointer, bytes));
        }
        assert!(instance.check_consistency());
        assert!(allocate_bytes_stats().total() > 0);

        for slot in &mut data {
            if let Some((pointer, size)) = slot.take() {
                instance.free_bytes(pointer, size);
            }
        }
        let stats = allocate_bytes_stats();
        assert_eq!(stats.total_small, 0);
        assert_eq!(stats.total_in_size_classes, 0);
        assert_eq!(stats.total_large, 0);
        assert_eq!(instance.num_allocated(), 0);
        assert!(instance.check_consistency());
    }
}

#[test]
fn typed_allocator_growth() {
    let _guard = GLOBAL_STATE_LOCK.lock();
    let mmap = mmap_instance();
    let instance: Arc<dyn MemoryAllocator> = mmap.clone();
    testing_clear_allocate_bytes_stats();

    let typed: TypedAllocator<f64> = TypedAllocator::new(Arc::clone(&instance));
    // Grow a buffer by doubling up to 256K doubles (2 MiB), crossing from
    // the malloc path through the size classes into the contiguous path.
    let target: u64 = 256 * 1024;
    let mut capacity: u64 = 1;
    let mut buffer = typed.allocate(capacity).unwrap();
    let mut length: u64 = 0;
    while capacity < target {
        let new_capacity = capacity * 2;
        let grown = typed.allocate(new_capacity).unwrap();
        // SAFETY: both buffers hold at least `length` initialized slots.
        unsafe {
            std::ptr::copy_nonoverlapping(buffer.as_ptr(), grown.as_ptr(), length as usize);
            for index in length..new_capacity {
                grown.as_ptr().add(index as usize).write(index as f64);
            }
        }
        typed.deallocate(buffer, capacity).unwrap();
        buffer = grown;
        length = new_capacity;
        capacity = new_capacity;
        assert_eq!(allocate_bytes_stats().total(), capacity * 8);
    }
    // SAFETY: all `target` slots are initialized.
    unsafe {
        for index in (0..target as usize).step_by(4097) {
            assert_eq!(*buffer.as_ptr().add(index), index as f64);
        }
    }
    // 2 MiB lives in the contiguous path.
    assert_eq!(mmap.num_allocated(), 512);
    let stats = allocate_bytes_stats();
    assert_eq!(stats.total_small, 0);
    assert_eq!(stats.total_in_size_classes, 0);
    assert_eq!(stats.total_large, 2 << 20);

    typed.deallocate(buffer, capacity).unwrap();
    assert_eq!(mmap.num_allocated(), 0);
    assert_eq!(allocate_bytes_stats().total(), 0);
    assert!(mmap.check_consistency());

    // Sanity bounds.
    let typed: TypedAllocator<i64> = TypedAllocator::new(Arc::clone(&instance));
    assert!(typed.allocate(1 << 62).is_err());
    let pointer = typed.allocate(1).unwrap();
    assert!(typed.deallocate(pointer, 1 << 62).is_err());
    typed.deallocate(pointer, 1).unwrap();
}

#[test]
fn default_instance_registry() {
    let _guard = GLOBAL_STATE_LOCK.lock();
    destroy_default_instance();

    // Lazily created heap instance.
    let first = default_instance().unwrap();
    let second = default_instance().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.num_allocated(), 0);

    // An installed mmap instance takes over.
    let mmap = mmap_instance();
    set_default_instance(Some(mmap.clone()));
    let current = default_instance().unwrap();
    assert_eq!(current.num_mapped(), 0);
    let mut allocation = Allocation::new(current.clone());
    current
        .allocate_non_contiguous(4, &mut allocation, None, 0)
        .unwrap();
    assert_eq!(mmap.num_allocated(), allocation.num_pages());
    drop(allocation);

    destroy_default_instance();
    let fresh = default_instance().unwrap();
    assert_eq!(fresh.num_allocated(), 0);
    destroy_default_instance();
}

#[test]
fn tracker_rollback_restores_parents() {
    let backend = instance(false);
    let root = MemoryUsageTracker::create_with_limit(64 * PAGE_SIZE as u64);
    let child_tracker = root.add_child();
    let scoped = backend.add_child(Arc::clone(&child_tracker));

    let mut first = Allocation::new(scoped.clone());
    scoped
        .allocate_non_contiguous(32, &mut first, None, 0)
        .unwrap();
    assert_eq!(root.current_bytes(), 32 * PAGE_SIZE as u64);

    // The next allocation exceeds the root cap; nothing changes anywhere.
    let mut second = Allocation::new(scoped.clone());
    let err = scoped
        .allocate_non_contiguous(64, &mut second, None, 0)
        .unwrap_err();
    assert!(err.is_capacity());
    assert!(second.is_empty());
    assert_eq!(root.current_bytes(), 32 * PAGE_SIZE as u64);
    assert_eq!(child_tracker.current_bytes(), 32 * PAGE_SIZE as u64);
    assert_eq!(backend.num_allocated(), 32);

    drop(first);
    assert_eq!(root.current_bytes(), 0);
    assert_eq!(backend.num_allocated(), 0);
}
