//! Allocation statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use corvus_common::MachinePageCount;

/// Snapshot of the counters of one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeClassStats {
    /// Class size in pages.
    pub size: MachinePageCount,
    /// Number of allocation calls that took runs from this class.
    pub num_allocations: u64,
    /// Total bytes handed out by this class over its lifetime.
    pub total_bytes: u64,
    /// Nanoseconds spent allocating from this class.
    pub clocks: u64,
}

/// Snapshot of allocator-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Per-size-class counters, in ascending class order.
    pub size_classes: Vec<SizeClassStats>,
}

impl Stats {
    /// Total bytes handed out across all size classes.
    pub fn total_bytes(&self) -> u64 {
        self.size_classes.iter().map(|s| s.total_bytes).sum()
    }
}

/// Live counters for one size class.
#[derive(Debug, Default)]
pub(crate) struct ClassCounters {
    num_allocations: AtomicU64,
    total_bytes: AtomicU64,
    clocks: AtomicU64,
}

impl ClassCounters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, bytes: u64, elapsed: Duration) {
        self.num_allocations.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.clocks
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, size: MachinePageCount) -> SizeClassStats {
        SizeClassStats {
            size,
            num_allocations: self.num_allocations.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            clocks: self.clocks.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide totals for the byte-allocation facade.
///
/// Tracks live bytes per dispatch path; every `free_bytes` subtracts what the
/// matching `allocate_bytes` added, so all totals return to zero once every
/// byte allocation is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocateBytesStats {
    /// Live bytes served from the process heap.
    pub total_small: u64,
    /// Live bytes served by the size-classed page allocator.
    pub total_in_size_classes: u64,
    /// Live bytes served by the contiguous allocator.
    pub total_large: u64,
}

impl AllocateBytesStats {
    /// Sum of all three totals.
    pub fn total(&self) -> u64 {
        self.total_small + self.total_in_size_classes + self.total_large
    }
}

static TOTAL_SMALL: AtomicU64 = AtomicU64::new(0);
static TOTAL_IN_SIZE_CLASSES: AtomicU64 = AtomicU64::new(0);
static TOTAL_LARGE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub(crate) enum ByteAllocClass {
    Small,
    InSizeClasses,
    Large,
}

impl ByteAllocClass {
    fn counter(self) -> &'static AtomicU64 {
        match self {
            Self::Small => &TOTAL_SMALL,
            Self::InSizeClasses => &TOTAL_IN_SIZE_CLASSES,
            Self::Large => &TOTAL_LARGE,
        }
    }
}

pub(crate) fn record_byte_alloc(class: ByteAllocClass, bytes: u64) {
    class.counter().fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn record_byte_free(class: ByteAllocClass, bytes: u64) {
    class.counter().fetch_sub(bytes, Ordering::Relaxed);
}

/// Returns the process-wide byte-allocation totals.
pub fn allocate_bytes_stats() -> AllocateBytesStats {
    AllocateBytesStats {
        total_small: TOTAL_SMALL.load(Ordering::Relaxed),
        total_in_size_classes: TOTAL_IN_SIZE_CLASSES.load(Ordering::Relaxed),
        total_large: TOTAL_LARGE.load(Ordering::Relaxed),
    }
}

/// Resets the byte-allocation totals. Test use only.
pub fn testing_clear_allocate_bytes_stats() {
    TOTAL_SMALL.store(0, Ordering::Relaxed);
    TOTAL_IN_SIZE_CLASSES.store(0, Ordering::Relaxed);
    TOTAL_LARGE.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_counters() {
        let counters = ClassCounters::new();
        counters.record(4096, Duration::from_nanos(100));
        counters.record(8192, Duration::from_nanos(50));

        let snapshot = counters.snapshot(4);
        assert_eq!(snapshot.size, 4);
        assert_eq!(snapshot.num_allocations, 2);
        assert_eq!(snapshot.total_bytes, 12288);
        assert_eq!(snapshot.clocks, 150);
    }

    #[test]
    fn test_stats_total() {
        let stats = Stats {
            size_classes: vec![
                SizeClassStats {
                    size: 1,
                    num_allocations: 1,
                    total_bytes: 4096,
                    clocks: 1,
                },
                SizeClassStats {
                    size: 2,
                    num_allocations: 1,
                    total_bytes: 8192,
                    clocks: 1,
                },
            ],
        };
        assert_eq!(stats.total_bytes(), 12288);
    }
}
