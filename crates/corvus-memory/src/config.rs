//! Allocator configuration.

use corvus_common::constants::{DEFAULT_CAPACITY_BYTES, DEFAULT_SIZE_CLASS_SIZES, PAGE_SIZE};
use corvus_common::MachinePageCount;

use crate::error::{MemoryError, MemoryResult};

/// Configuration for a memory allocator instance.
#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    /// Total capacity managed by the allocator, in bytes.
    pub capacity_bytes: u64,
    /// Supported run sizes in pages, sorted ascending.
    pub size_classes: Vec<MachinePageCount>,
    /// Whether to use the mmap backend with advise-away semantics instead of
    /// the process heap.
    pub use_mmap: bool,
    /// Cap on mapped pages for the mmap backend. Defaults to the capacity.
    pub max_mapped_pages: Option<MachinePageCount>,
}

impl AllocatorOptions {
    /// Creates options with the given capacity and default size classes.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            ..Self::default()
        }
    }

    /// Sets the size classes.
    pub fn with_size_classes(mut self, size_classes: Vec<MachinePageCount>) -> Self {
        self.size_classes = size_classes;
        self
    }

    /// Selects the mmap backend.
    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    /// Caps the number of mapped pages.
    pub fn with_max_mapped_pages(mut self, pages: MachinePageCount) -> Self {
        self.max_mapped_pages = Some(pages);
        self
    }

    /// Returns the capacity in pages.
    pub fn capacity_pages(&self) -> MachinePageCount {
        self.capacity_bytes / PAGE_SIZE as u64
    }

    /// Validates the configuration.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.size_classes.is_empty() {
            return Err(MemoryError::invalid_argument("size_classes must not be empty"));
        }
        if self.size_classes[0] < 1 {
            return Err(MemoryError::invalid_argument("smallest size class must be >= 1 page"));
        }
        for pair in self.size_classes.windows(2) {
            if pair[1] <= pair[0] || pair[1] % pair[0] != 0 {
                return Err(MemoryError::invalid_argument(
                    "size classes must be ascending multiples of each other",
                ));
            }
        }
        let largest = *self.size_classes.last().expect("non-empty size classes");
        if self.capacity_pages() < largest {
            return Err(MemoryError::invalid_argument(
                "capacity must hold at least one run of the largest size class",
            ));
        }
        if let Some(max_mapped) = self.max_mapped_pages {
            if max_mapped < largest {
                return Err(MemoryError::invalid_argument(
                    "max_mapped_pages must hold at least one run of the largest size class",
                ));
            }
        }
        Ok(())
    }
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            size_classes: DEFAULT_SIZE_CLASS_SIZES.to_vec(),
            use_mmap: false,
            max_mapped_pages: None,
        }
    }
}
