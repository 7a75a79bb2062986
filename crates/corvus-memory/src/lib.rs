//! # corvus-memory
//!
//! Page-granularity memory management for the Corvus query engine.
//!
//! The central abstraction is the [`MemoryAllocator`] trait: a bounded,
//! size-classed page allocator with a contiguous path for oversized
//! objects and a byte-granularity facade on top. Two backends implement
//! it, a process-heap one ([`HeapAllocator`]) and an mmap one
//! ([`MmapAllocator`]) that keeps freed pages mapped and advises them away
//! only when a contiguous allocation needs the mapped-page budget.
//!
//! Around the allocator sit:
//!
//! - [`MemoryUsageTracker`] — hierarchical byte accounting with caps,
//!   attached to child allocators via [`MemoryAllocator::add_child`]
//! - [`AllocationPool`] — a bump allocator over page allocations
//! - [`MmapArena`] / [`ManagedArenas`] — an independent buddy allocator
//!   over large mmap regions
//! - [`TypedAllocator`] — a typed shim for container-style usage
//!
//! ## Example
//!
//! ```rust
//! use corvus_memory::{Allocation, AllocatorOptions, MemoryAllocator, create_allocator};
//!
//! let allocator = create_allocator(AllocatorOptions::default()).unwrap();
//! let mut allocation = Allocation::new(allocator.clone());
//! allocator.allocate_non_contiguous(8, &mut allocation, None, 0).unwrap();
//! assert!(allocation.num_pages() >= 8);
//! // Dropping the allocation returns its pages.
//! ```

#![warn(clippy::all)]

pub mod allocation;
pub mod allocator;
pub mod arena;
pub mod config;
pub mod error;
mod mapping;
pub mod pool;
pub mod stats;
pub mod tracker;
pub mod typed;

pub use allocation::{Allocation, ContiguousAllocation, PageRun};
pub use allocator::{
    create_allocator, default_instance, destroy_default_instance, set_default_instance, Failure,
    HeapAllocator, MemoryAllocator, MmapAllocator, ReservationCallback, ScopedAllocator,
};
pub use arena::{ManagedArenas, MmapArena};
pub use config::AllocatorOptions;
pub use error::{MemoryError, MemoryResult, SyscallKind};
pub use pool::AllocationPool;
pub use stats::{
    allocate_bytes_stats, testing_clear_allocate_bytes_stats, AllocateBytesStats, SizeClassStats,
    Stats,
};
pub use tracker::MemoryUsageTracker;
pub use typed::TypedAllocator;
