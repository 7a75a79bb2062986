//! System-wide constants for Corvus.

use crate::types::MachinePageCount;

// =============================================================================
// Page and Memory Constants
// =============================================================================

/// Machine page size in bytes (4 KiB).
///
/// The unit of all page-granularity allocation. Matches the hardware page
/// size on the platforms Corvus targets.
pub const PAGE_SIZE: usize = 4096;

/// Requests at or below this many bytes are served from the process heap by
/// the byte-allocation facade; larger requests go to the page allocator.
pub const MAX_MALLOC_BYTES: u64 = 3072;

/// Alignment of process-heap allocations made by the byte facade.
pub const MALLOC_ALIGNMENT: usize = 16;

/// Default capacity of a memory allocator instance (256 MiB).
pub const DEFAULT_CAPACITY_BYTES: u64 = 256 * 1024 * 1024;

/// Default size classes for non-contiguous page allocation, in pages.
///
/// Sorted ascending, each class twice the previous. The largest class bounds
/// the biggest request the size-classed path will serve; anything larger is
/// a contiguous allocation.
pub const DEFAULT_SIZE_CLASS_SIZES: [MachinePageCount; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];
