//! General-purpose byte allocation over large mmap regions.
//!
//! [`MmapArena`] manages a single anonymous mapping with a power-of-two
//! buddy allocator: one free list per block size, lowest-address blocks
//! handed out first, buddies coalesced on free. [`ManagedArenas`] grows a
//! collection of arenas on demand and retires empty ones.

use std::collections::{BTreeSet, HashMap};
use std::ptr::NonNull;

use corvus_common::bits::{is_power_of_two, next_power_of_two};

use crate::error::{MemoryError, MemoryResult};
use crate::mapping::MmapRegion;

/// Smallest block handed out, in bytes. Requests below this (including
/// zero-byte requests) are rounded up to it.
const MIN_BLOCK_BYTES: u64 = 64;

/// A single mmap region managed by a power-of-two free-list allocator.
pub struct MmapArena {
    region: MmapRegion,
    capacity_bytes: u64,
    /// Free block offsets per level; level `i` holds blocks of
    /// `MIN_BLOCK_BYTES << i` bytes.
    free_lists: Vec<BTreeSet<u64>>,
    /// Offsets and rounded sizes of live blocks.
    allocated: HashMap<u64, u64>,
    allocated_bytes: u64,
}

impl MmapArena {
    /// Creates an arena over a fresh mapping of `capacity_bytes`, which
    /// must be a power of two of at least [`MIN_BLOCK_BYTES`].
    pub fn new(capacity_bytes: u64) -> MemoryResult<Self> {
        if !is_power_of_two(capacity_bytes) || capacity_bytes < MIN_BLOCK_BYTES {
            return Err(MemoryError::invalid_argument(
                "arena capacity must be a power of two of at least the minimum block",
            ));
        }
        let region = MmapRegion::anonymous(capacity_bytes as usize)?;
        let levels = Self::level_of(capacity_bytes) + 1;
        let mut free_lists = vec![BTreeSet::new(); levels];
        free_lists[levels - 1].insert(0);
        Ok(Self {
            region,
            capacity_bytes,
            free_lists,
            allocated: HashMap::new(),
            allocated_bytes: 0,
        })
    }

    fn level_of(block_bytes: u64) -> usize {
        (block_bytes / MIN_BLOCK_BYTES).trailing_zeros() as usize
    }

    fn block_bytes(level: usize) -> u64 {
        MIN_BLOCK_BYTES << level
    }

    fn rounded(bytes: u64) -> u64 {
        next_power_of_two(bytes.max(MIN_BLOCK_BYTES))
    }

    /// Base address of the arena.
    #[must_use]
    pub fn address(&self) -> *mut u8 {
        self.region.base()
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity_bytes
    }

    /// Returns true if `pointer` lies inside this arena.
    #[must_use]
    pub fn contains(&self, pointer: *const u8) -> bool {
        self.region.contains(pointer)
    }

    /// Returns true if nothing is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocated_bytes == 0
    }

    /// Bytes currently allocated, after round-up.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Allocates `bytes` bytes, rounded up to the next power of two.
    pub fn allocate(&mut self, bytes: u64) -> MemoryResult<NonNull<u8>> {
        let size = Self::rounded(bytes);
        if size > self.capacity_bytes {
            return Err(MemoryError::OutOfCapacity {
                requested: size,
                available: self.capacity_bytes - self.allocated_bytes,
            });
        }
        let wanted = Self::level_of(size);
        let from = (wanted..self.free_lists.len())
            .find(|level| !self.free_lists[*level].is_empty())
            .ok_or(MemoryError::OutOfCapacity {
                requested: size,
                available: self.capacity_bytes - self.allocated_bytes,
            })?;
        let offset = self.free_lists[from]
            .pop_first()
            .expect("level chosen non-empty");
        // Split down to the wanted size, freeing the upper halves.
        let mut level = from;
        while level > wanted {
            level -= 1;
            self.free_lists[level].insert(offset + Self::block_bytes(level));
        }
        self.allocated.insert(offset, size);
        self.allocated_bytes += size;
        // SAFETY: offset is inside the region.
        let pointer = unsafe { self.region.base().add(offset as usize) };
        Ok(NonNull::new(pointer).expect("arena addresses are non-null"))
    }

    /// Frees a block previously returned by [`Self::allocate`] with the
    /// same byte count.
    pub fn free(&mut self, pointer: NonNull<u8>, bytes: u64) -> MemoryResult<()> {
        let size = Self::rounded(bytes);
        let offset = self
            .region
            .offset_of(pointer.as_ptr())
            .ok_or_else(|| MemoryError::invalid_argument("pointer is outside the arena"))?
            as u64;
        match self.allocated.remove(&offset) {
            Some(recorded) if recorded == size => {}
            Some(recorded) => {
                self.allocated.insert(offset, recorded);
                return Err(MemoryError::consistency(
                    "free size does not match the allocation",
                ));
            }
            None => {
                return Err(MemoryError::consistency("freeing an unallocated block"));
            }
        }
        self.allocated_bytes -= size;

        // Coalesce with the buddy while it is free.
        let mut offset = offset;
        let mut level = Self::level_of(size);
        while level + 1 < self.free_lists.len() {
            let buddy = offset ^ Self::block_bytes(level);
            if !self.free_lists[level].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            level += 1;
        }
        self.free_lists[level].insert(offset);
        Ok(())
    }

    /// Verifies that free and allocated blocks exactly tile the arena.
    #[must_use]
    pub fn check_consistency(&self) -> bool {
        let mut blocks: Vec<(u64, u64)> = Vec::new();
        for (level, list) in self.free_lists.iter().enumerate() {
            let size = Self::block_bytes(level);
            for offset in list {
                if offset % size != 0 {
                    tracing::error!(offset, size, "misaligned free block");
                    return false;
                }
                blocks.push((*offset, size));
            }
        }
        for (offset, size) in &self.allocated {
            if offset % size != 0 {
                tracing::error!(offset, size, "misaligned allocated block");
                return false;
            }
            blocks.push((*offset, *size));
        }
        blocks.sort_unstable();
        let mut cursor = 0;
        for (offset, size) in blocks {
            if offset != cursor {
                tracing::error!(offset, cursor, "gap or overlap in arena blocks");
                return false;
            }
            cursor = offset + size;
        }
        cursor == self.capacity_bytes
    }
}

impl std::fmt::Debug for MmapArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapArena")
            .field("capacity_bytes", &self.capacity_bytes)
            .field("allocated_bytes", &self.allocated_bytes)
            .finish()
    }
}

/// An ordered collection of [`MmapArena`] grown on demand.
///
/// Allocation scans the arenas in insertion order and creates a new arena
/// when none can satisfy the request. An arena that becomes empty is
/// retired unless it is the most recently created one.
pub struct ManagedArenas {
    arena_capacity_bytes: u64,
    arenas: Vec<MmapArena>,
}

impl ManagedArenas {
    /// Creates the collection with one arena of `arena_capacity_bytes`.
    pub fn new(arena_capacity_bytes: u64) -> MemoryResult<Self> {
        let first = MmapArena::new(arena_capacity_bytes)?;
        Ok(Self {
            arena_capacity_bytes,
            arenas: vec![first],
        })
    }

    /// The managed arenas, in insertion order.
    #[must_use]
    pub fn arenas(&self) -> &[MmapArena] {
        &self.arenas
    }

    /// Allocates `bytes` from the first arena that can hold them, growing
    /// the collection if none can.
    pub fn allocate(&mut self, bytes: u64) -> MemoryResult<NonNull<u8>> {
        for arena in &mut self.arenas {
            if let Ok(pointer) = arena.allocate(bytes) {
                return Ok(pointer);
            }
        }
        let capacity = self
            .arena_capacity_bytes
            .max(next_power_of_two(bytes.max(MIN_BLOCK_BYTES)));
        let mut arena = MmapArena::new(capacity)?;
        let pointer = arena.allocate(bytes)?;
        self.arenas.push(arena);
        Ok(pointer)
    }

    /// Frees a block in whichever arena contains it. Retires the arena if
    /// it became empty and is not the most recently created one.
    pub fn free(&mut self, pointer: NonNull<u8>, bytes: u64) -> MemoryResult<()> {
        let index = self
            .arenas
            .iter()
            .position(|arena| arena.contains(pointer.as_ptr()))
            .ok_or_else(|| MemoryError::invalid_argument("pointer is outside all arenas"))?;
        self.arenas[index].free(pointer, bytes)?;
        if self.arenas[index].is_empty() && index + 1 != self.arenas.len() {
            self.arenas.remove(index);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ManagedArenas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedArenas")
            .field("num_arenas", &self.arenas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut arena = MmapArena::new(1 << 20).unwrap();
        let pointer = arena.allocate(100).unwrap();
        assert!(arena.contains(pointer.as_ptr()));
        assert_eq!(arena.allocated_bytes(), 128);
        assert!(arena.check_consistency());

        arena.free(pointer, 100).unwrap();
        assert!(arena.is_empty());
        assert!(arena.check_consistency());
    }

    #[test]
    fn test_zero_bytes_get_min_block() {
        let mut arena = MmapArena::new(1 << 16).unwrap();
        let pointer = arena.allocate(0).unwrap();
        assert_eq!(arena.allocated_bytes(), MIN_BLOCK_BYTES);
        arena.free(pointer, 0).unwrap();
        assert!(arena.is_empty());
    }

    #[test]
    fn test_split_prefers_low_addresses() {
        let mut arena = MmapArena::new(1 << 16).unwrap();
        let first = arena.allocate(64).unwrap();
        let second = arena.allocate(64).unwrap();
        assert_eq!(first.as_ptr() as usize, arena.address() as usize);
        assert_eq!(second.as_ptr() as usize, arena.address() as usize + 64);
        arena.free(first, 64).unwrap();
        arena.free(second, 64).unwrap();
        assert!(arena.check_consistency());
    }

    #[test]
    fn test_coalescing_restores_full_block() {
        let mut arena = MmapArena::new(1 << 12).unwrap();
        let mut pointers = Vec::new();
        for _ in 0..(1 << 12) / MIN_BLOCK_BYTES {
            pointers.push(arena.allocate(MIN_BLOCK_BYTES).unwrap());
        }
        assert!(arena.allocate(MIN_BLOCK_BYTES).is_err());
        for pointer in pointers {
            arena.free(pointer, MIN_BLOCK_BYTES).unwrap();
        }
        assert!(arena.is_empty());
        // Everything coalesced back into the single top-level block.
        let top = arena.free_lists.last().unwrap();
        assert_eq!(top.len(), 1);
        assert!(arena.check_consistency());
    }

    #[test]
    fn test_bad_frees_are_rejected() {
        let mut arena = MmapArena::new(1 << 16).unwrap();
        let pointer = arena.allocate(256).unwrap();
        assert!(arena.free(pointer, 512).is_err());
        assert!(arena.free(NonNull::dangling(), 64).is_err());
        arena.free(pointer, 256).unwrap();
        // Double free.
        assert!(arena.free(pointer, 256).is_err());
    }

    #[test]
    fn test_oversized_request_fails() {
        let mut arena = MmapArena::new(1 << 16).unwrap();
        assert!(arena.allocate(1 << 17).is_err());
    }

    #[test]
    fn test_rejects_non_power_of_two_capacity() {
        assert!(MmapArena::new(3 << 16).is_err());
        assert!(MmapArena::new(32).is_err());
    }
}
