//! Typed allocation handle for sequence containers.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use corvus_common::constants::MALLOC_ALIGNMENT;

use crate::allocator::MemoryAllocator;
use crate::error::{MemoryError, MemoryResult};

/// Upper bound on a single request; anything larger is a caller bug.
const MAX_REQUEST_BYTES: u64 = 1 << 62;

/// Allocates arrays of `T` through an allocator's byte facade.
///
/// The element type must not require more than [`MALLOC_ALIGNMENT`]-byte
/// alignment, since small requests are served from the process heap at
/// that alignment. Page-backed requests are page aligned.
pub struct TypedAllocator<T> {
    memory: Arc<dyn MemoryAllocator>,
    _marker: PhantomData<T>,
}

impl<T> TypedAllocator<T> {
    /// Creates a typed allocator over `memory`.
    #[must_use]
    pub fn new(memory: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            memory,
            _marker: PhantomData,
        }
    }

    fn request_bytes(count: u64) -> MemoryResult<u64> {
        let bytes = count
            .checked_mul(mem::size_of::<T>() as u64)
            .filter(|bytes| *bytes <= MAX_REQUEST_BYTES)
            .ok_or_else(|| MemoryError::invalid_argument("allocation size out of range"))?;
        if bytes == 0 {
            return Err(MemoryError::invalid_argument("cannot allocate zero elements"));
        }
        if mem::align_of::<T>() > MALLOC_ALIGNMENT {
            return Err(MemoryError::invalid_argument("over-aligned element type"));
        }
        Ok(bytes)
    }

    /// Allocates uninitialized space for `count` elements.
    pub fn allocate(&self, count: u64) -> MemoryResult<NonNull<T>> {
        let bytes = Self::request_bytes(count)?;
        Ok(self.memory.allocate_bytes(bytes)?.cast())
    }

    /// Releases space obtained from [`Self::allocate`] with the same
    /// element count.
    pub fn deallocate(&self, pointer: NonNull<T>, count: u64) -> MemoryResult<()> {
        let bytes = Self::request_bytes(count)?;
        self.memory.free_bytes(pointer.cast(), bytes);
        Ok(())
    }
}

impl<T> Clone for TypedAllocator<T> {
    fn clone(&self) -> Self {
        Self {
            memory: Arc::clone(&self.memory),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TypedAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedAllocator")
            .field("element_bytes", &mem::size_of::<T>())
            .finish()
    }
}
