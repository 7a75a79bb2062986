//! Thin wrappers over the kernel mapping primitives.

use std::ptr::{self, NonNull};

use crate::error::{MemoryError, MemoryResult, SyscallKind};

/// Maps a fresh anonymous range of `len` bytes, readable and writable.
///
/// `MAP_NORESERVE` keeps large reservations cheap: pages are only backed
/// once touched.
pub(crate) fn map_anonymous(len: usize) -> MemoryResult<NonNull<u8>> {
    // SAFETY: requesting a fresh anonymous mapping with no fixed address.
    let address = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if address == libc::MAP_FAILED {
        return Err(MemoryError::syscall(SyscallKind::Mmap));
    }
    NonNull::new(address as *mut u8).ok_or_else(|| MemoryError::syscall(SyscallKind::Mmap))
}

/// Unmaps a range previously returned by [`map_anonymous`].
pub(crate) fn unmap(address: NonNull<u8>, len: usize) -> MemoryResult<()> {
    // SAFETY: the caller owns the mapping and nothing references it anymore.
    let rc = unsafe { libc::munmap(address.as_ptr() as *mut libc::c_void, len) };
    if rc != 0 {
        return Err(MemoryError::syscall(SyscallKind::Munmap));
    }
    Ok(())
}

/// An owned anonymous mapping, unmapped on drop.
pub(crate) struct MmapRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is owned exclusively; interior access is coordinated
// by the allocator structures that embed it.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    pub(crate) fn anonymous(len: usize) -> MemoryResult<Self> {
        let base = map_anonymous(len)?;
        Ok(Self { base, len })
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, address: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let address = address as usize;
        address >= base && address < base + self.len
    }

    /// Byte offset of `address` inside the region, if it lies within.
    pub(crate) fn offset_of(&self, address: *const u8) -> Option<usize> {
        if self.contains(address) {
            Some(address as usize - self.base.as_ptr() as usize)
        } else {
            None
        }
    }

    /// Releases the physical backing of `[offset, offset + len)` while
    /// keeping the address range reserved.
    pub(crate) fn advise_dont_need(&self, offset: usize, len: usize) -> MemoryResult<()> {
        debug_assert!(offset + len <= self.len);
        // SAFETY: the sub-range lies within this owned mapping.
        let rc = unsafe {
            libc::madvise(
                self.base.as_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            return Err(MemoryError::syscall(SyscallKind::Madvise));
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(error) = unmap(self.base, self.len) {
            tracing::error!(%error, len = self.len, "failed to unmap region");
        }
    }
}

impl std::fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
