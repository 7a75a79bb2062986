//! Memory subsystem errors.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// The syscall-equivalent backend primitive that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallKind {
    /// `mmap` of an anonymous range.
    Mmap,
    /// `munmap` of a previously mapped range.
    Munmap,
    /// `madvise(MADV_DONTNEED)` on a mapped range.
    Madvise,
}

impl fmt::Display for SyscallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mmap => "mmap",
            Self::Munmap => "munmap",
            Self::Madvise => "madvise",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during memory allocation operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// An allocator or tracker capacity would be exceeded.
    #[error("out of memory capacity: requested {requested} bytes with {available} available")]
    OutOfCapacity {
        /// Bytes the failing request needed.
        requested: u64,
        /// Bytes that were still available under the violated cap.
        available: u64,
    },

    /// A backend primitive failed, possibly by injection.
    #[error("{call} failed: {source}")]
    Syscall {
        /// Which primitive failed.
        call: SyscallKind,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with it.
        message: String,
    },

    /// Internal bookkeeping disagrees with itself.
    #[error("consistency violation: {message}")]
    ConsistencyViolation {
        /// The invariant that does not hold.
        message: String,
    },
}

impl MemoryError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a consistency violation error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Creates a syscall error from the current `errno`.
    pub(crate) fn syscall(call: SyscallKind) -> Self {
        Self::Syscall {
            call,
            source: io::Error::last_os_error(),
        }
    }

    /// Creates a syscall error standing in for an injected failure.
    pub(crate) fn injected(call: SyscallKind) -> Self {
        Self::Syscall {
            call,
            source: io::Error::new(io::ErrorKind::Other, "injected failure"),
        }
    }

    /// Returns true if this error reports an exhausted capacity.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::OutOfCapacity { .. })
    }

    /// Returns true if a backend primitive failed.
    #[must_use]
    pub fn is_syscall(&self) -> bool {
        matches!(self, Self::Syscall { .. })
    }
}
