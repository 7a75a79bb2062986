//! Hierarchical memory usage accounting.
//!
//! A [`MemoryUsageTracker`] is a node in a tree of byte counters. Charges
//! propagate from leaf to root; any ancestor with a configured cap can
//! reject the whole charge, in which case no node in the chain keeps the
//! update. Updates are lock-free: each node is bumped with an atomic add
//! and rolled back down the chain if an ancestor rejects.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{MemoryError, MemoryResult};

/// A node of hierarchical byte accounting with an optional cap.
pub struct MemoryUsageTracker {
    parent: Option<Arc<MemoryUsageTracker>>,
    current_bytes: AtomicI64,
    peak_bytes: AtomicI64,
    max_total_bytes: i64,
}

impl MemoryUsageTracker {
    /// Creates a root tracker without a cap.
    #[must_use]
    pub fn create() -> Arc<Self> {
        Self::build(None, None)
    }

    /// Creates a root tracker capped at `max_total_bytes`.
    #[must_use]
    pub fn create_with_limit(max_total_bytes: u64) -> Arc<Self> {
        Self::build(None, Some(max_total_bytes))
    }

    /// Creates a child of this tracker without its own cap.
    #[must_use]
    pub fn add_child(self: &Arc<Self>) -> Arc<Self> {
        Self::build(Some(Arc::clone(self)), None)
    }

    /// Creates a child of this tracker capped at `max_total_bytes`.
    #[must_use]
    pub fn add_child_with_limit(self: &Arc<Self>, max_total_bytes: u64) -> Arc<Self> {
        Self::build(Some(Arc::clone(self)), Some(max_total_bytes))
    }

    fn build(parent: Option<Arc<Self>>, max_total_bytes: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            parent,
            current_bytes: AtomicI64::new(0),
            peak_bytes: AtomicI64::new(0),
            max_total_bytes: max_total_bytes.map_or(i64::MAX, |b| b.min(i64::MAX as u64) as i64),
        })
    }

    /// Applies a signed byte delta to this tracker and all its ancestors.
    ///
    /// A positive delta is a charge and fails with
    /// [`MemoryError::OutOfCapacity`] if it would push any node in the chain
    /// over its cap; on failure every node is restored. A negative delta is
    /// a release and always succeeds.
    pub fn update(&self, delta: i64) -> MemoryResult<()> {
        if delta == 0 {
            return Ok(());
        }
        if delta < 0 {
            let mut node = Some(self);
            while let Some(tracker) = node {
                let new = tracker.current_bytes.fetch_add(delta, Ordering::AcqRel) + delta;
                debug_assert!(new >= 0, "tracker released more than it held");
                node = tracker.parent.as_deref();
            }
            return Ok(());
        }

        let mut applied: Vec<&MemoryUsageTracker> = Vec::new();
        let mut node = Some(self);
        while let Some(tracker) = node {
            let new = tracker.current_bytes.fetch_add(delta, Ordering::AcqRel) + delta;
            if new > tracker.max_total_bytes {
                tracker.current_bytes.fetch_sub(delta, Ordering::AcqRel);
                for rollback in applied {
                    rollback.current_bytes.fetch_sub(delta, Ordering::AcqRel);
                }
                let available = (tracker.max_total_bytes - (new - delta)).max(0);
                return Err(MemoryError::OutOfCapacity {
                    requested: delta as u64,
                    available: available as u64,
                });
            }
            tracker.peak_bytes.fetch_max(new, Ordering::AcqRel);
            applied.push(tracker);
            node = tracker.parent.as_deref();
        }
        Ok(())
    }

    /// Charges `bytes` to this tracker.
    pub fn charge(&self, bytes: u64) -> MemoryResult<()> {
        self.update(bytes.min(i64::MAX as u64) as i64)
    }

    /// Releases `bytes` from this tracker.
    pub fn release(&self, bytes: u64) {
        let _ = self.update(-(bytes.min(i64::MAX as u64) as i64));
    }

    /// Bytes currently charged to this node (including descendants).
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire).max(0) as u64
    }

    /// High-water mark of [`Self::current_bytes`].
    #[must_use]
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes.load(Ordering::Acquire).max(0) as u64
    }

    /// The configured cap, if any.
    #[must_use]
    pub fn max_total_bytes(&self) -> Option<u64> {
        if self.max_total_bytes == i64::MAX {
            None
        } else {
            Some(self.max_total_bytes as u64)
        }
    }
}

impl std::fmt::Debug for MemoryUsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryUsageTracker")
            .field("current_bytes", &self.current_bytes())
            .field("peak_bytes", &self.peak_bytes())
            .field("max_total_bytes", &self.max_total_bytes())
            .finish()
    }
}
