//! Blocking exclusive lock for buffer payloads.
//!
//! The cache uses two lock classes with distinct suspension semantics.
//! Bucket locks protect only in-memory list structure, are held for
//! O(list length) and never across device I/O; `parking_lot::Mutex` is
//! used for those directly. The per-buffer lock is different: it is held
//! across a device transfer, the dominant latency in the system, so a
//! blocked acquirer must relinquish the processor rather than spin, and
//! precondition checks need to ask whether anyone holds it. `SleepLock`
//! wraps the mutex to name that contract and expose the held query.

use parking_lot::Mutex;

/// Guard for an acquired [`SleepLock`]; releases on drop.
pub type SleepLockGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Exclusive lock that may be held across a device transfer.
pub struct SleepLock<T> {
    inner: Mutex<T>,
}

impl<T> SleepLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, suspending the calling thread until it is
    /// available. Wait times are unbounded: the current holder may be in
    /// the middle of a transfer.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.inner.lock()
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Whether any context currently holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T> std::fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SleepLock")
            .field("held", &self.is_held())
            .finish_non_exhaustive()
    }
}
