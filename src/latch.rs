use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Restart signal raised by the hybrid latch protocol.
///
/// Propagated by early return out of a descent; the enclosing operation
/// drops every open guard on the way out and retries from the root. Never
/// surfaced to callers of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart;

impl fmt::Display for Restart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("latch conflict, operation must restart")
    }
}

pub type LatchResult<T> = Result<T, Restart>;

/// Hybrid lock guarding one page: a 64-bit version word next to a
/// reader-writer lock.
///
/// The version word is odd exactly while a writer holds the latch
/// exclusively; every exclusive release publishes a fresh even version.
/// Optimistic readers acquire without blocking (`try_read`), remember the
/// version they saw, and revalidate it wherever the protocol requires,
/// so any exclusive acquisition in between invalidates them.
pub struct HybridLatch<T> {
    version: AtomicU64,
    data: RwLock<T>,
}

impl<T> HybridLatch<T> {
    pub fn new(data: T) -> Self {
        Self {
            version: AtomicU64::new(0),
            data: RwLock::new(data),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_exclusively_latched(&self) -> bool {
        self.version() & 1 == 1
    }

    /// The version the latch will carry once the current exclusive holder
    /// releases. Meaningful only while exclusively latched.
    pub fn version_after_release(&self) -> u64 {
        debug_assert!(self.is_exclusively_latched());
        self.version() + 1
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read()
    }

    pub(crate) fn try_read(&self) -> LatchResult<RwLockReadGuard<'_, T>> {
        self.data.try_read().ok_or(Restart)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.data.write()
    }

    pub(crate) fn try_write(&self) -> LatchResult<RwLockWriteGuard<'_, T>> {
        self.data.try_write().ok_or(Restart)
    }

    /// Flip the version word to odd. Must only be called while holding the
    /// write half; pairs with [`Self::mark_released`].
    pub(crate) fn mark_locked(&self) -> u64 {
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(v & 1 == 1);
        v
    }

    /// Publish a fresh even version. Must be called while still holding the
    /// write half, immediately before dropping it.
    pub(crate) fn mark_released(&self) -> u64 {
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(v & 1 == 0);
        v
    }

    /// Validate a previously observed version.
    pub fn validate(&self, seen: u64) -> LatchResult<()> {
        if self.version() == seen {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    /// Observe the current version for an optimistic acquisition. Fails if
    /// a writer is active.
    pub fn observe(&self) -> LatchResult<u64> {
        let v = self.version();
        if v & 1 == 1 {
            return Err(Restart);
        }
        Ok(v)
    }
}

impl<T: fmt::Debug> fmt::Debug for HybridLatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridLatch")
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_cycle_bumps_version_twice() {
        let latch = HybridLatch::new(0u32);
        assert_eq!(latch.version(), 0);

        let guard = latch.write();
        let locked = latch.mark_locked();
        assert_eq!(locked, 1);
        assert!(latch.is_exclusively_latched());
        assert_eq!(latch.version_after_release(), 2);

        let released = latch.mark_released();
        drop(guard);
        assert_eq!(released, 2);
        assert!(!latch.is_exclusively_latched());
    }

    #[test]
    fn observe_fails_while_writer_active() {
        let latch = HybridLatch::new(());
        let guard = latch.write();
        latch.mark_locked();
        assert_eq!(latch.observe(), Err(Restart));
        latch.mark_released();
        drop(guard);
        assert!(latch.observe().is_ok());
    }

    #[test]
    fn validation_detects_intervening_writer() {
        let latch = HybridLatch::new(7u64);
        let seen = latch.observe().unwrap();

        {
            let mut guard = latch.write();
            latch.mark_locked();
            *guard = 8;
            latch.mark_released();
        }

        assert_eq!(latch.validate(seen), Err(Restart));
        let fresh = latch.observe().unwrap();
        assert!(latch.validate(fresh).is_ok());
    }

    #[test]
    fn try_read_conflicts_with_writer() {
        let latch = HybridLatch::new(());
        let write = latch.write();
        latch.mark_locked();
        assert!(latch.try_read().is_err());
        latch.mark_released();
        drop(write);
        assert!(latch.try_read().is_ok());
    }

    #[test]
    fn concurrent_writers_serialize() {
        let latch = std::sync::Arc::new(HybridLatch::new(0u64));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let latch = latch.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        let mut guard = latch.write();
                        latch.mark_locked();
                        *guard += 1;
                        latch.mark_released();
                    }
                });
            }
        });
        assert_eq!(*latch.read(), 400);
        // 400 acquisitions, two bumps each.
        assert_eq!(latch.version(), 800);
    }
}
