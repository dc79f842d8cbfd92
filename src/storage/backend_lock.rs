//! Advisory locks acquired through a storage backend.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{lock_api, Mutex, RawRwLock, RwLock};

/// The mode of a [`BackendLock`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// A shared lock, compatible with other shared locks.
    Shared,
    /// An exclusive lock.
    Exclusive,
}

/// Traits for a held backend lock. The lock is released when the guard is dropped.
pub trait BackendLockGuard: Send + std::fmt::Debug {
    /// Return the mode the lock was acquired in.
    fn mode(&self) -> LockMode;
}

/// A boxed [`BackendLockGuard`].
pub type BackendLock = Box<dyn BackendLockGuard>;

enum ProcessLockGuardInner {
    Shared(#[allow(dead_code)] lock_api::ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(#[allow(dead_code)] lock_api::ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A lock held in a [`ProcessLocks`] table.
pub struct ProcessLockGuard(ProcessLockGuardInner);

impl std::fmt::Debug for ProcessLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProcessLockGuard")
            .field(&self.mode())
            .finish()
    }
}

impl BackendLockGuard for ProcessLockGuard {
    fn mode(&self) -> LockMode {
        match self.0 {
            ProcessLockGuardInner::Shared(_) => LockMode::Shared,
            ProcessLockGuardInner::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

/// A table of [`parking_lot::RwLock`]-based locks keyed by path, for backends without native locking.
///
/// Locks only exclude other holders in the same process.
/// Acquiring an exclusive lock on a path while the same thread holds a shared lock on it deadlocks.
#[derive(Debug, Default)]
pub struct ProcessLocks(Mutex<HashMap<String, Arc<RwLock<()>>>>);

impl ProcessLocks {
    /// Create a new empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `key` is acquired in `mode`.
    #[must_use]
    pub fn lock(&self, key: &str, mode: LockMode) -> BackendLock {
        let lock = self.0.lock().entry(key.to_string()).or_default().clone();
        Box::new(ProcessLockGuard(match mode {
            LockMode::Shared => ProcessLockGuardInner::Shared(lock.read_arc()),
            LockMode::Exclusive => ProcessLockGuardInner::Exclusive(lock.write_arc()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use rayon::iter::{IntoParallelIterator, ParallelIterator};

    use super::*;

    #[test]
    fn process_locks_shared() {
        let locks = ProcessLocks::new();
        let a = locks.lock("array/__lock", LockMode::Shared);
        let b = locks.lock("array/__lock", LockMode::Shared);
        assert_eq!(a.mode(), LockMode::Shared);
        assert_eq!(b.mode(), LockMode::Shared);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn process_locks_exclusive() {
        let locks = ProcessLocks::new();
        let locks_held = AtomicUsize::new(0);
        (0..8).into_par_iter().for_each(|_| {
            let _lock = locks.lock("array/__lock", LockMode::Exclusive);
            let held = locks_held.fetch_add(1, Ordering::SeqCst);
            assert_eq!(held, 0);
            std::thread::sleep(Duration::from_millis(2));
            locks_held.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
