//! A storage adapter which records performance metrics.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::storage::{
    BackendLock, LockMode, ReadOptions, Storage, StorageBackend, StorageError, StorageUri,
};

/// The performance metrics storage adapter. Accumulates metrics, such as bytes read and written.
///
/// It is intended to aid in testing by allowing the application to validate that metrics (e.g., bytes read/written, total read/write operations, peak concurrent reads) match expected values for specific operations.
#[derive(Debug)]
pub struct PerformanceMetricsStore {
    storage: Storage,
    bytes_read: AtomicUsize,
    bytes_written: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    locks: AtomicUsize,
    active_reads: AtomicUsize,
    peak_active_reads: AtomicUsize,
}

struct ActiveRead<'a>(&'a AtomicUsize);

impl Drop for ActiveRead<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PerformanceMetricsStore {
    /// Create a new performance metrics adapter over `storage`.
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            bytes_read: AtomicUsize::default(),
            bytes_written: AtomicUsize::default(),
            reads: AtomicUsize::default(),
            writes: AtomicUsize::default(),
            deletes: AtomicUsize::default(),
            locks: AtomicUsize::default(),
            active_reads: AtomicUsize::default(),
            peak_active_reads: AtomicUsize::default(),
        }
    }

    /// Returns the number of bytes read.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes written.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the number of read requests.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of write requests.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of delete requests.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Returns the number of lock requests.
    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::Relaxed)
    }

    /// Returns the largest number of reads observed in flight at once.
    pub fn peak_concurrent_reads(&self) -> usize {
        self.peak_active_reads.load(Ordering::SeqCst)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.bytes_read,
            &self.bytes_written,
            &self.reads,
            &self.writes,
            &self.deletes,
            &self.locks,
            &self.peak_active_reads,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

impl StorageBackend for PerformanceMetricsStore {
    fn name(&self) -> &'static str {
        self.storage.name()
    }

    fn read(
        &self,
        uri: &StorageUri,
        offset: u64,
        buffer: &mut [u8],
        options: &ReadOptions,
    ) -> Result<(), StorageError> {
        let active = self.active_reads.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveRead(&self.active_reads);
        self.peak_active_reads.fetch_max(active, Ordering::SeqCst);
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.storage.read(uri, offset, buffer, options)?;
        self.bytes_read.fetch_add(buffer.len(), Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, uri: &StorageUri, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(data.len(), Ordering::Relaxed);
        self.storage.write(uri, offset, data)
    }

    fn size(&self, uri: &StorageUri) -> Result<Option<u64>, StorageError> {
        self.storage.size(uri)
    }

    fn delete(&self, uri: &StorageUri) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.storage.delete(uri)
    }

    fn list(&self, parent: &StorageUri) -> Result<Vec<StorageUri>, StorageError> {
        self.storage.list(parent)
    }

    fn lock(&self, uri: &StorageUri, mode: LockMode) -> Result<Option<BackendLock>, StorageError> {
        self.locks.fetch_add(1, Ordering::Relaxed);
        self.storage.lock(uri, mode)
    }
}
