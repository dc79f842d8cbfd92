//! The parallel I/O scheduler.
//!
//! An [`IoScheduler`] performs one logical read or write of an object either directly or split across a [`TaskPool`].
//! The number of sub-operations is
//! ```text
//! num_ops = clamp(nbytes / io.min_parallel_size_bytes, 1, io.max_parallel_ops.<backend>)
//! ```
//! and `[0, nbytes)` is partitioned with [`partition_byte_range`].
//! A single operation runs on the calling thread.
//!
//! Split reads use [`ReadOptions::random_access`], since the sub-ranges are read concurrently and out of order.
//! If any sub-operation fails the logical operation fails with [`StorageError::ParallelIo`], carrying the first error in submission order.
//! Sub-operations that already completed are not rolled back.

use std::collections::HashMap;

use crate::{
    byte_range::{partition_byte_range, ByteRange},
    config::Config,
    storage::{
        BackendRegistry, IoOperation, ReadOptions, Storage, StorageError, StorageUri,
    },
    task_pool::{wait_all, TaskPool},
};

/// Performs reads and writes through the backend selected by URI scheme, splitting large requests across a worker pool.
#[derive(Debug, Clone)]
pub struct IoScheduler {
    backends: BackendRegistry,
    pool: TaskPool,
    min_parallel_size: u64,
    max_parallel_ops: HashMap<String, usize>,
}

impl IoScheduler {
    /// Create a new scheduler over `backends` and `pool`.
    ///
    /// The parallelism limits are read from `config` for every backend registered in `backends`.
    #[must_use]
    pub fn new(backends: BackendRegistry, pool: TaskPool, config: &Config) -> Self {
        let max_parallel_ops = backends
            .iter()
            .map(|(_, backend)| {
                let name = backend.name();
                (name.to_string(), config.io_max_parallel_ops(name))
            })
            .collect();
        Self {
            backends,
            pool,
            min_parallel_size: config.io_min_parallel_size_bytes().max(1),
            max_parallel_ops,
        }
    }

    /// Return the backends.
    #[must_use]
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Return the task pool.
    #[must_use]
    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Return the backend for `uri`.
    ///
    /// # Errors
    /// Returns [`StorageError::UnsupportedScheme`] if no backend is registered for the scheme of `uri`.
    pub fn backend(&self, uri: &StorageUri) -> Result<&Storage, StorageError> {
        self.backends.backend(uri)
    }

    /// Return the number of sub-operations used to transfer `nbytes` through the backend named `backend`.
    #[must_use]
    pub fn num_ops(&self, backend: &str, nbytes: u64) -> usize {
        let max_ops = self
            .max_parallel_ops
            .get(backend)
            .copied()
            .unwrap_or(1)
            .max(1);
        let num_ops = usize::try_from(nbytes / self.min_parallel_size).unwrap_or(usize::MAX);
        num_ops.clamp(1, max_ops)
    }

    /// Read `buffer.len()` bytes of the object at `uri` starting at `offset` into `buffer`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the backend is not registered or a read fails.
    /// A failed split read returns [`StorageError::ParallelIo`].
    pub fn read(
        &self,
        uri: &StorageUri,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), StorageError> {
        let backend = self.backend(uri)?;
        let nbytes = buffer.len() as u64;
        let num_ops = self.num_ops(backend.name(), nbytes);
        if num_ops == 1 {
            return backend.read(uri, offset, buffer, &ReadOptions::sequential());
        }

        let ranges = partition_byte_range(nbytes, num_ops);
        log::debug!(
            "read {uri} {} split into {} operations",
            ByteRange::new(offset, nbytes),
            ranges.len()
        );
        let options = ReadOptions::random_access();
        let tasks: Vec<_> = split_mut(buffer, &ranges)
            .into_iter()
            .zip(&ranges)
            .map(|(chunk, range)| {
                let options = &options;
                move || backend.read(uri, offset + range.offset(), chunk, options)
            })
            .collect();
        wait_all(self.pool.execute(tasks))
            .map(|_| ())
            .map_err(|err| StorageError::ParallelIo {
                operation: IoOperation::Read,
                uri: uri.clone(),
                source: Box::new(err),
            })
    }

    /// Read `nbytes` of the object at `uri` starting at `offset`.
    ///
    /// # Errors
    /// See [`IoScheduler::read`].
    pub fn read_to_vec(
        &self,
        uri: &StorageUri,
        offset: u64,
        nbytes: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let length = usize::try_from(nbytes)
            .map_err(|_| StorageError::Other(format!("cannot read {nbytes} bytes into memory")))?;
        let mut buffer = vec![0; length];
        self.read(uri, offset, &mut buffer)?;
        Ok(buffer)
    }

    /// Read the whole object at `uri`.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if the object does not exist, or another [`StorageError`] if a read fails.
    pub fn read_all(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError> {
        let size = self
            .size(uri)?
            .ok_or_else(|| StorageError::NotFound(uri.clone()))?;
        self.read_to_vec(uri, 0, size)
    }

    /// Append `data` to the object at `uri`, creating it if it does not exist.
    ///
    /// Returns the offset `data` was written at.
    /// Concurrent appends to the same object are not supported.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the backend is not registered or a write fails.
    /// A failed split write returns [`StorageError::ParallelIo`]; the object is then left partially written and must be discarded by the caller.
    pub fn write(&self, uri: &StorageUri, data: &[u8]) -> Result<u64, StorageError> {
        let offset = self.size(uri)?.unwrap_or(0);
        self.write_at(uri, offset, data)?;
        Ok(offset)
    }

    /// Write `data` to the object at `uri` starting at `offset`.
    ///
    /// # Errors
    /// See [`IoScheduler::write`].
    pub fn write_at(&self, uri: &StorageUri, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let backend = self.backend(uri)?;
        let nbytes = data.len() as u64;
        let num_ops = self.num_ops(backend.name(), nbytes);
        if num_ops == 1 {
            return backend.write(uri, offset, data);
        }

        let ranges = partition_byte_range(nbytes, num_ops);
        log::debug!(
            "write {uri} {} split into {} operations",
            ByteRange::new(offset, nbytes),
            ranges.len()
        );
        let tasks: Vec<_> = ranges
            .iter()
            .map(|range| {
                let chunk = &data[range.to_range_usize()];
                move || backend.write(uri, offset + range.offset(), chunk)
            })
            .collect();
        wait_all(self.pool.execute(tasks))
            .map(|_| ())
            .map_err(|err| StorageError::ParallelIo {
                operation: IoOperation::Write,
                uri: uri.clone(),
                source: Box::new(err),
            })
    }

    /// Return the size of the object at `uri`, or [`None`] if it does not exist.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the backend is not registered or fails.
    pub fn size(&self, uri: &StorageUri) -> Result<Option<u64>, StorageError> {
        self.backend(uri)?.size(uri)
    }

    /// Delete the object at `uri` and all of its descendants.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the backend is not registered or fails.
    pub fn delete(&self, uri: &StorageUri) -> Result<(), StorageError> {
        self.backend(uri)?.delete(uri)
    }

    /// List the direct children of `parent`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the backend is not registered or fails.
    pub fn list(&self, parent: &StorageUri) -> Result<Vec<StorageUri>, StorageError> {
        self.backend(parent)?.list(parent)
    }
}

/// Split `buffer` into the disjoint contiguous chunks described by `ranges`.
fn split_mut<'a>(mut buffer: &'a mut [u8], ranges: &[ByteRange]) -> Vec<&'a mut [u8]> {
    let mut chunks = Vec::with_capacity(ranges.len());
    for range in ranges {
        let (chunk, rest) = std::mem::take(&mut buffer).split_at_mut(range.to_range_usize().len());
        chunks.push(chunk);
        buffer = rest;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::{storage_adapter::PerformanceMetricsStore, store::MemoryStore};

    fn scheduler(min_parallel_size: u64, max_ops: usize) -> (IoScheduler, Arc<PerformanceMetricsStore>) {
        let store = Arc::new(PerformanceMetricsStore::new(Arc::new(MemoryStore::new())));
        let mut backends = BackendRegistry::new();
        backends.register("mem", store.clone());
        let mut config = Config::default();
        config
            .set_io_min_parallel_size_bytes(min_parallel_size)
            .set_io_max_parallel_ops("mem", max_ops);
        let scheduler = IoScheduler::new(backends, TaskPool::new(4).unwrap(), &config);
        (scheduler, store)
    }

    #[test]
    fn scheduler_num_ops() {
        let (scheduler, _) = scheduler(10, 4);
        assert_eq!(scheduler.num_ops("mem", 0), 1);
        assert_eq!(scheduler.num_ops("mem", 9), 1);
        assert_eq!(scheduler.num_ops("mem", 10), 1);
        assert_eq!(scheduler.num_ops("mem", 25), 2);
        assert_eq!(scheduler.num_ops("mem", 1000), 4);
        assert_eq!(scheduler.num_ops("s3", 1000), 1);
    }

    #[test]
    fn scheduler_split_read() {
        let (scheduler, store) = scheduler(10, 4);
        let uri = StorageUri::new("mem://array/object").unwrap();
        let data: Vec<u8> = (0..=255).cycle().take(1001).collect();
        scheduler.backend(&uri).unwrap().write(&uri, 0, &data).unwrap();

        store.reset();
        assert_eq!(scheduler.read_all(&uri).unwrap(), data);
        assert_eq!(store.reads(), 4);
        assert_eq!(store.bytes_read(), 1001);

        store.reset();
        assert_eq!(scheduler.read_to_vec(&uri, 995, 6).unwrap(), &data[995..]);
        assert_eq!(store.reads(), 1);
    }

    #[test]
    fn scheduler_split_write() {
        let (scheduler, store) = scheduler(10, 3);
        let uri = StorageUri::new("mem://array/object").unwrap();
        assert_eq!(scheduler.write(&uri, &[1, 2, 3]).unwrap(), 0);
        let data: Vec<u8> = (0..100).collect();
        assert_eq!(scheduler.write(&uri, &data).unwrap(), 3);
        assert_eq!(store.writes(), 4);
        let all = scheduler.read_all(&uri).unwrap();
        assert_eq!(&all[..3], &[1, 2, 3]);
        assert_eq!(&all[3..], &data[..]);
    }

    #[test]
    fn scheduler_parallel_equivalence() {
        let uri = StorageUri::new("mem://array/object").unwrap();
        let data: Vec<u8> = (0..=255).cycle().take(4099).collect();
        let (serial, _) = scheduler(u64::MAX, 1);
        serial.write(&uri, &data).unwrap();

        for min_parallel_size in [1, 7, 64, 1000, 4099, 5000] {
            let (parallel, _) = scheduler(min_parallel_size, 4);
            parallel.write(&uri, &data).unwrap();
            for (offset, nbytes) in [
                (0, 0),
                (0, min_parallel_size.min(4099)),
                (0, 4099),
                (1, 4098),
                (13, 1001),
                (4099, 0),
            ] {
                let expected = serial.read_to_vec(&uri, offset, nbytes).unwrap();
                let actual = parallel.read_to_vec(&uri, offset, nbytes).unwrap();
                assert_eq!(expected, actual, "{min_parallel_size} {offset} {nbytes}");
            }
            assert_eq!(parallel.read_all(&uri).unwrap(), data);
        }
    }

    #[test]
    fn scheduler_read_error_names_uri() {
        let (scheduler, _) = scheduler(10, 4);
        let uri = StorageUri::new("mem://array/object").unwrap();
        scheduler.write(&uri, &[0; 100]).unwrap();
        let mut buffer = vec![0; 200];
        let err = scheduler.read(&uri, 0, &mut buffer).unwrap_err();
        assert!(matches!(
            err,
            StorageError::ParallelIo {
                operation: IoOperation::Read,
                ..
            }
        ));
        assert!(err.to_string().contains("mem://array/object"));

        let missing = StorageUri::new("mem://array/missing").unwrap();
        assert!(scheduler.read_all(&missing).unwrap_err().is_not_found());
        assert!(scheduler.read(&missing, 0, &mut buffer).unwrap_err().is_not_found());

        let unsupported = StorageUri::new("hdfs://array/object").unwrap();
        assert!(matches!(
            scheduler.read(&unsupported, 0, &mut buffer),
            Err(StorageError::UnsupportedScheme(_))
        ));
    }
}
