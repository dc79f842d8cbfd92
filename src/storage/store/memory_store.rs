//! An in-memory store.

use parking_lot::{Mutex, RwLock};

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    byte_range::ByteRange,
    storage::{
        BackendLock, LockMode, ProcessLocks, ReadOptions, Storage, StorageBackend,
        StorageBackendPlugin, StorageError, StorageUri,
    },
};

// Register the store.
inventory::submit! {
    StorageBackendPlugin::new("mem", create_store_memory)
}

fn create_store_memory() -> Storage {
    Arc::new(MemoryStore::new())
}

/// An in-memory store.
///
/// Objects are keyed by URI path; the scheme is ignored.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data_map: Mutex<BTreeMap<String, Arc<RwLock<Vec<u8>>>>>,
    locks: ProcessLocks,
}

impl MemoryStore {
    /// Create a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_data(&self, uri: &StorageUri) -> Option<Arc<RwLock<Vec<u8>>>> {
        self.data_map.lock().get(uri.path()).cloned()
    }
}

fn children_prefix(uri: &StorageUri) -> String {
    let path = uri.path();
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

impl StorageBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn read(
        &self,
        uri: &StorageUri,
        offset: u64,
        buffer: &mut [u8],
        _options: &ReadOptions,
    ) -> Result<(), StorageError> {
        let data = self
            .get_data(uri)
            .ok_or_else(|| StorageError::NotFound(uri.clone()))?;
        let data = data.read();
        let byte_range = ByteRange::new(offset, buffer.len() as u64);
        let size = data.len() as u64;
        if byte_range.end() > size {
            return Err(StorageError::OutOfBounds {
                uri: uri.clone(),
                byte_range,
                size,
            });
        }
        buffer.copy_from_slice(&data[byte_range.to_range_usize()]);
        Ok(())
    }

    fn write(&self, uri: &StorageUri, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut data_map = self.data_map.lock();
        let object = data_map
            .entry(uri.path().to_string())
            .or_insert_with(|| Arc::new(RwLock::default()))
            .clone();
        drop(data_map);
        let mut object = object.write();

        let offset = usize::try_from(offset).map_err(|_| StorageError::OutOfBounds {
            uri: uri.clone(),
            byte_range: ByteRange::new(offset, data.len() as u64),
            size: object.len() as u64,
        })?;
        if offset == 0 && object.is_empty() {
            // fast path
            *object = data.to_vec();
        } else {
            let length = offset + data.len();
            if object.len() < length {
                object.resize(length, 0);
            }
            object[offset..length].copy_from_slice(data);
        }
        Ok(())
    }

    fn size(&self, uri: &StorageUri) -> Result<Option<u64>, StorageError> {
        Ok(self.get_data(uri).map(|data| data.read().len() as u64))
    }

    fn delete(&self, uri: &StorageUri) -> Result<(), StorageError> {
        let prefix = children_prefix(uri);
        self.data_map
            .lock()
            .retain(|path, _| path != uri.path() && !path.starts_with(&prefix));
        Ok(())
    }

    fn list(&self, parent: &StorageUri) -> Result<Vec<StorageUri>, StorageError> {
        let prefix = children_prefix(parent);
        let data_map = self.data_map.lock();
        let mut children: Vec<&str> = data_map
            .range(prefix.clone()..)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(&prefix))
            .filter_map(|path| path[prefix.len()..].split('/').next())
            .filter(|child| !child.is_empty())
            .collect();
        children.dedup();
        children
            .into_iter()
            .map(|child| parent.join(child).map_err(StorageError::from))
            .collect()
    }

    fn lock(&self, uri: &StorageUri, mode: LockMode) -> Result<Option<BackendLock>, StorageError> {
        Ok(Some(self.locks.lock(uri.path(), mode)))
    }
}
