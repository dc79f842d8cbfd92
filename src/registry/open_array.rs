use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, OnceLock},
};

use lru::LruCache;
use parking_lot::Mutex;

use crate::{
    fragment::{FragmentId, FragmentMetadata},
    schema::ArraySchema,
    storage::{BackendLock, StorageUri},
};

/// A cached fragment metadata entry with its reference count.
#[derive(Debug)]
pub(super) struct MetadataSlot {
    pub(super) metadata: Arc<FragmentMetadata>,
    pub(super) refs: usize,
    pub(super) generation: u64,
}

#[derive(Debug)]
pub(super) struct OpenArrayState {
    pub(super) open_count: usize,
    pub(super) slots: HashMap<FragmentId, MetadataSlot>,
    /// References to invalidated slots that are still live.
    pub(super) retired_refs: usize,
    pub(super) next_generation: u64,
    /// Bumped by every invalidation.
    pub(super) invalidations: u64,
    /// Unreferenced metadata kept for reuse.
    pub(super) idle: Option<LruCache<FragmentId, Arc<FragmentMetadata>>>,
}

impl OpenArrayState {
    /// Returns true if nothing holds the record open.
    pub(super) fn is_idle(&self) -> bool {
        self.open_count == 0 && self.slots.is_empty() && self.retired_refs == 0
    }

    pub(super) fn new_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// The in-memory state of an open array, shared by every [`ArrayHandle`](super::ArrayHandle) to it.
///
/// Holds the schema (loaded once), the open count, and the reference-counted fragment metadata map.
/// A shared advisory lock on the array is held through the storage backend while the record exists.
#[derive(Debug)]
pub struct OpenArray {
    uri: StorageUri,
    pub(super) schema: OnceLock<Arc<ArraySchema>>,
    /// Serialises schema loading.
    pub(super) load: Mutex<()>,
    pub(super) state: Mutex<OpenArrayState>,
    pub(super) backend_lock: Mutex<Option<BackendLock>>,
}

impl OpenArray {
    pub(super) fn new(uri: StorageUri, retention: usize) -> Self {
        Self {
            uri,
            schema: OnceLock::new(),
            load: Mutex::new(()),
            state: Mutex::new(OpenArrayState {
                open_count: 0,
                slots: HashMap::new(),
                retired_refs: 0,
                next_generation: 0,
                invalidations: 0,
                idle: NonZeroUsize::new(retention).map(LruCache::new),
            }),
            backend_lock: Mutex::new(None),
        }
    }

    /// Return the array URI.
    #[must_use]
    pub fn uri(&self) -> &StorageUri {
        &self.uri
    }

    /// Return the array schema, or [`None`] if it has not been loaded yet.
    #[must_use]
    pub fn schema(&self) -> Option<&Arc<ArraySchema>> {
        self.schema.get()
    }

    /// Return the number of open handles.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Return the number of fragment metadata entries with a positive reference count.
    #[must_use]
    pub fn referenced_fragment_metadata(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Return the reference count of the metadata of `fragment`, or [`None`] if it is not referenced.
    #[must_use]
    pub fn fragment_metadata_refs(&self, fragment: &FragmentId) -> Option<usize> {
        self.state.lock().slots.get(fragment).map(|slot| slot.refs)
    }

    /// Return the number of unreferenced fragment metadata entries retained for reuse.
    #[must_use]
    pub fn retained_fragment_metadata(&self) -> usize {
        self.state.lock().idle.as_ref().map_or(0, LruCache::len)
    }

    /// Returns true if the array holds a backend lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.backend_lock.lock().is_some()
    }
}
