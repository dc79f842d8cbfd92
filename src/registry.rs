//! The open-array registry.
//!
//! A [`Registry`] maps array URIs to shared [`OpenArray`] records.
//! Every [`ArrayHandle`] returned by [`Registry::open`] on the same URI shares one record, which holds the array schema (loaded once) and the reference-counted fragment metadata map.
//!
//! Locking: the registry map lock is taken before any per-array lock and neither is held across I/O.
//! Schema loading holds a per-array load lock, so concurrent opens of one array are serialised only while its record is constructed.
//!
//! A record is removed once it has no open handles and no live [`FragmentMetadataRef`]s.

mod array_handle;
mod fragment_metadata_ref;
mod open_array;

pub use array_handle::ArrayHandle;
pub use fragment_metadata_ref::FragmentMetadataRef;
pub use open_array::OpenArray;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use open_array::MetadataSlot;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    fragment::{FragmentError, FragmentId, FragmentMetadataProvider, LOCK_FILE},
    schema::{ArraySchema, SchemaError, SchemaProvider},
    storage::{BackendRegistry, LockMode, StorageError, StorageUri},
};

/// A registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry has been shut down.
    #[error("the registry has been shut down")]
    ShutDown,
    /// The array does not exist.
    #[error("array {0} not found")]
    NotFound(StorageUri),
    /// The fragment does not exist.
    #[error("fragment {fragment} of array {array} not found")]
    FragmentNotFound {
        /// The array URI.
        array: StorageUri,
        /// The fragment.
        fragment: FragmentId,
    },
    /// The handle has been closed.
    #[error("array handle to {0} is closed")]
    Closed(StorageUri),
    /// The schema could not be loaded.
    #[error(transparent)]
    Schema(SchemaError),
    /// Fragment metadata could not be fetched.
    #[error(transparent)]
    Fragment(FragmentError),
    /// A storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug)]
struct RegistryInner {
    arrays: Mutex<HashMap<StorageUri, Arc<OpenArray>>>,
    shut_down: AtomicBool,
    schema_provider: Arc<dyn SchemaProvider>,
    metadata_provider: Arc<dyn FragmentMetadataProvider>,
    backends: BackendRegistry,
    retention: usize,
}

/// The open-array registry.
///
/// Cloning a [`Registry`] shares the same map of open arrays.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a new empty registry.
    ///
    /// `backends` are used to acquire a shared advisory lock on every open array.
    /// Up to `retention` unreferenced fragment metadata entries are retained per open array.
    #[must_use]
    pub fn new(
        schema_provider: Arc<dyn SchemaProvider>,
        metadata_provider: Arc<dyn FragmentMetadataProvider>,
        backends: BackendRegistry,
        retention: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                arrays: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
                schema_provider,
                metadata_provider,
                backends,
                retention,
            }),
        }
    }

    /// Open the array at `uri`.
    ///
    /// The schema is loaded on the first open of the array.
    ///
    /// # Errors
    /// Returns [`RegistryError::ShutDown`] if the registry has been shut down, [`RegistryError::NotFound`] if the array has no schema, or another [`RegistryError`] if the schema cannot be loaded.
    /// A failed first open leaves no record behind.
    pub fn open(&self, uri: &StorageUri) -> Result<ArrayHandle, RegistryError> {
        let array = {
            let mut arrays = self.inner.arrays.lock();
            if self.is_shut_down() {
                return Err(RegistryError::ShutDown);
            }
            let array = arrays
                .entry(uri.clone())
                .or_insert_with(|| {
                    log::debug!("registry: new record for {uri}");
                    Arc::new(OpenArray::new(uri.clone(), self.inner.retention))
                })
                .clone();
            array.state.lock().open_count += 1;
            array
        };

        match self.load(&array) {
            Ok(schema) => Ok(ArrayHandle::new(self.clone(), array, schema)),
            Err(err) => {
                self.close_array(&array);
                Err(err)
            }
        }
    }

    fn load(&self, array: &Arc<OpenArray>) -> Result<Arc<ArraySchema>, RegistryError> {
        let _load = array.load.lock();
        if let Some(schema) = array.schema.get() {
            return Ok(schema.clone());
        }

        let uri = array.uri();
        let schema = self
            .inner
            .schema_provider
            .load_schema(uri)
            .map_err(|err| match err {
                SchemaError::Storage(err) if err.is_not_found() => {
                    RegistryError::NotFound(uri.clone())
                }
                err => RegistryError::Schema(err),
            })?;
        let backend = self.inner.backends.backend(uri)?;
        let lock_uri = uri.join(LOCK_FILE).map_err(StorageError::from)?;
        let lock = backend.lock(&lock_uri, LockMode::Shared)?;
        *array.backend_lock.lock() = lock;

        let schema = Arc::new(schema);
        Ok(array.schema.get_or_init(|| schema).clone())
    }

    /// Decrement the open count of `array`, removing its record if idle.
    pub(crate) fn close_array(&self, array: &Arc<OpenArray>) {
        let mut state = array.state.lock();
        state.open_count = state.open_count.saturating_sub(1);
        if state.open_count == 0 {
            if let Some(idle) = state.idle.as_mut() {
                idle.clear();
            }
        }
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.remove_if_idle(array);
        }
    }

    /// Remove the record of `array` if it is still registered and idle.
    pub(crate) fn remove_if_idle(&self, array: &Arc<OpenArray>) {
        let mut arrays = self.inner.arrays.lock();
        let registered = arrays
            .get(array.uri())
            .is_some_and(|registered| Arc::ptr_eq(registered, array));
        if registered && array.state.lock().is_idle() {
            arrays.remove(array.uri());
            log::debug!("registry: removed record for {}", array.uri());
        }
    }

    /// Return the metadata of `fragment` of the array of `handle`, fetching it on a miss.
    ///
    /// A hit increments the reference count of the cached entry.
    /// On a miss the metadata is fetched without holding any registry lock and inserted with a reference count of one.
    /// Metadata fetched while an invalidation of the array ran is returned without being cached.
    ///
    /// # Errors
    /// Returns [`RegistryError::Closed`] if `handle` is closed, [`RegistryError::FragmentNotFound`] if the fragment has no metadata, or [`RegistryError::Fragment`] if the metadata cannot be fetched.
    pub fn get_or_fetch_fragment_metadata(
        &self,
        handle: &ArrayHandle,
        fragment: &FragmentId,
    ) -> Result<FragmentMetadataRef, RegistryError> {
        if handle.is_closed() {
            return Err(RegistryError::Closed(handle.uri().clone()));
        }
        let array = handle.open_array();
        if let Some(metadata) = self.get_cached(array, fragment) {
            return Ok(metadata);
        }

        let invalidations = array.state.lock().invalidations;
        let metadata = self
            .inner
            .metadata_provider
            .fetch_fragment_metadata(array.uri(), fragment)
            .map_err(|err| {
                if err.is_not_found() {
                    RegistryError::FragmentNotFound {
                        array: array.uri().clone(),
                        fragment: *fragment,
                    }
                } else {
                    RegistryError::Fragment(err)
                }
            })?;

        let mut state = array.state.lock();
        let stale = state.invalidations != invalidations;
        let (generation, metadata) = if let Some(slot) = state.slots.get_mut(fragment) {
            // Fetched concurrently
            slot.refs += 1;
            (slot.generation, slot.metadata.clone())
        } else if stale {
            // Invalidated during the fetch, so handed out without a slot
            state.retired_refs += 1;
            (state.new_generation(), Arc::new(metadata))
        } else {
            let generation = state.new_generation();
            let metadata = Arc::new(metadata);
            state.slots.insert(
                *fragment,
                MetadataSlot {
                    metadata: metadata.clone(),
                    refs: 1,
                    generation,
                },
            );
            (generation, metadata)
        };
        drop(state);
        if stale {
            log::debug!(
                "registry: fragment metadata {fragment} of {} invalidated during fetch",
                array.uri()
            );
            self.inner
                .metadata_provider
                .evict_fragment_metadata(array.uri(), fragment);
        }
        Ok(FragmentMetadataRef::new(
            self.clone(),
            array.clone(),
            *fragment,
            generation,
            metadata,
        ))
    }

    fn get_cached(
        &self,
        array: &Arc<OpenArray>,
        fragment: &FragmentId,
    ) -> Option<FragmentMetadataRef> {
        let mut state = array.state.lock();
        let (generation, metadata) = if let Some(slot) = state.slots.get_mut(fragment) {
            slot.refs += 1;
            (slot.generation, slot.metadata.clone())
        } else {
            let metadata = state.idle.as_mut()?.pop(fragment)?;
            let generation = state.new_generation();
            state.slots.insert(
                *fragment,
                MetadataSlot {
                    metadata: metadata.clone(),
                    refs: 1,
                    generation,
                },
            );
            (generation, metadata)
        };
        drop(state);
        Some(FragmentMetadataRef::new(
            self.clone(),
            array.clone(),
            *fragment,
            generation,
            metadata,
        ))
    }

    /// Release a reference to fragment metadata. Equivalent to dropping it.
    pub fn release_fragment_metadata(&self, metadata: FragmentMetadataRef) {
        metadata.release();
    }

    /// Invalidate the cached metadata of `fragment` of the open array at `array`.
    ///
    /// Subsequent fetches reload the metadata.
    /// Live references keep the invalidated entry readable and it is freed when the last is released.
    /// Does nothing if the array is not open or the metadata is not cached.
    pub fn invalidate_fragment_metadata(&self, array: &StorageUri, fragment: &FragmentId) {
        let array = self.inner.arrays.lock().get(array).cloned();
        if let Some(array) = array {
            self.invalidate(&array, fragment);
        }
    }

    pub(crate) fn invalidate(&self, array: &Arc<OpenArray>, fragment: &FragmentId) {
        let mut state = array.state.lock();
        state.invalidations += 1;
        if let Some(slot) = state.slots.remove(fragment) {
            state.retired_refs += slot.refs;
        }
        if let Some(idle) = state.idle.as_mut() {
            idle.pop(fragment);
        }
    }

    /// Return the URIs of the arrays with a record, sorted.
    #[must_use]
    pub fn open_arrays(&self) -> Vec<StorageUri> {
        let mut uris: Vec<_> = self.inner.arrays.lock().keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Return the number of open handles to the array at `uri`.
    #[must_use]
    pub fn open_count(&self, uri: &StorageUri) -> usize {
        let array = self.inner.arrays.lock().get(uri).cloned();
        array.map_or(0, |array| array.open_count())
    }

    /// Return the record of the array at `uri`, if any.
    #[must_use]
    pub fn open_array(&self, uri: &StorageUri) -> Option<Arc<OpenArray>> {
        self.inner.arrays.lock().get(uri).cloned()
    }

    /// Shut down the registry, dropping every record.
    ///
    /// Further opens fail with [`RegistryError::ShutDown`].
    /// Existing handles and metadata references remain usable until dropped.
    pub fn shutdown(&self) {
        let mut arrays = self.inner.arrays.lock();
        self.inner.shut_down.store(true, Ordering::SeqCst);
        log::debug!("registry: shutdown with {} records", arrays.len());
        arrays.clear();
    }

    /// Returns true if the registry has been shut down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        fragment::{BlockMetadata, FragmentMetadata},
        storage::store::MemoryStore,
    };

    #[derive(Debug, Default)]
    struct TestProvider {
        schema_loads: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl SchemaProvider for TestProvider {
        fn load_schema(&self, array: &StorageUri) -> Result<ArraySchema, SchemaError> {
            self.schema_loads.fetch_add(1, Ordering::SeqCst);
            if array.path().ends_with("missing") {
                Err(StorageError::NotFound(array.clone()).into())
            } else if array.path().ends_with("broken") {
                Err(SchemaError::Invalid("broken".to_string()))
            } else {
                ArraySchema::new([0, 100], "a")
            }
        }
    }

    impl FragmentMetadataProvider for TestProvider {
        fn fetch_fragment_metadata(
            &self,
            array: &StorageUri,
            fragment: &FragmentId,
        ) -> Result<FragmentMetadata, FragmentError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if fragment.t_start() == 0 {
                return Err(StorageError::NotFound(array.clone()).into());
            }
            FragmentMetadata::new(*fragment, vec![BlockMetadata::new(0, 1, 1, 1, 1)])
        }
    }

    fn registry(retention: usize) -> (Registry, Arc<TestProvider>) {
        let provider = Arc::new(TestProvider::default());
        let mut backends = BackendRegistry::new();
        backends.register("mem", Arc::new(MemoryStore::new()));
        let registry = Registry::new(provider.clone(), provider.clone(), backends, retention);
        (registry, provider)
    }

    fn uri(path: &str) -> StorageUri {
        StorageUri::new(format!("mem://{path}")).unwrap()
    }

    #[test]
    fn registry_open_close() {
        let (registry, provider) = registry(0);
        let a = uri("a");
        let handle1 = registry.open(&a).unwrap();
        let handle2 = registry.open(&a).unwrap();
        assert_eq!(provider.schema_loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.open_count(&a), 2);
        assert!(Arc::ptr_eq(handle1.open_array(), handle2.open_array()));
        assert!(handle1.open_array().is_locked());
        assert_eq!(handle1.schema().attribute(), "a");

        assert!(handle1.close());
        assert!(!handle1.close());
        assert_eq!(registry.open_count(&a), 1);
        drop(handle1);
        assert_eq!(registry.open_count(&a), 1);
        drop(handle2);
        assert_eq!(registry.open_count(&a), 0);
        assert!(registry.open_arrays().is_empty());

        // Reopening loads the schema again
        let _handle = registry.open(&a).unwrap();
        assert_eq!(provider.schema_loads.load(Ordering::SeqCst), 2);
        assert_eq!(registry.open_arrays(), vec![a]);
    }

    #[test]
    fn registry_open_failure_rolls_back() {
        let (registry, _) = registry(0);
        assert!(matches!(
            registry.open(&uri("missing")),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.open(&uri("broken")),
            Err(RegistryError::Schema(SchemaError::Invalid(_)))
        ));
        assert!(registry.open_arrays().is_empty());
        assert!(matches!(
            registry.open(&StorageUri::new("s3://bucket/a").unwrap()),
            Err(RegistryError::Storage(StorageError::UnsupportedScheme(_)))
        ));
        assert!(registry.open_arrays().is_empty());
    }

    #[test]
    fn registry_fragment_metadata_refcount() {
        let (registry, provider) = registry(0);
        let a = uri("a");
        let handle = registry.open(&a).unwrap();
        let fragment = FragmentId::new(1, 1);

        let ref1 = handle.fragment_metadata(&fragment).unwrap();
        let ref2 = registry.get_or_fetch_fragment_metadata(&handle, &fragment).unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(ref1.fragment(), &fragment);
        assert_eq!(ref2.cell_count(), 1);
        let array = handle.open_array().clone();
        assert_eq!(array.fragment_metadata_refs(&fragment), Some(2));

        registry.release_fragment_metadata(ref1);
        assert_eq!(array.fragment_metadata_refs(&fragment), Some(1));

        // The record outlives the last handle while metadata is referenced
        drop(handle);
        assert_eq!(registry.open_arrays(), vec![a.clone()]);
        assert_eq!(registry.open_count(&a), 0);
        drop(ref2);
        assert_eq!(array.fragment_metadata_refs(&fragment), None);
        assert!(registry.open_arrays().is_empty());

        // Freed at zero, so fetched again
        let handle = registry.open(&a).unwrap();
        let _ref = handle.fragment_metadata(&fragment).unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);

        assert!(matches!(
            handle.fragment_metadata(&FragmentId::new(0, 0)),
            Err(RegistryError::FragmentNotFound { .. })
        ));
        handle.close();
        assert!(matches!(
            handle.fragment_metadata(&fragment),
            Err(RegistryError::Closed(_))
        ));
    }

    #[test]
    fn registry_fragment_metadata_retention() {
        let (registry, provider) = registry(1);
        let handle = registry.open(&uri("a")).unwrap();
        let f1 = FragmentId::new(1, 1);
        let f2 = FragmentId::new(2, 2);
        drop(handle.fragment_metadata(&f1).unwrap());
        assert_eq!(handle.open_array().retained_fragment_metadata(), 1);
        drop(handle.fragment_metadata(&f1).unwrap());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

        drop(handle.fragment_metadata(&f2).unwrap());
        drop(handle.fragment_metadata(&f1).unwrap());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(handle.open_array().retained_fragment_metadata(), 1);

        handle.invalidate_fragment_metadata(&f1);
        assert_eq!(handle.open_array().retained_fragment_metadata(), 0);
    }

    #[test]
    fn registry_invalidate_while_referenced() {
        let (registry, provider) = registry(0);
        let a = uri("a");
        let handle = registry.open(&a).unwrap();
        let fragment = FragmentId::new(1, 1);
        let old = handle.fragment_metadata(&fragment).unwrap();

        registry.invalidate_fragment_metadata(&a, &fragment);
        let array = handle.open_array().clone();
        assert_eq!(array.fragment_metadata_refs(&fragment), None);
        // The invalidated entry is still readable
        assert_eq!(old.fragment(), &fragment);
        assert_eq!(old.non_empty_domain(), [1, 1]);

        let new = handle.fragment_metadata(&fragment).unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
        drop(old);
        assert_eq!(array.fragment_metadata_refs(&fragment), Some(1));

        drop(handle);
        assert_eq!(registry.open_arrays(), vec![a]);
        drop(new);
        assert!(registry.open_arrays().is_empty());
    }

    #[test]
    fn registry_concurrent_open_close() {
        use rayon::prelude::*;

        let (registry, provider) = registry(0);
        let a = uri("a");
        let fragment = FragmentId::new(1, 1);
        (0..64).into_par_iter().for_each(|i| {
            let handle = registry.open(&a).unwrap();
            let metadata = handle.fragment_metadata(&fragment).unwrap();
            if i % 2 == 0 {
                handle.close();
                handle.close();
            }
            if i % 3 == 0 {
                handle.invalidate_fragment_metadata(&fragment);
            }
            assert_eq!(metadata.fragment(), &fragment);
        });
        assert!(registry.open_arrays().is_empty());
        assert!(provider.schema_loads.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn registry_shutdown() {
        let (registry, _) = registry(0);
        let a = uri("a");
        let handle = registry.open(&a).unwrap();
        let metadata = handle.fragment_metadata(&FragmentId::new(1, 1)).unwrap();
        registry.shutdown();
        assert!(registry.is_shut_down());
        assert!(registry.open_arrays().is_empty());
        assert!(matches!(registry.open(&a), Err(RegistryError::ShutDown)));
        drop(metadata);
        drop(handle);
        assert!(registry.open_arrays().is_empty());
    }

    #[derive(Debug)]
    struct PausingProvider {
        fetching: std::sync::Barrier,
        resume: std::sync::Barrier,
        evictions: AtomicUsize,
    }

    impl SchemaProvider for PausingProvider {
        fn load_schema(&self, _array: &StorageUri) -> Result<ArraySchema, SchemaError> {
            ArraySchema::new([0, 100], "a")
        }
    }

    impl FragmentMetadataProvider for PausingProvider {
        fn fetch_fragment_metadata(
            &self,
            _array: &StorageUri,
            fragment: &FragmentId,
        ) -> Result<FragmentMetadata, FragmentError> {
            if fragment.t_start() == 1 {
                self.fetching.wait();
                self.resume.wait();
            }
            FragmentMetadata::new(*fragment, vec![BlockMetadata::new(0, 1, 1, 1, 1)])
        }

        fn evict_fragment_metadata(&self, _array: &StorageUri, _fragment: &FragmentId) {
            self.evictions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registry_invalidate_during_fetch() {
        let provider = Arc::new(PausingProvider {
            fetching: std::sync::Barrier::new(2),
            resume: std::sync::Barrier::new(2),
            evictions: AtomicUsize::new(0),
        });
        let mut backends = BackendRegistry::new();
        backends.register("mem", Arc::new(MemoryStore::new()));
        let registry = Registry::new(provider.clone(), provider.clone(), backends, 4);
        let a = uri("a");
        let handle = registry.open(&a).unwrap();
        let fragment = FragmentId::new(1, 1);

        std::thread::scope(|scope| {
            let fetch = scope.spawn(|| handle.fragment_metadata(&fragment).unwrap());
            provider.fetching.wait();
            registry.invalidate_fragment_metadata(&a, &fragment);
            provider.resume.wait();
            let metadata = fetch.join().unwrap();
            assert_eq!(metadata.cell_count(), 1);
            assert_eq!(handle.open_array().fragment_metadata_refs(&fragment), None);
            drop(metadata);
        });
        assert_eq!(handle.open_array().retained_fragment_metadata(), 0);
        assert_eq!(provider.evictions.load(Ordering::SeqCst), 1);

        // Fetches that do not race an invalidation are cached as usual
        drop(handle.fragment_metadata(&FragmentId::new(2, 2)).unwrap());
        assert_eq!(handle.open_array().retained_fragment_metadata(), 1);
        assert_eq!(provider.evictions.load(Ordering::SeqCst), 1);

        drop(handle);
        assert!(registry.open_arrays().is_empty());
    }
}
