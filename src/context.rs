//! The tilestore [`Context`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

use crate::{
    cache::BoundedLruCache,
    config::{global_config, Config},
    consolidator::{ConsolidationConfig, ConsolidationError, Consolidator},
    fragment::{FragmentId, StoredFragmentMetadataProvider},
    query::{QueryError, ReadQuery, WriteQuery},
    registry::{ArrayHandle, Registry, RegistryError},
    scheduler::IoScheduler,
    schema::{schema_uri, ArraySchema, SchemaError, StoredSchemaProvider},
    storage::{BackendRegistry, StorageError, StorageUri},
    task_pool::{CancellationToken, TaskPool, TaskPoolError},
};

/// A context error.
#[derive(Debug, Error)]
pub enum ContextError {
    /// An array already exists at the URI.
    #[error("an array already exists at {0}")]
    ArrayExists(StorageUri),
    /// A task pool error.
    #[error(transparent)]
    TaskPool(#[from] TaskPoolError),
    /// A registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A schema error.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// A query error.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A consolidation error.
    #[error(transparent)]
    Consolidation(#[from] ConsolidationError),
    /// A storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A monotonic millisecond clock.
///
/// Every call to [`TimestampClock::now`] returns a strictly greater timestamp than the last, even if the system clock stalls or goes backwards.
#[derive(Debug, Default)]
pub struct TimestampClock {
    last: AtomicU64,
}

impl TimestampClock {
    /// Create a new clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next timestamp in milliseconds since the unix epoch.
    pub fn now(&self) -> u64 {
        let system = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| {
                u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
            });
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = system.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

/// The entry point of tilestore.
///
/// A context owns a [`Config`], an [`IoScheduler`] over a [`BackendRegistry`], the shared [`BoundedLruCache`], a [`Registry`] of open arrays, a [`TimestampClock`] and a [`Consolidator`].
/// Contexts are independent: nothing is shared between them except the process-wide [`global_config`] they may be built from.
///
/// ```
/// # use tilestore::{context::Context, fragment::Cell, schema::ArraySchema, storage::StorageUri};
/// let context = Context::new(Context::default_config())?;
/// let uri = StorageUri::new("mem://doc_array")?;
/// context.create_array(&uri, &ArraySchema::new([1, 100], "a")?)?;
///
/// let array = context.open_array(&uri)?;
/// let mut write = context.write_query(&array);
/// write.submit(&[Cell::new(1, vec![1]), Cell::new(2, vec![2])])?;
/// write.finalize()?;
///
/// let cells = context.read_query(&array, [1, 100])?.read_all()?;
/// assert_eq!(cells.len(), 2);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Context {
    config: Config,
    scheduler: IoScheduler,
    cache: Arc<BoundedLruCache>,
    registry: Registry,
    clock: TimestampClock,
    consolidator: Consolidator,
}

impl Context {
    /// Create a context using the backends registered at compile time.
    ///
    /// # Errors
    /// Returns [`ContextError::TaskPool`] if the I/O thread pool cannot be created.
    pub fn new(config: Config) -> Result<Self, ContextError> {
        Self::with_backends(config, BackendRegistry::with_registered_backends())
    }

    /// Create a context using `backends`.
    ///
    /// # Errors
    /// Returns [`ContextError::TaskPool`] if the I/O thread pool cannot be created.
    pub fn with_backends(config: Config, backends: BackendRegistry) -> Result<Self, ContextError> {
        let pool = TaskPool::new(config.io_thread_pool_size())?;
        let scheduler = IoScheduler::new(backends.clone(), pool, &config);
        let cache = Arc::new(BoundedLruCache::new(config.cache_max_size_bytes()));
        let registry = Registry::new(
            Arc::new(StoredSchemaProvider::new(scheduler.clone())),
            Arc::new(StoredFragmentMetadataProvider::new(
                scheduler.clone(),
                cache.clone(),
            )),
            backends,
            config.registry_fragment_metadata_retention(),
        );
        let consolidator = Consolidator::new(
            scheduler.clone(),
            cache.clone(),
            ConsolidationConfig::from(&config),
        );
        Ok(Self {
            config,
            scheduler,
            cache,
            registry,
            clock: TimestampClock::new(),
            consolidator,
        })
    }

    /// Return a copy of the global configuration.
    #[must_use]
    pub fn default_config() -> Config {
        global_config().clone()
    }

    /// Return the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return the I/O scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &IoScheduler {
        &self.scheduler
    }

    /// Return the shared object cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<BoundedLruCache> {
        &self.cache
    }

    /// Return the registry of open arrays.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Return the consolidator.
    #[must_use]
    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    /// Return the next fragment timestamp.
    pub fn timestamp(&self) -> u64 {
        self.clock.now()
    }

    /// Create an empty array at `uri` by writing its schema.
    ///
    /// # Errors
    /// Returns [`ContextError::ArrayExists`] if `uri` already holds a schema, or another [`ContextError`] if the schema cannot be written.
    pub fn create_array(&self, uri: &StorageUri, schema: &ArraySchema) -> Result<(), ContextError> {
        if self.scheduler.size(&schema_uri(uri)?)?.is_some() {
            return Err(ContextError::ArrayExists(uri.clone()));
        }
        StoredSchemaProvider::new(self.scheduler.clone()).store_schema(uri, schema)?;
        log::debug!("created array {uri}");
        Ok(())
    }

    /// Open the array at `uri`.
    ///
    /// # Errors
    /// See [`Registry::open`].
    pub fn open_array(&self, uri: &StorageUri) -> Result<ArrayHandle, ContextError> {
        Ok(self.registry.open(uri)?)
    }

    /// Create a write query for a new fragment of the array of `handle`, timestamped now.
    #[must_use]
    pub fn write_query(&self, handle: &ArrayHandle) -> WriteQuery {
        let timestamp = self.timestamp();
        WriteQuery::new(
            self.scheduler.clone(),
            handle.uri().clone(),
            handle.schema().clone(),
            FragmentId::new(timestamp, timestamp),
        )
    }

    /// Create a read query over the visible fragments of the array of `handle` for the inclusive coordinate `range`.
    ///
    /// # Errors
    /// See [`ReadQuery::new`].
    pub fn read_query(
        &self,
        handle: &ArrayHandle,
        range: [u64; 2],
    ) -> Result<ReadQuery, ContextError> {
        Ok(ReadQuery::new(
            handle,
            self.scheduler.clone(),
            self.cache.clone(),
            range,
            None,
        )?)
    }

    /// Consolidate `fragments` of the array of `handle`.
    ///
    /// # Errors
    /// See [`Consolidator::consolidate`].
    pub fn consolidate(
        &self,
        handle: &ArrayHandle,
        fragments: &[FragmentId],
        cancel: &CancellationToken,
    ) -> Result<Option<FragmentId>, ContextError> {
        Ok(self.consolidator.consolidate(handle, fragments, cancel)?)
    }

    /// Run the configured consolidation steps on the array of `handle`.
    ///
    /// # Errors
    /// See [`Consolidator::consolidate_steps`].
    pub fn consolidate_steps(
        &self,
        handle: &ArrayHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<FragmentId>, ContextError> {
        Ok(self.consolidator.consolidate_steps(handle, cancel)?)
    }

    /// Delete superseded fragments of the array of `handle`.
    ///
    /// # Errors
    /// See [`Consolidator::vacuum`].
    pub fn vacuum(&self, handle: &ArrayHandle) -> Result<usize, ContextError> {
        Ok(self.consolidator.vacuum(handle)?)
    }

    /// Shut down the registry and clear the cache.
    ///
    /// Handles that are still open remain usable for reads of fragment metadata they already hold, but no array can be opened.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.cache.clear();
    }
}
