use super::{BackendLock, LockMode, StorageError, StorageUri};

/// Options for a [`StorageBackend::read`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadOptions {
    read_ahead: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { read_ahead: true }
    }
}

impl ReadOptions {
    /// Options for a sequential read, permitting read-ahead.
    #[must_use]
    pub const fn sequential() -> Self {
        Self { read_ahead: true }
    }

    /// Options for a random-access read, disabling read-ahead.
    ///
    /// Sub-operations of a split read use these options, since their byte ranges are disjoint.
    #[must_use]
    pub const fn random_access() -> Self {
        Self { read_ahead: false }
    }

    /// Returns true if backends may read ahead of the requested range.
    #[must_use]
    pub const fn read_ahead(&self) -> bool {
        self.read_ahead
    }
}

/// The storage backend contract.
///
/// Objects are addressed by [`StorageUri`]. Objects are byte sequences written positionally.
/// "Directories" are implicit: a URI with descendants is listable and deletable.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// The backend identity, e.g. `file` or `mem`.
    ///
    /// This keys per-backend configuration such as `io.max_parallel_ops.<backend>` and annotates errors.
    fn name(&self) -> &'static str;

    /// Read `buffer.len()` bytes of the object at `uri` starting at `offset` into `buffer`.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if the object does not exist, [`StorageError::OutOfBounds`] if the range extends beyond the end of the object, or another [`StorageError`] if there is an underlying error with the backend.
    fn read(
        &self,
        uri: &StorageUri,
        offset: u64,
        buffer: &mut [u8],
        options: &ReadOptions,
    ) -> Result<(), StorageError>;

    /// Write `data` to the object at `uri` starting at `offset`, creating the object if it does not exist and extending it if required.
    ///
    /// Writes to disjoint ranges of the same object may be issued concurrently.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying error with the backend.
    fn write(&self, uri: &StorageUri, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Return the size in bytes of the object at `uri`, or [`None`] if it does not exist.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying error with the backend.
    fn size(&self, uri: &StorageUri) -> Result<Option<u64>, StorageError>;

    /// Delete the object at `uri` and all of its descendants.
    ///
    /// Succeeds if nothing exists at `uri`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying error with the backend.
    fn delete(&self, uri: &StorageUri) -> Result<(), StorageError>;

    /// List the direct children of `parent`, sorted.
    ///
    /// Returns an empty list if `parent` has no children or does not exist.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying error with the backend.
    fn list(&self, parent: &StorageUri) -> Result<Vec<StorageUri>, StorageError>;

    /// Acquire an advisory lock on the object at `uri`, blocking until it is held.
    ///
    /// Returns [`None`] if the backend does not support locking.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying error with the backend.
    fn lock(&self, uri: &StorageUri, mode: LockMode) -> Result<Option<BackendLock>, StorageError> {
        let _ = (uri, mode);
        Ok(None)
    }

    /// Returns true if an object exists at `uri`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying error with the backend.
    fn is_object(&self, uri: &StorageUri) -> Result<bool, StorageError> {
        Ok(self.size(uri)?.is_some())
    }
}
