//! Storage ([backends](store), [storage adapters](storage_adapter), and backend selection by URI scheme).
//!
//! A storage backend is a system that can be used to store and retrieve the objects of an array: its schema, fragment data, fragment metadata and commit markers.
//! For example: a local filesystem, memory, or an object store.
//!
//! Every backend implements [`StorageBackend`], a small positional read/write/delete/list contract.
//! The [`IoScheduler`](crate::scheduler::IoScheduler) and [`Consolidator`](crate::consolidator::Consolidator) depend only on this contract.
//! Backends are selected once per request by URI scheme through a [`BackendRegistry`].
//!
//! This module defines the abstract backend interface and includes a [`MemoryStore`](store::MemoryStore) (`mem://`) and a [`FilesystemStore`](store::FilesystemStore) (`file://`).

mod backend_lock;
mod backend_registry;
pub mod storage_adapter;
mod storage_backend;
mod storage_uri;
pub mod store;

use std::sync::Arc;

use thiserror::Error;

use crate::byte_range::ByteRange;

pub use backend_lock::{BackendLock, BackendLockGuard, LockMode, ProcessLocks};
pub use backend_registry::{BackendRegistry, StorageBackendPlugin};
pub use storage_backend::{ReadOptions, StorageBackend};
pub use storage_uri::{StorageUri, StorageUriError};

/// [`Arc`] wrapped storage backend.
pub type Storage = Arc<dyn StorageBackend>;

/// A logical I/O operation, used to annotate errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
pub enum IoOperation {
    /// A read.
    #[display("read")]
    Read,
    /// A write.
    #[display("write")]
    Write,
}

/// A storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An IO error reported by a backend.
    #[error("{backend} I/O error on {uri}: {source}")]
    Io {
        /// The backend identity.
        backend: &'static str,
        /// The target URI.
        uri: StorageUri,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The object does not exist.
    #[error("{0} not found")]
    NotFound(StorageUri),
    /// A read beyond the end of an object.
    #[error("byte range {byte_range} is beyond the end of {uri} ({size} bytes)")]
    OutOfBounds {
        /// The target URI.
        uri: StorageUri,
        /// The requested byte range.
        byte_range: ByteRange,
        /// The size of the object.
        size: u64,
    },
    /// A sub-operation of a parallel read or write failed.
    #[error("parallel {operation} of {uri} failed: {source}")]
    ParallelIo {
        /// The logical operation.
        operation: IoOperation,
        /// The target URI.
        uri: StorageUri,
        /// The first sub-operation error.
        #[source]
        source: Box<StorageError>,
    },
    /// No backend is registered for a URI scheme.
    #[error("no storage backend registered for scheme {0}")]
    UnsupportedScheme(String),
    /// An invalid URI.
    #[error(transparent)]
    InvalidUri(#[from] StorageUriError),
    /// A write operation was attempted on a read only store.
    #[error("a write operation was attempted on a read only store")]
    ReadOnly,
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Create a [`StorageError::Io`] for `backend` and `uri`.
    #[must_use]
    pub fn io(backend: &'static str, uri: &StorageUri, source: std::io::Error) -> Self {
        Self::Io {
            backend,
            uri: uri.clone(),
            source,
        }
    }

    /// Returns true if the error (or the sub-operation error it wraps) is [`StorageError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::ParallelIo { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let uri = StorageUri::new("mem://array/__fragments/a").unwrap();
        let err = StorageError::io(
            "mem",
            &uri,
            std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        );
        assert_eq!(
            err.to_string(),
            "mem I/O error on mem://array/__fragments/a: disk on fire"
        );
        let err = StorageError::ParallelIo {
            operation: IoOperation::Read,
            uri: uri.clone(),
            source: Box::new(StorageError::NotFound(uri)),
        };
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "parallel read of mem://array/__fragments/a failed: mem://array/__fragments/a not found"
        );
    }
}
