//! Fragments.
//!
//! A fragment is an immutable, write-once set of cells of an array in global cell order, plus its metadata.
//! The layout of an array directory is
//! ```text
//! <array>/__array_schema.json
//! <array>/__lock
//! <array>/__fragments/<fragment>/__fragment_metadata.json
//! <array>/__fragments/<fragment>/__cells.data
//! <array>/__commits/<fragment>.ok
//! <array>/__commits/<fragment>.vac
//! ```
//! A fragment is visible only once its commit marker (`.ok`) exists.
//! A vacuum file (`.vac`) lists the fragments superseded by a consolidated fragment.

mod cell_block;
mod fragment_id;
mod fragment_info;
mod fragment_metadata;

pub use cell_block::{decode_cells, encode_cells, Cell};
pub use fragment_id::FragmentId;
pub use fragment_info::FragmentInfo;
pub use fragment_metadata::{BlockMetadata, FragmentMetadata};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    cache::BoundedLruCache,
    scheduler::IoScheduler,
    storage::{StorageError, StorageUri},
};

use std::sync::Arc;

/// The directory of fragment directories.
pub const FRAGMENTS_DIR: &str = "__fragments";
/// The directory of commit markers and vacuum files.
pub const COMMITS_DIR: &str = "__commits";
/// The name of the advisory lock object of an array.
pub const LOCK_FILE: &str = "__lock";
/// The name of the metadata object in a fragment directory.
pub const FRAGMENT_METADATA_FILE: &str = "__fragment_metadata.json";
/// The name of the cell data object in a fragment directory.
pub const CELLS_FILE: &str = "__cells.data";
/// The suffix of a commit marker.
pub const COMMIT_SUFFIX: &str = ".ok";
/// The suffix of a vacuum file.
pub const VACUUM_SUFFIX: &str = ".vac";

/// A fragment error.
#[derive(Debug, Error)]
pub enum FragmentError {
    /// A storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Invalid fragment metadata JSON.
    #[error("invalid fragment metadata JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// Invalid fragment metadata.
    #[error("invalid fragment metadata: {0}")]
    InvalidMetadata(String),
    /// An invalid fragment name.
    #[error("invalid fragment name {0}")]
    InvalidName(String),
    /// A cell block could not be decoded.
    #[error("corrupt cell block: {0}")]
    CorruptBlock(String),
    /// A cell value is too large to encode.
    #[error("the value of cell {0} is too large")]
    CellTooLarge(u64),
}

impl FragmentError {
    /// Returns true if the error is caused by a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_not_found())
    }
}

/// Return the URI of the fragments directory of `array`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the URI cannot be formed.
pub fn fragments_uri(array: &StorageUri) -> Result<StorageUri, StorageError> {
    Ok(array.join(FRAGMENTS_DIR)?)
}

/// Return the URI of the commit directory of `array`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the URI cannot be formed.
pub fn commits_uri(array: &StorageUri) -> Result<StorageUri, StorageError> {
    Ok(array.join(COMMITS_DIR)?)
}

/// Return the URI of the directory of `fragment`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the URI cannot be formed.
pub fn fragment_uri(array: &StorageUri, fragment: &FragmentId) -> Result<StorageUri, StorageError> {
    Ok(fragments_uri(array)?.join(&fragment.to_string())?)
}

/// Return the URI of the metadata of `fragment`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the URI cannot be formed.
pub fn fragment_metadata_uri(
    array: &StorageUri,
    fragment: &FragmentId,
) -> Result<StorageUri, StorageError> {
    Ok(fragment_uri(array, fragment)?.join(FRAGMENT_METADATA_FILE)?)
}

/// Return the URI of the cell data of `fragment`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the URI cannot be formed.
pub fn cells_uri(array: &StorageUri, fragment: &FragmentId) -> Result<StorageUri, StorageError> {
    Ok(fragment_uri(array, fragment)?.join(CELLS_FILE)?)
}

/// Return the URI of the commit marker of `fragment`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the URI cannot be formed.
pub fn commit_uri(array: &StorageUri, fragment: &FragmentId) -> Result<StorageUri, StorageError> {
    Ok(commits_uri(array)?.join(&format!("{fragment}{COMMIT_SUFFIX}"))?)
}

/// Return the URI of the vacuum file of the consolidated fragment `fragment`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the URI cannot be formed.
pub fn vacuum_uri(array: &StorageUri, fragment: &FragmentId) -> Result<StorageUri, StorageError> {
    Ok(commits_uri(array)?.join(&format!("{fragment}{VACUUM_SUFFIX}"))?)
}

/// Encode a vacuum file listing `fragments`, one name per line.
#[must_use]
pub fn encode_vacuum_file(fragments: &[FragmentId]) -> Vec<u8> {
    fragments
        .iter()
        .map(|fragment| format!("{fragment}\n"))
        .collect::<String>()
        .into_bytes()
}

/// Decode a vacuum file.
///
/// # Errors
/// Returns [`FragmentError::InvalidName`] if a line is not a fragment name.
pub fn decode_vacuum_file(bytes: &[u8]) -> Result<Vec<FragmentId>, FragmentError> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

/// Fetches fragment metadata. Called by the [`Registry`](crate::registry::Registry) on a metadata miss.
pub trait FragmentMetadataProvider: Send + Sync + std::fmt::Debug {
    /// Fetch the metadata of `fragment` of `array`.
    ///
    /// # Errors
    /// Returns a [`FragmentError`] if the metadata does not exist or is invalid.
    fn fetch_fragment_metadata(
        &self,
        array: &StorageUri,
        fragment: &FragmentId,
    ) -> Result<FragmentMetadata, FragmentError>;

    /// Drop anything kept for `fragment` of `array` by earlier fetches.
    ///
    /// Called when metadata fetched concurrently with an invalidation is discarded.
    fn evict_fragment_metadata(&self, _array: &StorageUri, _fragment: &FragmentId) {}
}

/// A [`FragmentMetadataProvider`] reading `__fragment_metadata.json` through an [`IoScheduler`].
///
/// The serialised metadata is kept in a [`BoundedLruCache`], so repeated fetches after the registry has freed a metadata entry do not reach the backend.
#[derive(Debug, Clone)]
pub struct StoredFragmentMetadataProvider {
    scheduler: IoScheduler,
    cache: Arc<BoundedLruCache>,
}

impl StoredFragmentMetadataProvider {
    /// Create a new stored fragment metadata provider.
    #[must_use]
    pub fn new(scheduler: IoScheduler, cache: Arc<BoundedLruCache>) -> Self {
        Self { scheduler, cache }
    }
}

impl FragmentMetadataProvider for StoredFragmentMetadataProvider {
    fn fetch_fragment_metadata(
        &self,
        array: &StorageUri,
        fragment: &FragmentId,
    ) -> Result<FragmentMetadata, FragmentError> {
        let uri = fragment_metadata_uri(array, fragment)?;
        let key = uri.to_string();
        let json = if let Some(json) = self.cache.get(&key) {
            json
        } else {
            let json = Bytes::from(self.scheduler.read_all(&uri)?);
            self.cache.insert(key, json.clone());
            json
        };
        let metadata = FragmentMetadata::from_json(&json)?;
        if metadata.fragment() != fragment {
            return Err(FragmentError::InvalidMetadata(format!(
                "{uri} describes fragment {}",
                metadata.fragment()
            )));
        }
        Ok(metadata)
    }

    fn evict_fragment_metadata(&self, array: &StorageUri, fragment: &FragmentId) {
        if let Ok(uri) = fragment_metadata_uri(array, fragment) {
            self.cache.remove(&uri.to_string());
        }
    }
}
