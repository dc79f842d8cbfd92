//! The tile cache.
//!
//! A [`BoundedLruCache`] holds immutable byte objects (e.g. fragment cell blocks) under string keys, bounded by a total size budget and evicting in least-recently-used order.
//! A single cache is shared by all arrays opened through a [`Context`](crate::context::Context).

mod bounded_lru_cache;

pub use bounded_lru_cache::BoundedLruCache;

use thiserror::Error;

/// A cache error.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A read beyond the end of a cached object.
    #[error("read of {nbytes} bytes at offset {offset} is out of range of cached object {key} ({size} bytes)")]
    OutOfRange {
        /// The cache key.
        key: String,
        /// The read offset.
        offset: u64,
        /// The requested number of bytes.
        nbytes: u64,
        /// The size of the cached object.
        size: u64,
    },
}
