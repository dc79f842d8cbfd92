//! Sparse read and write queries.
//!
//! Cells are `(u64 coordinate, bytes)` pairs in global order (ascending coordinate).
//!
//! A [`WriteQuery`] writes a new fragment: cells are appended in blocks of at most [`ArraySchema::capacity`](crate::schema::ArraySchema::capacity) cells and the fragment becomes visible when [`WriteQuery::finalize`] writes its commit marker.
//!
//! A [`ReadQuery`] reads a coordinate range over a set of fragments into a bounded [`CellBuffer`], merging fragments so that the most recently created fragment wins on equal coordinates.
//! Fragment metadata is held through the [`Registry`](crate::registry::Registry) for the lifetime of the query and cell blocks are read through the tile cache.

mod cell_buffer;
mod read_query;
mod write_query;

pub use cell_buffer::CellBuffer;
pub use read_query::ReadQuery;
pub use write_query::WriteQuery;

use derive_more::derive::Display;
use thiserror::Error;

use crate::{
    cache::CacheError, fragment::FragmentError, registry::RegistryError, storage::StorageError,
};

/// The status of a query.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum QueryStatus {
    /// A write query accepting cells.
    #[display("in progress")]
    InProgress,
    /// A read query with more results to deliver.
    #[display("incomplete")]
    Incomplete,
    /// The query has completed.
    #[display("completed")]
    Completed,
    /// The query failed.
    #[display("failed")]
    Failed,
    /// The write query was aborted.
    #[display("aborted")]
    Aborted,
}

/// A query error.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A fragment error.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    /// A storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A cache error.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// A coordinate outside the array domain.
    #[error("coordinate {coordinate} is outside the domain [{}, {}]", domain[0], domain[1])]
    OutOfDomain {
        /// The coordinate.
        coordinate: u64,
        /// The array domain.
        domain: [u64; 2],
    },
    /// Cells submitted out of global order.
    #[error("coordinate {coordinate} does not follow {previous} in global order")]
    Unordered {
        /// The previous coordinate.
        previous: u64,
        /// The offending coordinate.
        coordinate: u64,
    },
    /// An invalid read range.
    #[error("invalid read range [{}, {}]", .0[0], .0[1])]
    InvalidRange([u64; 2]),
    /// A cell is larger than an empty result buffer.
    #[error("a cell of {cell_size} bytes does not fit in a result buffer of {capacity} bytes")]
    BufferTooSmall {
        /// The encoded size of the cell.
        cell_size: usize,
        /// The buffer capacity.
        capacity: usize,
    },
    /// An operation that is invalid in the current query status.
    #[error("invalid operation on a query with status {0}")]
    InvalidStatus(QueryStatus),
}
