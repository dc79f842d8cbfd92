//! An embeddable storage core for fragment-based multidimensional arrays.
//!
//! Arrays are written as immutable, timestamped fragments.
//! `tilestore` provides the machinery that sits underneath the read and write paths of such an engine:
//!  - a [`BoundedLruCache`](cache::BoundedLruCache) of byte objects with a total size budget,
//!  - an open-array [`Registry`](registry::Registry) that shares per-array state and reference counts fragment metadata,
//!  - an [`IoScheduler`](scheduler::IoScheduler) that splits large reads and writes into parallel sub-operations over pluggable [storage backends](storage),
//!  - a [`Consolidator`](consolidator::Consolidator) that merges fragments atomically and retires the ones it replaces.
//!
//! ## Getting Started
//! A [`Context`](context::Context) wires these parts together and is the usual entry point.
//!
//! ```rust
//! # use tilestore::{context::Context, fragment::Cell, schema::ArraySchema, storage::StorageUri, task_pool::CancellationToken};
//! let context = Context::new(Context::default_config())?;
//! let uri = StorageUri::new("mem://getting_started")?;
//! context.create_array(&uri, &ArraySchema::new([0, 999], "a")?)?;
//! let array = context.open_array(&uri)?;
//!
//! let mut fragments = Vec::new();
//! for value in 0..3u8 {
//!     let mut write = context.write_query(&array);
//!     write.submit(&[Cell::new(u64::from(value), vec![value]), Cell::new(10, vec![value])])?;
//!     fragments.extend(write.finalize()?);
//! }
//!
//! let consolidated = context.consolidate(&array, &fragments, &CancellationToken::new())?;
//! assert!(consolidated.is_some());
//!
//! let cells = context.read_query(&array, [0, 999])?.read_all()?;
//! assert_eq!(cells.len(), 4);
//! assert_eq!(cells[3].value().as_ref(), &[2]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Storage Layout
//! ```text
//! <array>/__array_schema.json
//! <array>/__lock
//! <array>/__fragments/<fragment>/__fragment_metadata.json
//! <array>/__fragments/<fragment>/__cells.data
//! <array>/__commits/<fragment>.ok
//! <array>/__commits/<fragment>.vac
//! ```
//! A fragment is visible once its commit marker (`.ok`) exists and no committed fragment covers a strictly larger timestamp range.
//!
//! ## Configuration
//! See [`config::Config`] for the available options.
//!
//! ## Logging
//! `tilestore` logs through the [`log`] facade and does not install a logger.
//!
//! ## Licence
//! `tilestore` is licensed under either of
//!  - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//!  - the MIT license <http://opensource.org/licenses/MIT>, at your option.

#![warn(unused_variables)]
#![warn(dead_code)]
#![deny(missing_docs)]
// #![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![deny(clippy::missing_panics_doc)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod byte_range;
pub mod cache;
pub mod config;
pub mod consolidator;
pub mod context;
pub mod fragment;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod task_pool;
