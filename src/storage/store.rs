//! Storage backends.
//!
//! - [`MemoryStore`]: an in-memory backend for the `mem` scheme.
//! - [`FilesystemStore`]: a local filesystem backend for the `file` scheme.
//!
//! Both are registered with [`StorageBackendPlugin`](super::StorageBackendPlugin) and are available from [`BackendRegistry::with_registered_backends`](super::BackendRegistry::with_registered_backends).

mod filesystem_store;
mod memory_store;

pub use filesystem_store::FilesystemStore;
pub use memory_store::MemoryStore;
