//! Storage backend selection by URI scheme.
//!
//! Backends are registered at compile time using the [inventory] crate with a [`StorageBackendPlugin`].
//! [`BackendRegistry::with_registered_backends`] creates one backend instance per registered scheme.
//! Further backends (or shared instances of a registered backend) can be added with [`BackendRegistry::register`].

use std::{collections::BTreeMap, sync::Arc};

use super::{Storage, StorageError, StorageUri};

/// A storage backend plugin, registered with [`inventory::submit!`].
pub struct StorageBackendPlugin {
    scheme: &'static str,
    create_fn: fn() -> Storage,
}

inventory::collect!(StorageBackendPlugin);

impl StorageBackendPlugin {
    /// Create a new plugin for registration.
    pub const fn new(scheme: &'static str, create_fn: fn() -> Storage) -> Self {
        Self { scheme, create_fn }
    }

    /// Return the URI scheme handled by the plugin.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Create a backend instance.
    #[must_use]
    pub fn create(&self) -> Storage {
        (self.create_fn)()
    }
}

/// A map from URI scheme to [`Storage`].
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Storage>,
}

impl BackendRegistry {
    /// Create an empty backend registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend registry with a fresh instance of every backend registered with [`StorageBackendPlugin`].
    #[must_use]
    pub fn with_registered_backends() -> Self {
        let mut registry = Self::new();
        for plugin in inventory::iter::<StorageBackendPlugin> {
            registry.register(plugin.scheme(), plugin.create());
        }
        registry
    }

    /// Register `backend` for `scheme`, returning the backend it replaced.
    pub fn register(&mut self, scheme: &str, backend: Storage) -> Option<Storage> {
        self.backends.insert(scheme.to_ascii_lowercase(), backend)
    }

    /// Return the backend for the scheme of `uri`.
    ///
    /// # Errors
    /// Returns [`StorageError::UnsupportedScheme`] if no backend is registered for the scheme.
    pub fn backend(&self, uri: &StorageUri) -> Result<&Storage, StorageError> {
        self.backends
            .get(uri.scheme())
            .ok_or_else(|| StorageError::UnsupportedScheme(uri.scheme().to_string()))
    }

    /// Return the registered schemes.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Iterate over the registered schemes and their backends.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Storage)> {
        self.backends
            .iter()
            .map(|(scheme, backend)| (scheme.as_str(), backend))
    }

    /// Returns true if `a` and `b` are the same backend instance.
    #[must_use]
    pub fn same_backend(a: &Storage, b: &Storage) -> bool {
        Arc::ptr_eq(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;

    #[test]
    fn backend_registry_registered() {
        let registry = BackendRegistry::with_registered_backends();
        let schemes: Vec<_> = registry.schemes().collect();
        assert!(schemes.contains(&"file"));
        assert!(schemes.contains(&"mem"));
        let mem = registry
            .backend(&StorageUri::new("mem://a").unwrap())
            .unwrap();
        assert_eq!(mem.name(), "mem");
        assert!(matches!(
            registry.backend(&StorageUri::new("s3://bucket/a").unwrap()),
            Err(StorageError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn backend_registry_register() {
        let mut registry = BackendRegistry::new();
        let store: Storage = Arc::new(MemoryStore::new());
        assert!(registry.register("MEM", store.clone()).is_none());
        let backend = registry
            .backend(&StorageUri::new("mem://a").unwrap())
            .unwrap();
        assert!(BackendRegistry::same_backend(backend, &store));
        assert!(registry.register("mem", store).is_some());
    }
}
