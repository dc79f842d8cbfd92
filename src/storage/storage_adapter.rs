//! Storage adapters.
//!
//! An adapter wraps another [`Storage`](super::Storage) and implements [`StorageBackend`](super::StorageBackend) itself, so it can be registered in place of the backend it wraps.

mod performance_metrics;

pub use performance_metrics::PerformanceMetricsStore;
