//! Tilestore configuration options.

use std::{
    collections::HashMap,
    sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;

/// Configuration options for a [`Context`](crate::context::Context).
///
/// A [`Config`] can be built programmatically with the typed setters, from `(param, value)` string pairs with [`Config::set`], or from a flat JSON object with [`Config::from_json`].
/// The process-wide default configuration is retrieved with [`global_config`] and modified with [`global_config_mut`].
///
/// # Cache Configuration Options
/// ## Cache Max Size
/// > param: `cache.max_size_bytes`, default: `10485760` (10 MiB)
///
/// The size budget of the [`BoundedLruCache`](crate::cache::BoundedLruCache) used for fragment metadata bytes and tile data.
///
/// # I/O Configuration Options
/// ## Minimum Parallel Size
/// > param: `io.min_parallel_size_bytes`, default: `10485760` (10 MiB)
///
/// Each parallel sub-operation of a read or write is responsible for at least this many bytes.
///
/// ## Maximum Parallel Operations
/// > param: `io.max_parallel_ops.<backend>`, default: [`std::thread::available_parallelism`]`()` for `file` and `mem`, `1` otherwise
///
/// The maximum number of parallel sub-operations issued against a single object of a storage backend.
///
/// ## Thread Pool Size
/// > param: `io.thread_pool_size`, default: [`std::thread::available_parallelism`]`()`
///
/// The number of worker threads in the shared I/O [`TaskPool`](crate::task_pool::TaskPool).
///
/// # Consolidation Configuration Options
/// ## Buffer Size
/// > param: `consolidation.buffer_size_bytes`, default: `1048576` (1 MiB)
///
/// The size of the cell buffer reused across the consolidation copy loop.
///
/// ## Steps
/// > param: `consolidation.steps`, default: `1`
///
/// The number of select-and-merge steps performed by [`Consolidator::consolidate_steps`](crate::consolidator::Consolidator::consolidate_steps).
///
/// ## Step Fragment Bounds
/// > params: `consolidation.step_min_frags` (default `2`), `consolidation.step_max_frags` (default [`u32::MAX`])
///
/// The minimum and maximum number of fragments merged in a single step.
///
/// ## Step Size Ratio
/// > param: `consolidation.step_size_ratio`, default: `0.0`
///
/// Adjacent fragments are only merged if the ratio of the smaller to the larger fragment size is at least this value.
///
/// # Registry Configuration Options
/// ## Fragment Metadata Retention
/// > param: `registry.fragment_metadata_retention`, default: `0`
///
/// The number of unreferenced fragment metadata entries an open array keeps in memory.
/// With the default of zero, metadata is freed as soon as its last reference is released.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    cache_max_size_bytes: u64,
    io_min_parallel_size_bytes: u64,
    io_max_parallel_ops: HashMap<String, usize>,
    io_thread_pool_size: usize,
    consolidation_buffer_size_bytes: u64,
    consolidation_steps: u32,
    consolidation_step_min_frags: u32,
    consolidation_step_max_frags: u32,
    consolidation_step_size_ratio: f32,
    registry_fragment_metadata_retention: usize,
}

/// A configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An unrecognised configuration parameter.
    #[error("unknown configuration parameter {0}")]
    UnknownParameter(String),
    /// A value that could not be parsed or is out of range for its parameter.
    #[error("invalid value {value} for configuration parameter {param}: {reason}")]
    InvalidValue {
        /// The parameter.
        param: String,
        /// The rejected value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Invalid JSON.
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = available_parallelism();
        Config {
            cache_max_size_bytes: 10 * 1024 * 1024,
            io_min_parallel_size_bytes: 10 * 1024 * 1024,
            io_max_parallel_ops: HashMap::from([
                ("file".to_string(), parallelism),
                ("mem".to_string(), parallelism),
            ]),
            io_thread_pool_size: parallelism,
            consolidation_buffer_size_bytes: 1024 * 1024,
            consolidation_steps: 1,
            consolidation_step_min_frags: 2,
            consolidation_step_max_frags: u32::MAX,
            consolidation_step_size_ratio: 0.0,
            registry_fragment_metadata_retention: 0,
        }
    }
}

fn parse_value<T: std::str::FromStr>(param: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            param: param.to_string(),
            value: value.to_string(),
            reason: err.to_string(),
        })
}

fn parse_positive<T>(param: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse_value(param, value)?;
    if parsed == T::default() {
        Err(ConfigError::InvalidValue {
            param: param.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        })
    } else {
        Ok(parsed)
    }
}

impl Config {
    /// Create a [`Config`] from `(param, value)` pairs applied over the defaults.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if a parameter is unknown or a value is invalid.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (param, value) in pairs {
            config.set(param, value)?;
        }
        Ok(config)
    }

    /// Create a [`Config`] from a flat JSON object of parameters applied over the defaults.
    ///
    /// Values may be JSON numbers or strings, e.g. `{"cache.max_size_bytes": 1024, "io.max_parallel_ops.s3": "8"}`.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the JSON is not an object, a parameter is unknown, or a value is invalid.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut config = Self::default();
        for (param, value) in &map {
            let value = match value {
                serde_json::Value::String(string) => string.clone(),
                other => other.to_string(),
            };
            config.set(param, &value)?;
        }
        Ok(config)
    }

    /// Set a configuration parameter from its string representation.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if `param` is unknown or `value` is invalid for it.
    pub fn set(&mut self, param: &str, value: &str) -> Result<(), ConfigError> {
        match param {
            "cache.max_size_bytes" => self.cache_max_size_bytes = parse_value(param, value)?,
            "io.min_parallel_size_bytes" => {
                self.io_min_parallel_size_bytes = parse_positive(param, value)?;
            }
            "io.thread_pool_size" => self.io_thread_pool_size = parse_positive(param, value)?,
            "consolidation.buffer_size_bytes" => {
                self.consolidation_buffer_size_bytes = parse_positive(param, value)?;
            }
            "consolidation.steps" => self.consolidation_steps = parse_value(param, value)?,
            "consolidation.step_min_frags" => {
                self.consolidation_step_min_frags = parse_value(param, value)?;
            }
            "consolidation.step_max_frags" => {
                self.consolidation_step_max_frags = parse_value(param, value)?;
            }
            "consolidation.step_size_ratio" => {
                let ratio: f32 = parse_value(param, value)?;
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(ConfigError::InvalidValue {
                        param: param.to_string(),
                        value: value.to_string(),
                        reason: "must be in [0, 1]".to_string(),
                    });
                }
                self.consolidation_step_size_ratio = ratio;
            }
            "registry.fragment_metadata_retention" => {
                self.registry_fragment_metadata_retention = parse_value(param, value)?;
            }
            _ => {
                let Some(backend) = param.strip_prefix("io.max_parallel_ops.") else {
                    return Err(ConfigError::UnknownParameter(param.to_string()));
                };
                if backend.is_empty() {
                    return Err(ConfigError::UnknownParameter(param.to_string()));
                }
                let max_parallel_ops = parse_positive(param, value)?;
                self.io_max_parallel_ops
                    .insert(backend.to_string(), max_parallel_ops);
            }
        }
        Ok(())
    }

    /// Get the [cache max size](#cache-max-size) configuration.
    #[must_use]
    pub fn cache_max_size_bytes(&self) -> u64 {
        self.cache_max_size_bytes
    }

    /// Set the [cache max size](#cache-max-size) configuration.
    pub fn set_cache_max_size_bytes(&mut self, max_size_bytes: u64) -> &mut Self {
        self.cache_max_size_bytes = max_size_bytes;
        self
    }

    /// Get the [minimum parallel size](#minimum-parallel-size) configuration.
    #[must_use]
    pub fn io_min_parallel_size_bytes(&self) -> u64 {
        self.io_min_parallel_size_bytes
    }

    /// Set the [minimum parallel size](#minimum-parallel-size) configuration.
    ///
    /// A value of zero is treated as one.
    pub fn set_io_min_parallel_size_bytes(&mut self, min_parallel_size_bytes: u64) -> &mut Self {
        self.io_min_parallel_size_bytes = min_parallel_size_bytes.max(1);
        self
    }

    /// Get the [maximum parallel operations](#maximum-parallel-operations) for `backend`.
    #[must_use]
    pub fn io_max_parallel_ops(&self, backend: &str) -> usize {
        self.io_max_parallel_ops.get(backend).copied().unwrap_or(1)
    }

    /// Set the [maximum parallel operations](#maximum-parallel-operations) for `backend`.
    ///
    /// A value of zero is treated as one.
    pub fn set_io_max_parallel_ops(&mut self, backend: &str, max_parallel_ops: usize) -> &mut Self {
        self.io_max_parallel_ops
            .insert(backend.to_string(), max_parallel_ops.max(1));
        self
    }

    /// Get the [thread pool size](#thread-pool-size) configuration.
    #[must_use]
    pub fn io_thread_pool_size(&self) -> usize {
        self.io_thread_pool_size
    }

    /// Set the [thread pool size](#thread-pool-size) configuration.
    ///
    /// A value of zero is treated as one.
    pub fn set_io_thread_pool_size(&mut self, thread_pool_size: usize) -> &mut Self {
        self.io_thread_pool_size = thread_pool_size.max(1);
        self
    }

    /// Get the [consolidation buffer size](#buffer-size) configuration.
    #[must_use]
    pub fn consolidation_buffer_size_bytes(&self) -> u64 {
        self.consolidation_buffer_size_bytes
    }

    /// Set the [consolidation buffer size](#buffer-size) configuration.
    ///
    /// A value of zero is treated as one.
    pub fn set_consolidation_buffer_size_bytes(&mut self, buffer_size_bytes: u64) -> &mut Self {
        self.consolidation_buffer_size_bytes = buffer_size_bytes.max(1);
        self
    }

    /// Get the [consolidation steps](#steps) configuration.
    #[must_use]
    pub fn consolidation_steps(&self) -> u32 {
        self.consolidation_steps
    }

    /// Set the [consolidation steps](#steps) configuration.
    pub fn set_consolidation_steps(&mut self, steps: u32) -> &mut Self {
        self.consolidation_steps = steps;
        self
    }

    /// Get the minimum number of fragments per [consolidation step](#step-fragment-bounds).
    #[must_use]
    pub fn consolidation_step_min_frags(&self) -> u32 {
        self.consolidation_step_min_frags
    }

    /// Set the minimum number of fragments per [consolidation step](#step-fragment-bounds).
    pub fn set_consolidation_step_min_frags(&mut self, min_frags: u32) -> &mut Self {
        self.consolidation_step_min_frags = min_frags;
        self
    }

    /// Get the maximum number of fragments per [consolidation step](#step-fragment-bounds).
    #[must_use]
    pub fn consolidation_step_max_frags(&self) -> u32 {
        self.consolidation_step_max_frags
    }

    /// Set the maximum number of fragments per [consolidation step](#step-fragment-bounds).
    pub fn set_consolidation_step_max_frags(&mut self, max_frags: u32) -> &mut Self {
        self.consolidation_step_max_frags = max_frags;
        self
    }

    /// Get the [consolidation step size ratio](#step-size-ratio) configuration.
    #[must_use]
    pub fn consolidation_step_size_ratio(&self) -> f32 {
        self.consolidation_step_size_ratio
    }

    /// Set the [consolidation step size ratio](#step-size-ratio) configuration, clamped to `[0, 1]`.
    pub fn set_consolidation_step_size_ratio(&mut self, size_ratio: f32) -> &mut Self {
        self.consolidation_step_size_ratio = size_ratio.clamp(0.0, 1.0);
        self
    }

    /// Get the [fragment metadata retention](#fragment-metadata-retention) configuration.
    #[must_use]
    pub fn registry_fragment_metadata_retention(&self) -> usize {
        self.registry_fragment_metadata_retention
    }

    /// Set the [fragment metadata retention](#fragment-metadata-retention) configuration.
    pub fn set_registry_fragment_metadata_retention(&mut self, retention: usize) -> &mut Self {
        self.registry_fragment_metadata_retention = retention;
        self
    }
}

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Returns a reference to the global tilestore configuration.
///
/// # Panics
/// This function panics if the underlying lock has been poisoned and might panic if the global config is already held by the current thread.
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    CONFIG
        .get_or_init(|| RwLock::new(Config::default()))
        .read()
        .unwrap()
}

/// Returns a mutable reference to the global tilestore configuration.
///
/// # Panics
/// This function panics if the underlying lock has been poisoned and might panic if the global config is already held by the current thread.
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    CONFIG
        .get_or_init(|| RwLock::new(Config::default()))
        .write()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_set_params() {
        let mut config = Config::default();
        config.set("cache.max_size_bytes", "100").unwrap();
        config.set("io.min_parallel_size_bytes", "4096").unwrap();
        config.set("io.max_parallel_ops.s3", "8").unwrap();
        config.set("consolidation.step_size_ratio", "0.5").unwrap();
        assert_eq!(config.cache_max_size_bytes(), 100);
        assert_eq!(config.io_min_parallel_size_bytes(), 4096);
        assert_eq!(config.io_max_parallel_ops("s3"), 8);
        assert_eq!(config.io_max_parallel_ops("hdfs"), 1);
        assert!((config.consolidation_step_size_ratio() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn config_invalid_params() {
        let mut config = Config::default();
        assert!(matches!(
            config.set("cache.nope", "1"),
            Err(ConfigError::UnknownParameter(_))
        ));
        assert!(matches!(
            config.set("io.max_parallel_ops.", "1"),
            Err(ConfigError::UnknownParameter(_))
        ));
        assert!(matches!(
            config.set("io.min_parallel_size_bytes", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("cache.max_size_bytes", "lots"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(config.set("consolidation.step_size_ratio", "1.5").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn config_from_json() {
        let config = Config::from_json(
            r#"{"cache.max_size_bytes": 1024, "io.max_parallel_ops.file": "3", "consolidation.steps": 2}"#,
        )
        .unwrap();
        assert_eq!(config.cache_max_size_bytes(), 1024);
        assert_eq!(config.io_max_parallel_ops("file"), 3);
        assert_eq!(config.consolidation_steps(), 2);
        assert!(Config::from_json("[1, 2]").is_err());
        assert!(Config::from_json(r#"{"unknown": 1}"#).is_err());
    }

    #[test]
    fn config_global() {
        let retention = global_config().registry_fragment_metadata_retention();
        global_config_mut().set_registry_fragment_metadata_retention(retention + 1);
        assert_eq!(
            global_config().registry_fragment_metadata_retention(),
            retention + 1
        );
        global_config_mut().set_registry_fragment_metadata_retention(retention);
    }
}
