//! Array schemas.
//!
//! An array has a one-dimensional `u64` domain and a single variable-length attribute.
//! Its schema is stored as JSON in `<array>/__array_schema.json` and loaded once per open through a [`SchemaProvider`].

use derive_more::derive::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    scheduler::IoScheduler,
    storage::{StorageError, StorageUri},
};

/// The name of the schema object in an array directory.
pub const ARRAY_SCHEMA_FILE: &str = "__array_schema.json";

const ARRAY_SCHEMA_VERSION: u32 = 1;

/// The default number of cells per fragment data block.
pub const DEFAULT_CAPACITY: u64 = 10_000;

/// An array schema error.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The stored schema is not valid JSON.
    #[error("invalid array schema JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The schema is invalid.
    #[error("invalid array schema: {0}")]
    Invalid(String),
}

/// The global cell order of an array.
///
/// Both orders sort cells by ascending coordinate on a one-dimensional domain.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug, Display, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CellOrder {
    /// Row-major.
    #[default]
    #[display("row-major")]
    RowMajor,
    /// Column-major.
    #[display("col-major")]
    ColMajor,
}

/// A sparse array schema.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
#[serde(deny_unknown_fields)]
pub struct ArraySchema {
    version: u32,
    domain: [u64; 2],
    attribute: String,
    #[serde(default)]
    cell_order: CellOrder,
    capacity: u64,
}

impl ArraySchema {
    /// Create a new schema over the inclusive coordinate `domain` with one attribute named `attribute`.
    ///
    /// # Errors
    /// Returns [`SchemaError::Invalid`] if the domain is empty or the attribute name is empty.
    pub fn new(domain: [u64; 2], attribute: impl Into<String>) -> Result<Self, SchemaError> {
        let schema = Self {
            version: ARRAY_SCHEMA_VERSION,
            domain,
            attribute: attribute.into(),
            cell_order: CellOrder::default(),
            capacity: DEFAULT_CAPACITY,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Set the global cell order.
    #[must_use]
    pub fn with_cell_order(mut self, cell_order: CellOrder) -> Self {
        self.cell_order = cell_order;
        self
    }

    /// Set the maximum number of cells in a fragment data block.
    ///
    /// # Errors
    /// Returns [`SchemaError::Invalid`] if `capacity` is zero.
    pub fn with_capacity(mut self, capacity: u64) -> Result<Self, SchemaError> {
        self.capacity = capacity;
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.version != ARRAY_SCHEMA_VERSION {
            return Err(SchemaError::Invalid(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.domain[0] > self.domain[1] {
            return Err(SchemaError::Invalid(format!(
                "empty domain [{}, {}]",
                self.domain[0], self.domain[1]
            )));
        }
        if self.attribute.is_empty() {
            return Err(SchemaError::Invalid("empty attribute name".to_string()));
        }
        if self.capacity == 0 {
            return Err(SchemaError::Invalid("capacity must be positive".to_string()));
        }
        Ok(())
    }

    /// Return the inclusive coordinate domain.
    #[must_use]
    pub fn domain(&self) -> [u64; 2] {
        self.domain
    }

    /// Return the attribute name.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Return the global cell order.
    #[must_use]
    pub fn cell_order(&self) -> CellOrder {
        self.cell_order
    }

    /// Return the maximum number of cells in a fragment data block.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns true if `coordinate` is inside the domain.
    #[must_use]
    pub fn contains(&self, coordinate: u64) -> bool {
        (self.domain[0]..=self.domain[1]).contains(&coordinate)
    }

    /// Serialise the schema to JSON.
    ///
    /// # Errors
    /// Returns [`SchemaError::InvalidJson`] if serialisation fails.
    pub fn to_json(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialise and validate a schema from JSON.
    ///
    /// # Errors
    /// Returns [`SchemaError::InvalidJson`] or [`SchemaError::Invalid`] if `json` is not a valid schema.
    pub fn from_json(json: &[u8]) -> Result<Self, SchemaError> {
        let schema: Self = serde_json::from_slice(json)?;
        schema.validate()?;
        Ok(schema)
    }
}

/// Return the URI of the schema of `array`.
///
/// # Errors
/// Returns [`StorageError::InvalidUri`] if the schema URI cannot be formed.
pub fn schema_uri(array: &StorageUri) -> Result<StorageUri, StorageError> {
    Ok(array.join(ARRAY_SCHEMA_FILE)?)
}

/// Loads array schemas. Called once per array open.
pub trait SchemaProvider: Send + Sync + std::fmt::Debug {
    /// Load the schema of `array`.
    ///
    /// # Errors
    /// Returns a [`SchemaError`] if the schema does not exist or is invalid.
    fn load_schema(&self, array: &StorageUri) -> Result<ArraySchema, SchemaError>;
}

/// A [`SchemaProvider`] reading `<array>/__array_schema.json` through an [`IoScheduler`].
#[derive(Debug, Clone)]
pub struct StoredSchemaProvider {
    scheduler: IoScheduler,
}

impl StoredSchemaProvider {
    /// Create a new stored schema provider.
    #[must_use]
    pub fn new(scheduler: IoScheduler) -> Self {
        Self { scheduler }
    }

    /// Write `schema` to `array`, replacing any existing schema.
    ///
    /// # Errors
    /// Returns a [`SchemaError`] if the schema cannot be serialised or written.
    pub fn store_schema(&self, array: &StorageUri, schema: &ArraySchema) -> Result<(), SchemaError> {
        let uri = schema_uri(array)?;
        let json = schema.to_json()?;
        self.scheduler.delete(&uri)?;
        self.scheduler.write(&uri, &json)?;
        Ok(())
    }
}

impl SchemaProvider for StoredSchemaProvider {
    fn load_schema(&self, array: &StorageUri) -> Result<ArraySchema, SchemaError> {
        let json = self.scheduler.read_all(&schema_uri(array)?)?;
        ArraySchema::from_json(&json)
    }
}
