//! Catalogue persistence collaborator.
//!
//! The archive's relational catalogue is consumed through two traits: a
//! read-side [`PersistentStore`] and a transactional [`UpdateContext`] whose
//! staged writes become visible only on `commit`. Entities are JSON documents
//! addressed by `(table, key)`.

pub mod memory;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::error::CommandError;

pub use memory::InMemoryCatalogue;

/// Catalogue failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Insert of a key that already exists.
    #[error("{table}/{key} already exists")]
    Duplicate {
        /// Table name.
        table: String,
        /// Entity key.
        key: String,
    },
    /// Update or load of a key that does not exist.
    #[error("{table}/{key} not found")]
    Missing {
        /// Table name.
        table: String,
        /// Entity key.
        key: String,
    },
    /// Entity failed to (de)serialize.
    #[error("{table}/{key} malformed: {source}")]
    Malformed {
        /// Table name.
        table: String,
        /// Entity key.
        key: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// Context was already committed or rolled back.
    #[error("update context closed")]
    Closed,
}

impl From<PersistenceError> for CommandError {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// One transaction against the catalogue.
pub trait UpdateContext: Send {
    /// Read an entity, seeing this context's own staged writes.
    fn find(&self, table: &str, key: &str) -> Option<Value>;

    /// Stage an insert.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Duplicate`] when the key is taken.
    fn insert(&mut self, table: &str, key: &str, entity: Value) -> Result<(), PersistenceError>;

    /// Stage a full replacement of an existing entity.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Missing`] when the key does not exist.
    fn update(&mut self, table: &str, key: &str, entity: Value) -> Result<(), PersistenceError>;

    /// Stage a delete. Returns whether the entity existed.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Closed`] after commit/rollback.
    fn delete(&mut self, table: &str, key: &str) -> Result<bool, PersistenceError>;

    /// Apply every staged write atomically.
    ///
    /// # Errors
    ///
    /// Conflicts with writes committed since staging.
    fn commit(&mut self) -> Result<(), PersistenceError>;

    /// Drop every staged write.
    fn rollback(&mut self);
}

/// Read access to the catalogue plus a factory for update contexts.
pub trait PersistentStore: Send + Sync {
    /// Committed state of one entity.
    fn find(&self, table: &str, key: &str) -> Option<Value>;

    /// Every committed entity in `table` matching `predicate`.
    fn find_where(&self, table: &str, predicate: &dyn Fn(&Value) -> bool) -> Vec<(String, Value)>;

    /// Begin a transaction.
    fn open_update_context(&self) -> Box<dyn UpdateContext>;
}

/// Catalogue row describing where a study lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyStorage {
    /// Study storage key; the lockable resource identity.
    pub key: String,
    /// DICOM study instance UID.
    pub study_instance_uid: String,
    /// Study folder.
    pub study_path: PathBuf,
    /// Number of stored instances.
    #[serde(default)]
    pub instance_count: u64,
    /// Bytes on disk.
    #[serde(default)]
    pub size_bytes: u64,
    /// Storage tier (filesystem label).
    #[serde(default)]
    pub tier: String,
}

impl StudyStorage {
    /// Catalogue table name.
    pub const TABLE: &'static str = "study_storage";

    /// Load the committed row for `key`.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Missing`] or [`PersistenceError::Malformed`].
    pub fn load(store: &dyn PersistentStore, key: &str) -> Result<Self, PersistenceError> {
        let value = store.find(Self::TABLE, key).ok_or_else(|| PersistenceError::Missing {
            table: Self::TABLE.into(),
            key: key.into(),
        })?;
        Self::from_value(key, value)
    }

    /// Decode a row.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Malformed`] when the document does not match.
    pub fn from_value(key: &str, value: Value) -> Result<Self, PersistenceError> {
        serde_json::from_value(value).map_err(|source| PersistenceError::Malformed {
            table: Self::TABLE.into(),
            key: key.into(),
            source,
        })
    }

    /// Encode as a catalogue document.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
