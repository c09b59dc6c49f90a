//! Key-value storage capability used by the config and role stores.
//!
//! The host owns the real storage engine; this module only defines the
//! per-key surface the engine calls, a JSON entry format, and an in-memory
//! implementation.

use std::collections::BTreeMap;
use std::future::Future;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not serve the request.
    #[error("storage unavailable: {reason}")]
    Unavailable {
        /// The reason the backend failed.
        reason: String,
    },

    /// An entry could not be encoded or decoded.
    #[error("storage entry '{key}' could not be encoded: {reason}")]
    Encoding {
        /// Key of the offending entry.
        key: String,
        /// The underlying serialization failure.
        reason: String,
    },
}

/// A raw storage entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    /// Storage key.
    pub key: String,
    /// Encoded value.
    pub value: Vec<u8>,
}

impl StorageEntry {
    /// Encodes `value` as JSON under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn json<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self, StorageError> {
        let key = key.into();
        let value = serde_json::to_vec(value).map_err(|e| StorageError::Encoding {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { key, value })
    }

    /// Decodes the JSON value of this entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not valid JSON for `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_slice(&self.value).map_err(|e| StorageError::Encoding {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }
}

/// Per-key storage provided by the host.
///
/// Operations are atomic per key; there are no cross-key transactions.
pub trait Storage: Send + Sync {
    /// Reads an entry, returning `None` if the key does not exist.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<StorageEntry>, StorageError>> + Send;

    /// Writes an entry, replacing any previous value.
    fn put(&self, entry: StorageEntry) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Deletes a key. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Lists the keys directly under `prefix`, with the prefix stripped.
    fn list(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;
}

/// In-memory storage for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    unavailable: RwLock<Option<String>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StorageError::Unavailable`]
    /// until [`InMemoryStorage::restore`] is called.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.unavailable.write() = Some(reason.into());
    }

    /// Clears a failure set with [`InMemoryStorage::fail_with`].
    pub fn restore(&self) {
        *self.unavailable.write() = None;
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StorageError> {
        match self.unavailable.read().as_ref() {
            Some(reason) => Err(StorageError::Unavailable {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<StorageEntry>, StorageError> {
        self.check()?;
        Ok(self.entries.read().get(key).map(|value| StorageEntry {
            key: key.to_string(),
            value: value.clone(),
        }))
    }

    async fn put(&self, entry: StorageEntry) -> Result<(), StorageError> {
        self.check()?;
        self.entries.write().insert(entry.key, entry.value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.check()?;
        let entries = self.entries.read();
        let mut keys: Vec<String> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(prefix))
            .map(|rest| match rest.find('/') {
                // Nested keys are reported as a "folder" once.
                Some(idx) => rest[..=idx].to_string(),
                None => rest.to_string(),
            })
            .collect();
        keys.dedup();
        Ok(keys)
    }
}
