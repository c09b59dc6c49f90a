//! Provider connection settings and their store.
//!
//! The stored [`ProviderConfig`] is the only input to client construction, so
//! every successful write or delete clears the [`ClientCache`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::ClientCache;
use crate::error::{Error, Result};
use crate::provider::{AccessToken, ClientFactory};
use crate::storage::{Storage, StorageEntry};

/// Storage key of the provider configuration.
pub const CONFIG_STORAGE_KEY: &str = "config";

/// Connection settings for the Waypoint server.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Operator token used to manage users.
    pub token: String,
    /// Address of the Waypoint server.
    #[serde(alias = "addr")]
    pub address: String,
}

impl ProviderConfig {
    /// Creates a configuration from a token and an address.
    #[must_use]
    pub fn new(token: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            address: address.into(),
        }
    }

    /// Returns the operator token as an [`AccessToken`].
    #[must_use]
    pub fn access_token(&self) -> AccessToken {
        AccessToken::new(self.token.clone())
    }

    /// Checks that both fields are set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] if the token or address is empty.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::ConfigMissing {
                reason: "token was not defined".to_string(),
            });
        }
        if self.address.is_empty() {
            return Err(Error::ConfigMissing {
                reason: "waypoint server address was not defined".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("token", &"[REDACTED]")
            .field("address", &self.address)
            .finish()
    }
}

/// A partial configuration write. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// New operator token.
    pub token: Option<String>,
    /// New server address.
    pub address: Option<String>,
}

/// Whether a write creates a new entry or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The entry does not exist yet; all required fields must be present.
    Create,
    /// The entry exists; missing fields keep their stored value.
    Update,
}

/// Reads the stored provider configuration.
///
/// # Errors
///
/// Returns an error if storage fails or the entry cannot be decoded.
pub async fn load_config<S: Storage>(storage: &S) -> Result<Option<ProviderConfig>> {
    let Some(entry) = storage.get(CONFIG_STORAGE_KEY).await? else {
        return Ok(None);
    };
    Ok(Some(entry.decode_json()?))
}

/// Persists provider configuration and keeps the client cache coherent.
pub struct ConfigStore<S, F: ClientFactory> {
    storage: Arc<S>,
    cache: Arc<ClientCache<F>>,
}

impl<S: Storage, F: ClientFactory> ConfigStore<S, F> {
    /// Creates a config store writing to `storage` and invalidating `cache`.
    #[must_use]
    pub const fn new(storage: Arc<S>, cache: Arc<ClientCache<F>>) -> Self {
        Self { storage, cache }
    }

    /// Returns the stored configuration, or `None` if none was written yet.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn get(&self) -> Result<Option<ProviderConfig>> {
        load_config(self.storage.as_ref()).await
    }

    /// Returns true if a configuration entry exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.storage.get(CONFIG_STORAGE_KEY).await?.is_some())
    }

    /// Writes the configuration.
    ///
    /// In [`WriteMode::Create`] both fields are required. In
    /// [`WriteMode::Update`] the update is merged into the stored entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing, the entry to update
    /// does not exist, or storage fails. The cache is left untouched on error.
    pub async fn put(&self, update: ConfigUpdate, mode: WriteMode) -> Result<ProviderConfig> {
        let existing = self.get().await?;

        let mut config = match (existing, mode) {
            (Some(config), _) => config,
            (None, WriteMode::Create) => ProviderConfig::default(),
            (None, WriteMode::Update) => {
                return Err(Error::ConfigMissing {
                    reason: "config not found during update operation".to_string(),
                });
            }
        };

        match update.token {
            Some(token) => config.token = token,
            None if mode == WriteMode::Create => {
                return Err(Error::InvalidRequest {
                    reason: "missing token in configuration".to_string(),
                });
            }
            None => {}
        }

        match update.address {
            Some(address) => config.address = address,
            None if mode == WriteMode::Create => {
                return Err(Error::InvalidRequest {
                    reason: "missing address in configuration".to_string(),
                });
            }
            None => {}
        }

        let entry = StorageEntry::json(CONFIG_STORAGE_KEY, &config)?;
        self.storage.put(entry).await?;
        self.cache.invalidate().await;

        info!(address = %config.address, ?mode, "provider configuration written");
        Ok(config)
    }

    /// Deletes the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails. The cache is left untouched on error.
    pub async fn delete(&self) -> Result<()> {
        self.storage.delete(CONFIG_STORAGE_KEY).await?;
        self.cache.invalidate().await;

        info!("provider configuration deleted");
        Ok(())
    }
}
