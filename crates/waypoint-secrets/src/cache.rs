//! Lazily built, invalidation-aware cache of the provider client.
//!
//! The cache holds at most one client. It is either [`CacheState::Absent`]
//! or [`CacheState::Present`]; configuration writes move it back to
//! `Absent` and the next [`ClientCache::get_client`] call rebuilds it.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::load_config;
use crate::error::{Error, ProviderStep, Result};
use crate::provider::ClientFactory;
use crate::storage::Storage;

/// Observable state of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No client has been built since the last invalidation.
    Absent,
    /// A client is cached and will be handed out.
    Present,
}

/// Owns the single authenticated client to the identity provider.
pub struct ClientCache<F: ClientFactory> {
    factory: F,
    client: RwLock<Option<Arc<F::Client>>>,
}

impl<F: ClientFactory> ClientCache<F> {
    /// Creates an empty cache that builds clients with `factory`.
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            client: RwLock::new(None),
        }
    }

    /// Returns the factory used to build clients.
    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns the cached client, building it from the stored configuration
    /// on first use.
    ///
    /// Concurrent callers that find the cache empty serialize on the write
    /// lock; only the first of them builds a client, the rest reuse it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] if no usable configuration is stored,
    /// [`Error::Provider`] if the client cannot be constructed, or a storage
    /// error if the configuration cannot be read.
    pub async fn get_client<S: Storage>(&self, storage: &S) -> Result<Arc<F::Client>> {
        {
            let cached = self.client.read().await;
            if let Some(client) = cached.as_ref() {
                return Ok(Arc::clone(client));
            }
        }

        let mut slot = self.client.write().await;

        // Another caller may have built the client while we waited.
        if let Some(client) = slot.as_ref() {
            debug!("reusing provider client built by concurrent caller");
            return Ok(Arc::clone(client));
        }

        let config = load_config(storage).await?.unwrap_or_default();
        config.validate()?;

        let client = self
            .factory
            .connect(&config)
            .map_err(|e| Error::provider(ProviderStep::Connect, e))?;
        let client = Arc::new(client);
        *slot = Some(Arc::clone(&client));

        debug!(address = %config.address, "built provider client");
        Ok(client)
    }

    /// Drops the cached client.
    pub async fn invalidate(&self) {
        let mut slot = self.client.write().await;
        if slot.take().is_some() {
            debug!("provider client invalidated");
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> CacheState {
        if self.client.read().await.is_some() {
            CacheState::Present
        } else {
            CacheState::Absent
        }
    }
}

impl<F: ClientFactory> std::fmt::Debug for ClientCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.client.try_read() {
            Ok(slot) if slot.is_some() => "present",
            Ok(_) => "absent",
            Err(_) => "locked",
        };
        f.debug_struct("ClientCache").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, CONFIG_STORAGE_KEY};
    use crate::memory::{InMemoryClientFactory, InMemoryProvider};
    use crate::provider::ProviderFailure;
    use crate::storage::{InMemoryStorage, StorageEntry};

    async fn configured_storage(config: &ProviderConfig) -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        storage
            .put(StorageEntry::json(CONFIG_STORAGE_KEY, config).expect("encode"))
            .await
            .expect("put");
        storage
    }

    fn test_cache() -> ClientCache<InMemoryClientFactory> {
        ClientCache::new(InMemoryClientFactory::new(InMemoryProvider::new("root")))
    }

    #[tokio::test]
    async fn cache_starts_absent() {
        let cache = test_cache();
        assert_eq!(cache.state().await, CacheState::Absent);
        assert_eq!(cache.factory().connections(), 0);
    }

    #[tokio::test]
    async fn cache_returns_same_client() {
        let storage = configured_storage(&ProviderConfig::new("root", "http://x")).await;
        let cache = test_cache();

        let first = cache.get_client(&storage).await.expect("first");
        let second = cache.get_client(&storage).await.expect("second");
        let third = cache.get_client(&storage).await.expect("third");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(cache.factory().connections(), 1);
        assert_eq!(cache.state().await, CacheState::Present);
    }

    #[tokio::test]
    async fn cache_rebuilds_after_invalidate() {
        let storage = configured_storage(&ProviderConfig::new("root", "http://x")).await;
        let cache = test_cache();

        let first = cache.get_client(&storage).await.expect("first");
        cache.invalidate().await;
        assert_eq!(cache.state().await, CacheState::Absent);

        let second = cache.get_client(&storage).await.expect("second");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.factory().connections(), 2);
    }

    #[tokio::test]
    async fn cache_without_config_reports_missing() {
        let storage = InMemoryStorage::new();
        let cache = test_cache();

        let err = cache.get_client(&storage).await.expect_err("no config");
        assert!(matches!(err, Error::ConfigMissing { .. }));
        assert_eq!(cache.state().await, CacheState::Absent);
        assert_eq!(cache.factory().connections(), 0);
    }

    #[tokio::test]
    async fn cache_with_empty_address_reports_missing() {
        let storage = configured_storage(&ProviderConfig::new("root", "")).await;
        let cache = test_cache();

        let err = cache.get_client(&storage).await.expect_err("no address");
        assert!(matches!(err, Error::ConfigMissing { reason } if reason.contains("address")));
    }

    #[tokio::test]
    async fn cache_connect_failure_is_provider_error() {
        let storage = configured_storage(&ProviderConfig::new("root", "http://x")).await;
        let cache = test_cache();
        cache.factory().fail_connect(ProviderFailure::Unavailable {
            reason: "connection refused".to_string(),
        });

        let err = cache.get_client(&storage).await.expect_err("connect fails");
        assert!(matches!(
            err,
            Error::Provider {
                step: ProviderStep::Connect,
                ..
            }
        ));
        assert_eq!(cache.state().await, CacheState::Absent);

        // The failure is one-shot; the next call builds a client.
        cache.get_client(&storage).await.expect("retry succeeds");
        assert_eq!(cache.state().await, CacheState::Present);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cache_concurrent_first_use_builds_once() {
        let storage =
            Arc::new(configured_storage(&ProviderConfig::new("root", "http://x")).await);
        let cache = Arc::new(test_cache());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let storage = Arc::clone(&storage);
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_client(storage.as_ref()).await.expect("client")
            }));
        }

        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.expect("task"));
        }

        assert_eq!(cache.factory().connections(), 1);
        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn cache_debug_shows_state() {
        let cache = test_cache();
        assert!(format!("{cache:?}").contains("absent"));
    }
}
