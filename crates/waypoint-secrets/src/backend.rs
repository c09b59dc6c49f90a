//! The mounted secrets backend.
//!
//! [`Backend`] is the service object the host calls into. It routes path
//! requests to the config store, role store and credential issuer, and
//! handles the lease renew/revoke callbacks. All shared state lives on the
//! backend; there are no globals.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::ClientCache;
use crate::config::{ConfigStore, ConfigUpdate, WriteMode, CONFIG_STORAGE_KEY};
use crate::error::{Error, Result};
use crate::issuer::CredentialIssuer;
use crate::lease::{Lease, LeaseManager, SECRET_TYPE_USER};
use crate::provider::ClientFactory;
use crate::request::{Operation, Request, Response};
use crate::role::{RoleStore, RoleUpdate};
use crate::settings::BackendSettings;
use crate::storage::Storage;

/// Backend help text.
pub const BACKEND_HELP: &str = "\
The Waypoint secrets backend dynamically generates user tokens.
After mounting this backend, credentials to manage Waypoint user tokens
must be configured with the \"config\" endpoint.";

const CONFIG_HELP: &str = "\
Configure the Waypoint backend. The backend needs an operator token and the
Waypoint server address before it can manage users and tokens. The token is
write-only and never returned by reads.";

const ROLE_HELP: &str = "\
Manage roles. A role sets the TTL and max TTL of credentials issued under it;
unset values fall back to the mount defaults.";

const CREDS_HELP: &str = "\
Generate a Waypoint user and token from a role. Every read creates a new user
that is deleted when its lease is revoked.";

static ROLE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^role/(?P<name>[A-Za-z0-9_]([A-Za-z0-9_\-.@]*[A-Za-z0-9_])?)$")
        .unwrap_or_else(|_| unreachable!())
});

static CREDS_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^creds/(?P<name>[A-Za-z0-9_]([A-Za-z0-9_\-.@]*[A-Za-z0-9_])?)$")
        .unwrap_or_else(|_| unreachable!())
});

/// A parsed request path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Config,
    RoleList,
    Role(String),
    Creds(String),
}

impl Route {
    fn parse(path: &str) -> Option<Self> {
        if path == CONFIG_STORAGE_KEY {
            return Some(Self::Config);
        }
        if path == "role" || path == "role/" {
            return Some(Self::RoleList);
        }
        if let Some(caps) = ROLE_PATH.captures(path) {
            return Some(Self::Role(caps["name"].to_lowercase()));
        }
        if let Some(caps) = CREDS_PATH.captures(path) {
            return Some(Self::Creds(caps["name"].to_lowercase()));
        }
        None
    }
}

/// A mounted Waypoint secrets backend.
pub struct Backend<S, F: ClientFactory> {
    storage: Arc<S>,
    cache: Arc<ClientCache<F>>,
    config: ConfigStore<S, F>,
    roles: RoleStore<S>,
    issuer: CredentialIssuer,
    leases: LeaseManager<S, F>,
}

impl<S: Storage, F: ClientFactory> Backend<S, F> {
    /// Creates a backend over the host's storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] if `settings` fail validation.
    pub fn new(settings: &BackendSettings, storage: Arc<S>, factory: F) -> Result<Self> {
        settings.validate()?;

        let cache = Arc::new(ClientCache::new(factory));
        Ok(Self {
            config: ConfigStore::new(Arc::clone(&storage), Arc::clone(&cache)),
            roles: RoleStore::new(Arc::clone(&storage)),
            issuer: CredentialIssuer::from_settings(settings),
            leases: LeaseManager::new(Arc::clone(&storage), Arc::clone(&cache), settings),
            storage,
            cache,
        })
    }

    /// Returns the client cache.
    #[must_use]
    pub fn cache(&self) -> &ClientCache<F> {
        &self.cache
    }

    /// Returns the config store.
    #[must_use]
    pub const fn config_store(&self) -> &ConfigStore<S, F> {
        &self.config
    }

    /// Returns the role store.
    #[must_use]
    pub const fn roles(&self) -> &RoleStore<S> {
        &self.roles
    }

    /// Returns the lease manager.
    #[must_use]
    pub const fn leases(&self) -> &LeaseManager<S, F> {
        &self.leases
    }

    /// Returns the backend help text.
    #[must_use]
    pub const fn help(&self) -> &'static str {
        BACKEND_HELP
    }

    /// Returns the help text of a path, if the path exists.
    #[must_use]
    pub fn path_help(&self, path: &str) -> Option<&'static str> {
        match Route::parse(path)? {
            Route::Config => Some(CONFIG_HELP),
            Route::RoleList | Route::Role(_) => Some(ROLE_HELP),
            Route::Creds(_) => Some(CREDS_HELP),
        }
    }

    /// Handles a request from the host.
    ///
    /// Returns `Ok(None)` for successful writes and for reads of entries that
    /// do not exist.
    ///
    /// # Errors
    ///
    /// Returns the handler's error; nothing is swallowed.
    pub async fn handle_request(&self, req: &Request) -> Result<Option<Response>> {
        debug!(operation = %req.operation, path = %req.path, "handling request");

        match req.operation {
            Operation::Renew => {
                return self
                    .renew(req.require_secret()?)
                    .await
                    .map(|lease| Some(Response::for_lease(lease)));
            }
            Operation::Revoke => {
                self.revoke(req.require_secret()?).await?;
                return Ok(None);
            }
            _ => {}
        }

        let route = Route::parse(&req.path).ok_or_else(|| Error::UnsupportedPath {
            path: req.path.clone(),
        })?;

        match (route, req.operation) {
            (Route::Config, Operation::Read) => self.read_config().await,
            (Route::Config, Operation::Create | Operation::Update) => {
                self.write_config(req).await
            }
            (Route::Config, Operation::Delete) => {
                self.config.delete().await?;
                Ok(None)
            }
            (Route::RoleList, Operation::List | Operation::Read) => self.list_roles().await,
            (Route::Role(name), Operation::Read) => self.read_role(&name).await,
            (Route::Role(name), Operation::Create | Operation::Update) => {
                self.write_role(&name, req).await
            }
            (Route::Role(name), Operation::Delete) => {
                self.roles.delete(&name).await?;
                Ok(None)
            }
            (Route::Creds(name), Operation::Read | Operation::Update) => {
                let lease = self.issue_credentials(&name).await?;
                Ok(Some(Response::for_lease(lease)))
            }
            (_, operation) => Err(Error::UnsupportedOperation {
                operation: operation.to_string(),
                path: req.path.clone(),
            }),
        }
    }

    /// Host hook for storage keys changed outside this backend instance.
    pub async fn invalidate(&self, key: &str) {
        if key == CONFIG_STORAGE_KEY {
            self.cache.invalidate().await;
        }
    }

    /// Issues a credential for `role_name` and wraps it in a lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoleNotFound`] if the role does not exist,
    /// [`Error::ConfigMissing`] if the backend is not configured, or
    /// [`Error::Provider`] if any provider step fails.
    pub async fn issue_credentials(&self, role_name: &str) -> Result<Lease> {
        let role = self.roles.require(role_name).await?;
        let client = self.cache.get_client(self.storage.as_ref()).await?;
        let credential = self.issuer.issue(client.as_ref(), &role).await?;
        Ok(self.leases.issue_lease(&credential, &role))
    }

    /// Lease renewal callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is not a user lease or its role is gone.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        check_secret_type(lease)?;
        self.leases.renew(lease).await
    }

    /// Lease revocation callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is not a user lease or the provider
    /// delete fails.
    pub async fn revoke(&self, lease: &Lease) -> Result<()> {
        check_secret_type(lease)?;
        self.leases.revoke(lease).await
    }

    async fn read_config(&self) -> Result<Option<Response>> {
        let Some(config) = self.config.get().await? else {
            return Ok(None);
        };
        let mut data = Map::new();
        data.insert("addr".to_string(), Value::String(config.address.clone()));
        data.insert("address".to_string(), Value::String(config.address));
        Ok(Some(Response::with_data(data)))
    }

    async fn write_config(&self, req: &Request) -> Result<Option<Response>> {
        let mode = if self.config.exists().await? {
            WriteMode::Update
        } else {
            WriteMode::Create
        };

        let address = match req.string_field("address")? {
            Some(address) => Some(address),
            None => req.string_field("addr")?,
        };
        let update = ConfigUpdate {
            token: req.string_field("token")?,
            address,
        };

        self.config.put(update, mode).await?;
        Ok(None)
    }

    async fn list_roles(&self) -> Result<Option<Response>> {
        let keys = self.roles.list().await?;
        let mut data = Map::new();
        data.insert(
            "keys".to_string(),
            Value::Array(keys.into_iter().map(Value::String).collect()),
        );
        Ok(Some(Response::with_data(data)))
    }

    async fn read_role(&self, name: &str) -> Result<Option<Response>> {
        let Some(role) = self.roles.get(name).await? else {
            return Ok(None);
        };
        let mut data = Map::new();
        data.insert("ttl".to_string(), Value::from(role.ttl.as_secs()));
        data.insert("max_ttl".to_string(), Value::from(role.max_ttl.as_secs()));
        Ok(Some(Response::with_data(data)))
    }

    async fn write_role(&self, name: &str, req: &Request) -> Result<Option<Response>> {
        let mode = if self.roles.get(name).await?.is_some() {
            WriteMode::Update
        } else {
            WriteMode::Create
        };

        let update = RoleUpdate {
            ttl: req.duration_field("ttl")?,
            max_ttl: req.duration_field("max_ttl")?,
        };

        self.roles.put(name, update, mode).await?;
        Ok(None)
    }
}

fn check_secret_type(lease: &Lease) -> Result<()> {
    if lease.secret_type != SECRET_TYPE_USER {
        return Err(Error::InvalidRequest {
            reason: format!("unsupported secret type '{}'", lease.secret_type),
        });
    }
    Ok(())
}

impl<S, F: ClientFactory> std::fmt::Debug for Backend<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("cache", &self.cache)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}
