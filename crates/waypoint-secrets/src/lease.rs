//! Leases over issued credentials: construction, renewal and revocation.
//!
//! A lease carries two maps. `data` is returned to the requester;
//! `internal_data` is kept by the host and handed back on renew and revoke.
//! It is the only record of which provider user backs the lease and which
//! role governs its TTLs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::cache::ClientCache;
use crate::error::{Error, ProviderStep, Result};
use crate::issuer::Credential;
use crate::provider::{ClientFactory, IdentityClient};
use crate::role::{Role, RoleStore};
use crate::settings::BackendSettings;
use crate::storage::Storage;

/// Secret type of user credential leases.
pub const SECRET_TYPE_USER: &str = "user";

/// Internal data key holding the provider user id.
pub const INTERNAL_USER_ID: &str = "user_id";

/// Internal data key holding the originating role name.
pub const INTERNAL_ROLE: &str = "role";

/// A time-bounded grant of a credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Kind of secret, [`SECRET_TYPE_USER`] for user credentials.
    pub secret_type: String,
    /// Data returned to the requester.
    pub data: Map<String, Value>,
    /// Data only visible to renew and revoke.
    pub internal_data: Map<String, Value>,
    /// Soft expiry, renewable.
    #[serde(with = "crate::role::duration_secs")]
    pub ttl: Duration,
    /// Hard cap.
    #[serde(with = "crate::role::duration_secs")]
    pub max_ttl: Duration,
}

impl Lease {
    /// Reads a string from the internal data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the key is missing or not a string.
    pub fn internal_str(&self, key: &str) -> Result<&str> {
        match self.internal_data.get(key) {
            Some(Value::String(value)) => Ok(value),
            Some(_) => Err(Error::InvalidRequest {
                reason: format!("invalid value for {key} in secret internal data"),
            }),
            None => Err(Error::InvalidRequest {
                reason: format!("secret is missing {key} internal data"),
            }),
        }
    }

    /// Applies a TTL policy. Zero values leave the current TTLs in place.
    pub fn apply_ttl(&mut self, policy: LeaseTtl) {
        if !policy.ttl.is_zero() {
            self.ttl = policy.ttl;
        }
        if !policy.max_ttl.is_zero() {
            self.max_ttl = policy.max_ttl;
        }
    }
}

/// TTLs taken from a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTtl {
    /// Lease TTL, zero if unset.
    pub ttl: Duration,
    /// Lease max TTL, zero if unset.
    pub max_ttl: Duration,
}

impl From<&Role> for LeaseTtl {
    fn from(role: &Role) -> Self {
        Self {
            ttl: role.ttl,
            max_ttl: role.max_ttl,
        }
    }
}

/// Builds, renews and revokes leases.
pub struct LeaseManager<S, F: ClientFactory> {
    storage: Arc<S>,
    cache: Arc<ClientCache<F>>,
    roles: RoleStore<S>,
    default_ttl: Duration,
    max_ttl: Duration,
}

impl<S: Storage, F: ClientFactory> LeaseManager<S, F> {
    /// Creates a lease manager. Host default TTLs come from `settings`.
    #[must_use]
    pub fn new(storage: Arc<S>, cache: Arc<ClientCache<F>>, settings: &BackendSettings) -> Self {
        Self {
            roles: RoleStore::new(Arc::clone(&storage)),
            storage,
            cache,
            default_ttl: settings.default_lease_ttl(),
            max_ttl: settings.max_lease_ttl(),
        }
    }

    /// Wraps a credential in a lease governed by `role`.
    #[must_use]
    pub fn issue_lease(&self, credential: &Credential, role: &Role) -> Lease {
        let mut data = Map::new();
        data.insert(
            INTERNAL_USER_ID.to_string(),
            Value::String(credential.user_id.clone()),
        );
        data.insert(
            "token".to_string(),
            Value::String(credential.token.as_str().to_string()),
        );

        let mut internal_data = Map::new();
        internal_data.insert(
            INTERNAL_USER_ID.to_string(),
            Value::String(credential.user_id.clone()),
        );
        internal_data.insert(
            INTERNAL_ROLE.to_string(),
            Value::String(credential.role_name.clone()),
        );

        let mut lease = Lease {
            secret_type: SECRET_TYPE_USER.to_string(),
            data,
            internal_data,
            ttl: self.default_ttl,
            max_ttl: self.max_ttl,
        };
        lease.apply_ttl(LeaseTtl::from(role));
        lease
    }

    /// Returns the current TTL policy of `role_name`.
    ///
    /// The role is read fresh on every call, so edits apply to existing
    /// leases at their next renewal. The provider is not contacted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoleNotFound`] if the role was deleted.
    pub async fn renew_ttl(&self, role_name: &str) -> Result<LeaseTtl> {
        let role = self.roles.require(role_name).await?;
        Ok(LeaseTtl::from(&role))
    }

    /// Renews a lease with the current TTLs of its role.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease has no role internal data or the role
    /// no longer exists.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let role_name = lease.internal_str(INTERNAL_ROLE)?;
        let policy = self.renew_ttl(role_name).await?;

        let mut renewed = lease.clone();
        renewed.apply_ttl(policy);

        info!(
            role = %role_name,
            ttl_secs = renewed.ttl.as_secs(),
            max_ttl_secs = renewed.max_ttl.as_secs(),
            "lease renewed"
        );
        Ok(renewed)
    }

    /// Deletes the provider user backing a lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] if the delete fails, including when the
    /// user is already gone. There is no retry.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn revoke_user(&self, user_id: &str) -> Result<()> {
        let client = self.cache.get_client(self.storage.as_ref()).await?;

        client
            .delete_user(user_id)
            .await
            .map_err(|e| Error::provider(ProviderStep::DeleteUser, e))?;

        info!("revoked user");
        Ok(())
    }

    /// Revokes a lease using the user id in its internal data.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal data has no user id or the delete
    /// fails.
    pub async fn revoke(&self, lease: &Lease) -> Result<()> {
        let user_id = lease.internal_str(INTERNAL_USER_ID)?;
        if user_id.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "secret internal data has an empty user_id".to_string(),
            });
        }
        self.revoke_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, ConfigUpdate, WriteMode};
    use crate::memory::{InMemoryClientFactory, InMemoryProvider};
    use crate::provider::{AccessToken, ProviderFailure};
    use crate::role::RoleUpdate;
    use crate::storage::InMemoryStorage;

    struct Fixture {
        manager: LeaseManager<InMemoryStorage, InMemoryClientFactory>,
        roles: RoleStore<InMemoryStorage>,
        provider: InMemoryProvider,
        settings: BackendSettings,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let provider = InMemoryProvider::new("root");
        let cache = Arc::new(ClientCache::new(InMemoryClientFactory::new(
            provider.clone(),
        )));
        ConfigStore::new(Arc::clone(&storage), Arc::clone(&cache))
            .put(
                ConfigUpdate {
                    token: Some("root".to_string()),
                    address: Some("http://waypoint".to_string()),
                },
                WriteMode::Create,
            )
            .await
            .expect("config");

        let settings = BackendSettings::default();
        Fixture {
            manager: LeaseManager::new(Arc::clone(&storage), cache, &settings),
            roles: RoleStore::new(storage),
            provider,
            settings,
        }
    }

    fn credential(user_id: &str, role: &str) -> Credential {
        Credential {
            user_id: user_id.to_string(),
            username: format!("vault-role-{role}-abcdefgh"),
            token: AccessToken::new("tok"),
            role_name: role.to_string(),
        }
    }

    async fn create_role(roles: &RoleStore<InMemoryStorage>, name: &str, ttl: u64, max_ttl: u64) {
        roles
            .put(
                name,
                RoleUpdate {
                    ttl: Some(Duration::from_secs(ttl)),
                    max_ttl: Some(Duration::from_secs(max_ttl)),
                },
                WriteMode::Create,
            )
            .await
            .expect("role");
    }

    #[tokio::test]
    async fn issue_lease_uses_role_ttls() {
        let fx = fixture().await;
        let role = Role::new("ci")
            .with_ttl(Duration::from_secs(600))
            .with_max_ttl(Duration::from_secs(3600));

        let lease = fx.manager.issue_lease(&credential("u-1", "ci"), &role);

        assert_eq!(lease.secret_type, SECRET_TYPE_USER);
        assert_eq!(lease.ttl, Duration::from_secs(600));
        assert_eq!(lease.max_ttl, Duration::from_secs(3600));
        assert_eq!(lease.data["user_id"], "u-1");
        assert_eq!(lease.data["token"], "tok");
        assert!(!lease.data.contains_key(INTERNAL_ROLE));
        assert_eq!(lease.internal_str(INTERNAL_USER_ID).expect("user"), "u-1");
        assert_eq!(lease.internal_str(INTERNAL_ROLE).expect("role"), "ci");
    }

    #[tokio::test]
    async fn issue_lease_unset_ttls_keep_host_defaults() {
        let fx = fixture().await;
        let lease = fx
            .manager
            .issue_lease(&credential("u-1", "ci"), &Role::new("ci"));

        assert_eq!(lease.ttl, fx.settings.default_lease_ttl());
        assert_eq!(lease.max_ttl, fx.settings.max_lease_ttl());
    }

    #[tokio::test]
    async fn renew_reflects_role_edits() {
        let fx = fixture().await;
        create_role(&fx.roles, "ci", 60, 0).await;
        let role = fx.roles.require("ci").await.expect("role");
        let lease = fx.manager.issue_lease(&credential("u-1", "ci"), &role);
        assert_eq!(lease.ttl, Duration::from_secs(60));

        fx.roles
            .put(
                "ci",
                RoleUpdate {
                    ttl: Some(Duration::from_secs(120)),
                    max_ttl: None,
                },
                WriteMode::Update,
            )
            .await
            .expect("edit");

        let renewed = fx.manager.renew(&lease).await.expect("renew");
        assert_eq!(renewed.ttl, Duration::from_secs(120));
        assert_eq!(renewed.internal_data, lease.internal_data);
    }

    #[tokio::test]
    async fn renew_ttl_does_not_contact_provider() {
        let fx = fixture().await;
        create_role(&fx.roles, "ci", 300, 900).await;
        fx.provider.fail_next(
            ProviderStep::GetUser,
            ProviderFailure::Unavailable {
                reason: "down".to_string(),
            },
        );

        let policy = fx.manager.renew_ttl("ci").await.expect("renew");
        assert_eq!(policy.ttl, Duration::from_secs(300));
        assert_eq!(policy.max_ttl, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn renew_after_role_deleted_fails() {
        let fx = fixture().await;
        create_role(&fx.roles, "ci", 60, 0).await;
        let role = fx.roles.require("ci").await.expect("role");
        let lease = fx.manager.issue_lease(&credential("u-1", "ci"), &role);

        fx.roles.delete("ci").await.expect("delete");

        let err = fx.manager.renew(&lease).await.expect_err("role gone");
        assert!(matches!(err, Error::RoleNotFound { .. }));
    }

    #[tokio::test]
    async fn renew_without_role_internal_data_fails() {
        let fx = fixture().await;
        let mut lease = fx
            .manager
            .issue_lease(&credential("u-1", "ci"), &Role::new("ci"));
        lease.internal_data.remove(INTERNAL_ROLE);

        let err = fx.manager.renew(&lease).await.expect_err("no role");
        assert!(matches!(err, Error::InvalidRequest { reason } if reason.contains("role")));
    }

    #[tokio::test]
    async fn revoke_deletes_user() {
        let fx = fixture().await;
        let client = fx
            .provider
            .client("http://waypoint", AccessToken::new("root"));
        let cred = crate::issuer::CredentialIssuer::default()
            .issue(&client, &Role::new("ci"))
            .await
            .expect("issue");
        let lease = fx.manager.issue_lease(&cred, &Role::new("ci"));

        fx.manager.revoke(&lease).await.expect("revoke");
        assert!(fx.provider.find_user(&cred.username).is_none());

        let err = fx.manager.revoke(&lease).await.expect_err("already gone");
        assert!(matches!(
            err,
            Error::Provider {
                step: ProviderStep::DeleteUser,
                source: ProviderFailure::NotFound { .. },
            }
        ));
    }

    #[tokio::test]
    async fn revoke_rejects_bad_internal_data() {
        let fx = fixture().await;
        let mut lease = fx
            .manager
            .issue_lease(&credential("u-1", "ci"), &Role::new("ci"));

        lease
            .internal_data
            .insert(INTERNAL_USER_ID.to_string(), Value::from(42));
        let err = fx.manager.revoke(&lease).await.expect_err("not a string");
        assert!(matches!(err, Error::InvalidRequest { reason } if reason.contains("invalid value")));

        lease.internal_data.remove(INTERNAL_USER_ID);
        let err = fx.manager.revoke(&lease).await.expect_err("missing");
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[test]
    fn lease_round_trips_through_json() {
        let mut lease = Lease {
            secret_type: SECRET_TYPE_USER.to_string(),
            data: Map::new(),
            internal_data: Map::new(),
            ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(120),
        };
        lease
            .internal_data
            .insert(INTERNAL_ROLE.to_string(), Value::from("ci"));

        let json = serde_json::to_value(&lease).expect("serialize");
        assert_eq!(json["ttl"], 60);
        let back: Lease = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, lease);
    }
}
