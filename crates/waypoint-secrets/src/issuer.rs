//! Credential issuance.
//!
//! A credential is a fresh Waypoint user created for one lease. Issuance
//! drives the provider through invite, accept and lookup; any failing step
//! aborts the whole issuance.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, ProviderStep, Result};
use crate::provider::{AccessToken, IdentityClient};
use crate::role::Role;
use crate::settings::BackendSettings;

/// Length of the random username suffix.
pub const USERNAME_SUFFIX_LENGTH: usize = 8;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A freshly issued credential.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    /// Provider identifier of the ephemeral user.
    pub user_id: String,
    /// Login name of the ephemeral user.
    pub username: String,
    /// Authentication token of the ephemeral user.
    pub token: AccessToken,
    /// Role the credential was issued under.
    pub role_name: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .field("role_name", &self.role_name)
            .finish()
    }
}

/// Mints ephemeral users for roles.
#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    username_prefix: String,
    invitation_validity: Duration,
}

impl CredentialIssuer {
    /// Creates an issuer with an explicit prefix and invitation window.
    #[must_use]
    pub fn new(username_prefix: impl Into<String>, invitation_validity: Duration) -> Self {
        Self {
            username_prefix: username_prefix.into(),
            invitation_validity,
        }
    }

    /// Creates an issuer from backend settings.
    #[must_use]
    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self::new(
            settings.username_prefix.clone(),
            settings.invitation_validity(),
        )
    }

    /// Returns a new username `<prefix>-<role>-<suffix>`.
    ///
    /// The suffix is random, so two calls almost never collide; a collision
    /// is reported by the provider when the user is invited.
    #[must_use]
    pub fn username_for(&self, role_name: &str) -> String {
        format!("{}-{}-{}", self.username_prefix, role_name, random_suffix())
    }

    /// Creates a user for `role` and returns its credential.
    ///
    /// Users that were invited or accepted before a later step failed are not
    /// removed; the username is logged so they can be cleaned up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] naming the step that failed.
    #[tracing::instrument(skip_all, fields(role = %role.name))]
    pub async fn issue<C: IdentityClient>(&self, client: &C, role: &Role) -> Result<Credential> {
        let username = self.username_for(&role.name);

        let invitation = client
            .invite_user(&username, self.invitation_validity)
            .await
            .map_err(|e| Error::provider(ProviderStep::InviteUser, e))?;

        let token = match client.accept_invitation(&invitation).await {
            Ok(token) => token,
            Err(e) => {
                warn!(%username, error = %e, "invitation left pending after failed accept");
                return Err(Error::provider(ProviderStep::AcceptInvitation, e));
            }
        };

        let user = match client.get_user(&username).await {
            Ok(user) => user,
            Err(e) => {
                warn!(%username, error = %e, "user created but lookup failed");
                return Err(Error::provider(ProviderStep::GetUser, e));
            }
        };

        info!(%username, user_id = %user.id, "issued user credential");
        Ok(Credential {
            user_id: user.id,
            username,
            token,
            role_name: role.name.clone(),
        })
    }
}

impl Default for CredentialIssuer {
    fn default() -> Self {
        Self::from_settings(&BackendSettings::default())
    }
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..USERNAME_SUFFIX_LENGTH)
        .map(|_| char::from(SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProvider;
    use crate::provider::ProviderFailure;

    fn setup() -> (InMemoryProvider, crate::memory::InMemoryClient, CredentialIssuer) {
        let provider = InMemoryProvider::new("root");
        let client = provider.client("http://waypoint", AccessToken::new("root"));
        (provider, client, CredentialIssuer::default())
    }

    #[test]
    fn username_has_prefix_role_and_suffix() {
        let issuer = CredentialIssuer::new("vault-role", Duration::from_secs(30));
        let username = issuer.username_for("ci");

        let suffix = username
            .strip_prefix("vault-role-ci-")
            .expect("prefix and role");
        assert_eq!(suffix.len(), USERNAME_SUFFIX_LENGTH);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn usernames_differ() {
        let issuer = CredentialIssuer::default();
        assert_ne!(issuer.username_for("ci"), issuer.username_for("ci"));
    }

    #[test]
    fn credential_debug_redacts_token() {
        let cred = Credential {
            user_id: "u-1".to_string(),
            username: "vault-role-ci-abcdefgh".to_string(),
            token: AccessToken::new("top-secret"),
            role_name: "ci".to_string(),
        };
        let debug = format!("{cred:?}");
        assert!(!debug.contains("top-secret"));
        assert!(debug.contains("u-1"));
    }

    #[tokio::test]
    async fn issue_creates_user_with_token() {
        let (provider, client, issuer) = setup();
        let role = Role::new("ci");

        let cred = issuer.issue(&client, &role).await.expect("issue");

        assert!(!cred.user_id.is_empty());
        assert!(!cred.token.is_empty());
        assert_eq!(cred.role_name, "ci");
        assert!(cred.username.starts_with("vault-role-ci-"));

        let user = provider.find_user(&cred.username).expect("user exists");
        assert_eq!(user.id, cred.user_id);
        assert!(provider.token_matches(&cred.user_id, cred.token.as_str()));
    }

    #[tokio::test]
    async fn issue_invite_failure_is_provider_error() {
        let (provider, client, issuer) = setup();
        provider.fail_next(
            ProviderStep::InviteUser,
            ProviderFailure::Unavailable {
                reason: "timeout".to_string(),
            },
        );

        let err = issuer
            .issue(&client, &Role::new("ci"))
            .await
            .expect_err("invite fails");
        assert!(matches!(
            err,
            Error::Provider {
                step: ProviderStep::InviteUser,
                ..
            }
        ));
        assert_eq!(provider.user_count(), 0);
        assert_eq!(provider.pending_invitations(), 0);
    }

    #[tokio::test]
    async fn issue_username_collision_is_invite_error() {
        let (provider, client, issuer) = setup();
        provider.fail_next(
            ProviderStep::InviteUser,
            ProviderFailure::AlreadyExists {
                name: "vault-role-ci-abcdefgh".to_string(),
            },
        );

        let err = issuer
            .issue(&client, &Role::new("ci"))
            .await
            .expect_err("collision");
        assert!(matches!(
            err,
            Error::Provider {
                step: ProviderStep::InviteUser,
                source: ProviderFailure::AlreadyExists { .. },
            }
        ));
        assert_eq!(provider.user_count(), 0);
        assert_eq!(provider.pending_invitations(), 0);
    }

    #[tokio::test]
    async fn issue_accept_failure_leaves_invitation_pending() {
        let (provider, client, issuer) = setup();
        provider.fail_next(
            ProviderStep::AcceptInvitation,
            ProviderFailure::Unavailable {
                reason: "reset".to_string(),
            },
        );

        let err = issuer
            .issue(&client, &Role::new("ci"))
            .await
            .expect_err("accept fails");
        assert!(matches!(
            err,
            Error::Provider {
                step: ProviderStep::AcceptInvitation,
                ..
            }
        ));
        assert_eq!(provider.user_count(), 0);
        assert_eq!(provider.pending_invitations(), 1);
    }

    #[tokio::test]
    async fn issue_lookup_failure_leaves_user() {
        let (provider, client, issuer) = setup();
        provider.fail_next(
            ProviderStep::GetUser,
            ProviderFailure::Unavailable {
                reason: "reset".to_string(),
            },
        );

        let err = issuer
            .issue(&client, &Role::new("ci"))
            .await
            .expect_err("lookup fails");
        assert!(matches!(
            err,
            Error::Provider {
                step: ProviderStep::GetUser,
                ..
            }
        ));
        assert_eq!(provider.user_count(), 1);
    }

    #[tokio::test]
    async fn issue_unauthorized_client() {
        let provider = InMemoryProvider::new("root");
        let client = provider.client("http://waypoint", AccessToken::new("wrong"));

        let err = CredentialIssuer::default()
            .issue(&client, &Role::new("ci"))
            .await
            .expect_err("unauthorized");
        assert!(matches!(
            err,
            Error::Provider {
                source: ProviderFailure::Unauthorized { .. },
                ..
            }
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn username_embeds_role(role in "[a-z0-9][a-z0-9_-]{0,30}") {
                let issuer = CredentialIssuer::default();
                let username = issuer.username_for(&role);
                let expected_prefix = format!("vault-role-{role}-");
                prop_assert!(username.starts_with(&expected_prefix));
                prop_assert_eq!(username.len(), expected_prefix.len() + USERNAME_SUFFIX_LENGTH);
            }
        }
    }
}
