//! In-memory Waypoint server.
//!
//! [`InMemoryProvider`] keeps users and pending invitations in process so the
//! engine can run without a real server. It supports one-shot failure
//! injection per call and counts client constructions, which the tests use
//! to observe cache behaviour.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::ProviderStep;
use crate::provider::{
    AccessToken, ClientFactory, IdentityClient, Invitation, ProviderFailure, ProviderUser,
};

/// Length of generated user tokens.
const TOKEN_LENGTH: usize = 40;

#[derive(Debug)]
struct UserRecord {
    username: String,
    token: AccessToken,
}

#[derive(Debug)]
struct PendingInvitation {
    username: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ProviderState {
    users: HashMap<String, UserRecord>,
    invitations: HashMap<String, PendingInvitation>,
}

#[derive(Debug)]
struct Inner {
    operator_token: String,
    state: Mutex<ProviderState>,
    failures: Mutex<HashMap<ProviderStep, ProviderFailure>>,
}

/// A simulated Waypoint server shared by all clients connected to it.
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    inner: Arc<Inner>,
}

impl InMemoryProvider {
    /// Creates a server that accepts `operator_token` for user management.
    #[must_use]
    pub fn new(operator_token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                operator_token: operator_token.into(),
                state: Mutex::new(ProviderState::default()),
                failures: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Makes the next call of `step` fail with `failure`.
    pub fn fail_next(&self, step: ProviderStep, failure: ProviderFailure) {
        self.inner.failures.lock().insert(step, failure);
    }

    /// Returns a client authenticated with `token`.
    #[must_use]
    pub fn client(&self, address: impl Into<String>, token: AccessToken) -> InMemoryClient {
        InMemoryClient {
            provider: self.clone(),
            address: address.into(),
            token,
        }
    }

    /// Looks up a user by name without going through a client.
    #[must_use]
    pub fn find_user(&self, username: &str) -> Option<ProviderUser> {
        let state = self.inner.state.lock();
        state
            .users
            .iter()
            .find(|(_, record)| record.username == username)
            .map(|(id, record)| ProviderUser {
                id: id.clone(),
                username: record.username.clone(),
            })
    }

    /// Returns the username of the user with `user_id`.
    #[must_use]
    pub fn username_of(&self, user_id: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .users
            .get(user_id)
            .map(|record| record.username.clone())
    }

    /// Returns true if `token` belongs to the user with `user_id`.
    #[must_use]
    pub fn token_matches(&self, user_id: &str, token: &str) -> bool {
        self.inner
            .state
            .lock()
            .users
            .get(user_id)
            .is_some_and(|record| record.token.as_str() == token)
    }

    /// Returns the number of users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.inner.state.lock().users.len()
    }

    /// Returns the number of invitations not yet accepted.
    #[must_use]
    pub fn pending_invitations(&self) -> usize {
        self.inner.state.lock().invitations.len()
    }

    /// Moves the expiry of every pending invitation into the past.
    pub fn expire_invitations(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for invitation in self.inner.state.lock().invitations.values_mut() {
            invitation.expires_at = past;
        }
    }

    fn authorize(&self, token: &AccessToken, step: ProviderStep) -> Result<(), ProviderFailure> {
        if let Some(failure) = self.inner.failures.lock().remove(&step) {
            return Err(failure);
        }
        if token.as_str() != self.inner.operator_token {
            return Err(ProviderFailure::Unauthorized {
                reason: "invalid operator token".to_string(),
            });
        }
        Ok(())
    }

    fn invite(&self, username: &str, validity: Duration) -> Result<Invitation, ProviderFailure> {
        let validity =
            chrono::Duration::from_std(validity).map_err(|e| ProviderFailure::Unavailable {
                reason: format!("invalid invitation validity: {e}"),
            })?;

        let mut state = self.inner.state.lock();
        let taken = state.users.values().any(|u| u.username == username)
            || state.invitations.values().any(|i| i.username == username);
        if taken {
            return Err(ProviderFailure::AlreadyExists {
                name: username.to_string(),
            });
        }

        let code = random_string(24);
        state.invitations.insert(
            code.clone(),
            PendingInvitation {
                username: username.to_string(),
                expires_at: Utc::now() + validity,
            },
        );
        Ok(Invitation::new(code))
    }

    fn accept(&self, invitation: &Invitation) -> Result<AccessToken, ProviderFailure> {
        let mut state = self.inner.state.lock();
        let pending = state
            .invitations
            .remove(invitation.code())
            .ok_or_else(|| ProviderFailure::NotFound {
                what: "invitation".to_string(),
            })?;

        if pending.expires_at < Utc::now() {
            return Err(ProviderFailure::InvitationExpired);
        }

        let token = AccessToken::new(random_string(TOKEN_LENGTH));
        state.users.insert(
            Uuid::new_v4().to_string(),
            UserRecord {
                username: pending.username,
                token: token.clone(),
            },
        );
        Ok(token)
    }

    fn delete(&self, user_id: &str) -> Result<(), ProviderFailure> {
        self.inner
            .state
            .lock()
            .users
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| ProviderFailure::NotFound {
                what: format!("user {user_id}"),
            })
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A client connected to an [`InMemoryProvider`].
#[derive(Debug)]
pub struct InMemoryClient {
    provider: InMemoryProvider,
    address: String,
    token: AccessToken,
}

impl InMemoryClient {
    /// Returns the address this client was built for.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl IdentityClient for InMemoryClient {
    async fn invite_user(
        &self,
        username: &str,
        validity: Duration,
    ) -> Result<Invitation, ProviderFailure> {
        self.provider.authorize(&self.token, ProviderStep::InviteUser)?;
        self.provider.invite(username, validity)
    }

    async fn accept_invitation(
        &self,
        invitation: &Invitation,
    ) -> Result<AccessToken, ProviderFailure> {
        self.provider
            .authorize(&self.token, ProviderStep::AcceptInvitation)?;
        self.provider.accept(invitation)
    }

    async fn get_user(&self, username: &str) -> Result<ProviderUser, ProviderFailure> {
        self.provider.authorize(&self.token, ProviderStep::GetUser)?;
        self.provider
            .find_user(username)
            .ok_or_else(|| ProviderFailure::NotFound {
                what: format!("user {username}"),
            })
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), ProviderFailure> {
        self.provider.authorize(&self.token, ProviderStep::DeleteUser)?;
        self.provider.delete(user_id)
    }
}

/// Builds [`InMemoryClient`]s and counts how many were built.
#[derive(Debug)]
pub struct InMemoryClientFactory {
    provider: InMemoryProvider,
    connections: AtomicUsize,
    connect_failure: Mutex<Option<ProviderFailure>>,
}

impl InMemoryClientFactory {
    /// Creates a factory for clients of `provider`.
    #[must_use]
    pub fn new(provider: InMemoryProvider) -> Self {
        Self {
            provider,
            connections: AtomicUsize::new(0),
            connect_failure: Mutex::new(None),
        }
    }

    /// Returns the provider clients connect to.
    #[must_use]
    pub const fn provider(&self) -> &InMemoryProvider {
        &self.provider
    }

    /// Returns the number of clients built so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Makes the next `connect` call fail with `failure`.
    pub fn fail_connect(&self, failure: ProviderFailure) {
        *self.connect_failure.lock() = Some(failure);
    }
}

impl ClientFactory for InMemoryClientFactory {
    type Client = InMemoryClient;

    fn connect(&self, config: &ProviderConfig) -> Result<InMemoryClient, ProviderFailure> {
        if let Some(failure) = self.connect_failure.lock().take() {
            return Err(failure);
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .provider
            .client(config.address.clone(), config.access_token()))
    }
}
