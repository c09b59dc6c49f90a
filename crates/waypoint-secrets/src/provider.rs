//! Capability surface of the external identity provider.
//!
//! The engine only needs four calls from a Waypoint server: invite a user,
//! accept the invitation to obtain a token, look the user up by name, and
//! delete the user. Every call is network-bound and may fail.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::ProviderConfig;

/// Failures reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderFailure {
    /// The referenced user or invitation does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing object.
        what: String,
    },

    /// A user or pending invitation with this name already exists.
    #[error("already exists: {name}")]
    AlreadyExists {
        /// The conflicting name.
        name: String,
    },

    /// The invitation validity window has passed.
    #[error("invitation expired")]
    InvitationExpired,

    /// The provider rejected the operator token.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// The reason given by the provider.
        reason: String,
    },

    /// The provider could not be reached or refused the request.
    #[error("provider unavailable: {reason}")]
    Unavailable {
        /// The transport or server error.
        reason: String,
    },
}

/// An authentication token issued by the provider.
///
/// The value is zeroized on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the token is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// A pending invitation returned by [`IdentityClient::invite_user`].
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Invitation {
    code: String,
}

impl Invitation {
    /// Wraps an invitation code.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }

    /// Returns the invitation code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invitation")
            .field("code", &"[REDACTED]")
            .finish()
    }
}

/// A user as known to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUser {
    /// Stable provider-assigned identifier.
    pub id: String,
    /// Login name.
    pub username: String,
}

/// Client for the identity provider.
pub trait IdentityClient: Send + Sync + 'static {
    /// Invites a user; the invitation is valid for `validity`.
    fn invite_user(
        &self,
        username: &str,
        validity: Duration,
    ) -> impl Future<Output = Result<Invitation, ProviderFailure>> + Send;

    /// Accepts an invitation, creating the user and returning its token.
    fn accept_invitation(
        &self,
        invitation: &Invitation,
    ) -> impl Future<Output = Result<AccessToken, ProviderFailure>> + Send;

    /// Looks a user up by login name.
    fn get_user(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<ProviderUser, ProviderFailure>> + Send;

    /// Deletes a user by identifier.
    fn delete_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<(), ProviderFailure>> + Send;
}

/// Builds authenticated clients from a provider configuration.
///
/// The client cache calls this at most once per configuration change.
pub trait ClientFactory: Send + Sync + 'static {
    /// The client type produced by this factory.
    type Client: IdentityClient;

    /// Creates a client for `config`. The config has already been checked
    /// for a non-empty address and token.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed.
    fn connect(&self, config: &ProviderConfig) -> Result<Self::Client, ProviderFailure>;
}
