//! Error types for the Waypoint secrets engine.

use std::fmt;

use thiserror::Error;

use crate::provider::ProviderFailure;
use crate::storage::StorageError;

/// The provider call during which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderStep {
    /// Building an authenticated client from the stored configuration.
    Connect,
    /// Inviting a new user.
    InviteUser,
    /// Accepting an invitation to obtain a token.
    AcceptInvitation,
    /// Resolving a user by name.
    GetUser,
    /// Deleting a user.
    DeleteUser,
}

impl ProviderStep {
    /// Returns a short, human-readable name for the step.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::InviteUser => "invite user",
            Self::AcceptInvitation => "accept invitation",
            Self::GetUser => "get user",
            Self::DeleteUser => "delete user",
        }
    }
}

impl fmt::Display for ProviderStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the secrets engine.
#[derive(Debug, Error)]
pub enum Error {
    /// No provider configuration, or an incomplete one, when a client is needed.
    #[error("provider configuration missing: {reason}")]
    ConfigMissing {
        /// What is missing.
        reason: String,
    },

    /// The named role does not exist.
    #[error("role not found: {name}")]
    RoleNotFound {
        /// Name of the role that was looked up.
        name: String,
    },

    /// A call to the identity provider failed.
    #[error("provider error during {step}: {source}")]
    Provider {
        /// The call that failed.
        step: ProviderStep,
        /// The underlying provider failure.
        #[source]
        source: ProviderFailure,
    },

    /// The storage collaborator failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The request is malformed or missing required data.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// The reason the request is invalid.
        reason: String,
    },

    /// Role policy validation failed.
    #[error("invalid role: {reason}")]
    InvalidRole {
        /// The reason the role is invalid.
        reason: String,
    },

    /// Backend settings failed validation.
    #[error("invalid settings: {reason}")]
    InvalidSettings {
        /// The reason the settings are invalid.
        reason: String,
    },

    /// No handler is registered for the path.
    #[error("unsupported path: {path}")]
    UnsupportedPath {
        /// The requested path.
        path: String,
    },

    /// The path exists but does not support the operation.
    #[error("unsupported operation {operation} on path '{path}'")]
    UnsupportedOperation {
        /// The requested operation.
        operation: String,
        /// The requested path.
        path: String,
    },
}

impl Error {
    /// Wraps a provider failure with the step that produced it.
    #[must_use]
    pub const fn provider(step: ProviderStep, source: ProviderFailure) -> Self {
        Self::Provider { step, source }
    }

    /// Returns true if this error came from the identity provider.
    #[must_use]
    pub const fn is_provider(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }
}

/// Result type alias for secrets engine operations.
pub type Result<T> = std::result::Result<T, Error>;
