//! Backend settings.
//!
//! Settings are fixed for the lifetime of a mounted backend:
//! - the prefix of generated usernames
//! - how long an invitation stays valid between invite and accept
//! - the host's default and maximum lease TTLs

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings for a mounted backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSettings {
    /// Prefix of every generated username.
    pub username_prefix: String,
    /// Invitation validity window in seconds.
    pub invitation_validity_secs: u64,
    /// Lease TTL applied when a role leaves `ttl` unset, in seconds.
    pub default_lease_ttl_secs: u64,
    /// Lease max TTL applied when a role leaves `max_ttl` unset, in seconds.
    pub max_lease_ttl_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            username_prefix: "vault-role".to_string(),
            invitation_validity_secs: 30,
            default_lease_ttl_secs: 768 * 3600, // 32 days, the host default
            max_lease_ttl_secs: 768 * 3600,
        }
    }
}

impl BackendSettings {
    /// Load settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidSettings {
                reason: format!(
                    "failed to read settings file '{}': {e}",
                    path.as_ref().display()
                ),
            })?;

        Self::from_json(&content)
    }

    /// Parse settings from a JSON string. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the settings fail validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(content).map_err(|e| Error::InvalidSettings {
            reason: format!("invalid JSON: {e}"),
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.username_prefix.is_empty() {
            return Err(Error::InvalidSettings {
                reason: "username prefix cannot be empty".to_string(),
            });
        }

        if !self
            .username_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidSettings {
                reason: format!(
                    "username prefix '{}' may only contain alphanumerics, hyphens and underscores",
                    self.username_prefix
                ),
            });
        }

        if self.invitation_validity_secs == 0 {
            return Err(Error::InvalidSettings {
                reason: "invitation validity must be greater than zero".to_string(),
            });
        }

        if self.default_lease_ttl_secs > self.max_lease_ttl_secs {
            return Err(Error::InvalidSettings {
                reason: "default lease TTL cannot exceed max lease TTL".to_string(),
            });
        }

        Ok(())
    }

    /// Invitation validity window.
    #[must_use]
    pub const fn invitation_validity(&self) -> Duration {
        Duration::from_secs(self.invitation_validity_secs)
    }

    /// Default lease TTL.
    #[must_use]
    pub const fn default_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lease_ttl_secs)
    }

    /// Maximum lease TTL.
    #[must_use]
    pub const fn max_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.max_lease_ttl_secs)
    }
}
