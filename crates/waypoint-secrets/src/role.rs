//! Roles: named TTL policies that credentials are issued under.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::WriteMode;
use crate::error::{Error, Result};
use crate::storage::{Storage, StorageEntry};

/// Storage prefix of role entries.
pub const ROLE_STORAGE_PREFIX: &str = "role/";

/// Maximum role name length.
pub const MAX_ROLE_NAME_LENGTH: usize = 128;

/// Names the host accepts as a single path segment.
static ROLE_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_]([A-Za-z0-9_\-.@]*[A-Za-z0-9_])?$")
        .unwrap_or_else(|_| unreachable!())
});

/// Checks a role name.
///
/// # Errors
///
/// Returns [`Error::InvalidRole`] if the name is empty, too long, or contains
/// characters outside `[A-Za-z0-9_.@-]`.
pub fn validate_role_name(name: &str) -> Result<()> {
    if name.len() > MAX_ROLE_NAME_LENGTH {
        return Err(Error::InvalidRole {
            reason: format!("role name exceeds {MAX_ROLE_NAME_LENGTH} characters"),
        });
    }
    if !ROLE_NAME_REGEX.is_match(name) {
        return Err(Error::InvalidRole {
            reason: format!("invalid role name '{name}'"),
        });
    }
    Ok(())
}

/// Serializes a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// A named lease policy.
///
/// A zero `ttl` or `max_ttl` means "unset": the host default applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name.
    pub name: String,
    /// Lease TTL.
    #[serde(with = "duration_secs", default)]
    pub ttl: Duration,
    /// Lease max TTL.
    #[serde(with = "duration_secs", default)]
    pub max_ttl: Duration,
}

impl Role {
    /// Creates a role with unset TTLs.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: Duration::ZERO,
            max_ttl: Duration::ZERO,
        }
    }

    /// Sets the TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the max TTL.
    #[must_use]
    pub const fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = max_ttl;
        self
    }

    /// Checks the name and that `ttl <= max_ttl` when `max_ttl` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRole`] if the policy is inconsistent.
    pub fn validate(&self) -> Result<()> {
        validate_role_name(&self.name)?;
        if !self.max_ttl.is_zero() && self.ttl > self.max_ttl {
            return Err(Error::InvalidRole {
                reason: format!(
                    "ttl ({}s) cannot be greater than max_ttl ({}s)",
                    self.ttl.as_secs(),
                    self.max_ttl.as_secs()
                ),
            });
        }
        Ok(())
    }

    fn storage_key(name: &str) -> String {
        format!("{ROLE_STORAGE_PREFIX}{name}")
    }
}

/// A partial role write. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleUpdate {
    /// New TTL.
    pub ttl: Option<Duration>,
    /// New max TTL.
    pub max_ttl: Option<Duration>,
}

/// Persists roles by name.
pub struct RoleStore<S> {
    storage: Arc<S>,
}

impl<S: Storage> RoleStore<S> {
    /// Creates a role store over `storage`.
    #[must_use]
    pub const fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Returns the role, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn get(&self, name: &str) -> Result<Option<Role>> {
        let Some(entry) = self.storage.get(&Role::storage_key(name)).await? else {
            return Ok(None);
        };
        Ok(Some(entry.decode_json()?))
    }

    /// Returns the role, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoleNotFound`] if the role is missing.
    pub async fn require(&self, name: &str) -> Result<Role> {
        self.get(name).await?.ok_or_else(|| Error::RoleNotFound {
            name: name.to_string(),
        })
    }

    /// Creates or updates a role, merging `update` into the stored entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the resulting policy is
    /// inconsistent, the role to update does not exist, or storage fails.
    pub async fn put(&self, name: &str, update: RoleUpdate, mode: WriteMode) -> Result<Role> {
        validate_role_name(name)?;

        let mut role = match (self.get(name).await?, mode) {
            (Some(role), _) => role,
            (None, WriteMode::Create) => Role::new(name),
            (None, WriteMode::Update) => {
                return Err(Error::RoleNotFound {
                    name: name.to_string(),
                });
            }
        };

        if let Some(ttl) = update.ttl {
            role.ttl = ttl;
        }
        if let Some(max_ttl) = update.max_ttl {
            role.max_ttl = max_ttl;
        }
        role.validate()?;

        let entry = StorageEntry::json(Role::storage_key(name), &role)?;
        self.storage.put(entry).await?;

        info!(
            role = %role.name,
            ttl_secs = role.ttl.as_secs(),
            max_ttl_secs = role.max_ttl.as_secs(),
            "role written"
        );
        Ok(role)
    }

    /// Deletes a role. Leases already issued under it can no longer renew.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.storage.delete(&Role::storage_key(name)).await?;
        info!(role = %name, "role deleted");
        Ok(())
    }

    /// Lists role names.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.storage.list(ROLE_STORAGE_PREFIX).await?)
    }
}
