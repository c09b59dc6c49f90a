//! Request and response envelope exchanged with the host.
//!
//! The host owns the real wire format; these types carry only what the
//! handlers read and write.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::lease::Lease;

/// Operation requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read an entry, or issue a credential on `creds/`.
    Read,
    /// Write an entry that does not exist yet.
    Create,
    /// Write an entry that already exists.
    Update,
    /// Delete an entry.
    Delete,
    /// List entries under a prefix.
    List,
    /// Lease renewal callback.
    Renew,
    /// Lease revocation callback.
    Revoke,
}

impl Operation {
    /// Returns the lowercase operation name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Renew => "renew",
            Self::Revoke => "revoke",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request routed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Requested operation.
    pub operation: Operation,
    /// Path relative to the mount point.
    pub path: String,
    /// Request fields.
    pub data: Map<String, Value>,
    /// Lease handed back by the host on renew and revoke.
    pub secret: Option<Lease>,
}

impl Request {
    /// Creates a request without fields.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: Map::new(),
            secret: None,
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Attaches the lease for a renew or revoke callback.
    #[must_use]
    pub fn with_secret(mut self, lease: Lease) -> Self {
        self.secret = Some(lease);
        self
    }

    /// Reads an optional string field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the field is present but not a string.
    pub fn string_field(&self, key: &str) -> Result<Option<String>> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(Error::InvalidRequest {
                reason: format!("field '{key}' must be a string, got {other}"),
            }),
        }
    }

    /// Reads an optional duration field.
    ///
    /// Accepts a non-negative integer number of seconds or a string such as
    /// `"300"`, `"300s"`, `"5m"`, `"2h"` or `"1d"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the field cannot be parsed.
    pub fn duration_field(&self, key: &str) -> Result<Option<Duration>> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Duration::from_secs).map(Some).ok_or_else(|| {
                Error::InvalidRequest {
                    reason: format!("field '{key}' must be a non-negative whole number of seconds"),
                }
            }),
            Some(Value::String(s)) => parse_duration(s)
                .map(Some)
                .map_err(|reason| Error::InvalidRequest {
                    reason: format!("field '{key}': {reason}"),
                }),
            Some(other) => Err(Error::InvalidRequest {
                reason: format!("field '{key}' must be a duration, got {other}"),
            }),
        }
    }

    /// Returns the attached lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if no lease is attached.
    pub fn require_secret(&self) -> Result<&Lease> {
        self.secret.as_ref().ok_or_else(|| Error::InvalidRequest {
            reason: format!("{} requires a lease", self.operation),
        })
    }
}

/// Parses a duration such as `"90"`, `"90s"`, `"15m"`, `"2h"` or `"1d"`.
///
/// # Errors
///
/// Returns a description of the problem if the string is not a duration.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    if digits.is_empty() {
        return Err(format!("invalid duration '{input}'"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => return Err(format!("unknown duration unit '{other}'")),
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{input}' is too large"))
}

/// A handler response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// Data visible to the requester.
    pub data: Map<String, Value>,
    /// Lease to register with the host, if a credential was issued.
    pub secret: Option<Lease>,
}

impl Response {
    /// Creates a response carrying `data`.
    #[must_use]
    pub const fn with_data(data: Map<String, Value>) -> Self {
        Self { data, secret: None }
    }

    /// Creates a response for an issued or renewed lease.
    ///
    /// The visible data is the lease's `data`; the internal data stays in
    /// the lease.
    #[must_use]
    pub fn for_lease(lease: Lease) -> Self {
        Self {
            data: lease.data.clone(),
            secret: Some(lease),
        }
    }
}
