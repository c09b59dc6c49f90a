//! # Waypoint Secrets
//!
//! A dynamic secrets engine that issues short-lived Waypoint users:
//!
//! - **Credential issuance**: every read of `creds/<role>` invites, accepts
//!   and looks up a fresh Waypoint user and returns its token
//! - **Leases**: issued users carry renewable leases whose TTLs follow the
//!   role's *current* policy; revocation deletes the user
//! - **Client cache**: one authenticated provider client, built lazily and
//!   rebuilt whenever the provider configuration changes
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use waypoint_secrets::{
//!     Backend, BackendSettings, InMemoryClientFactory, InMemoryProvider, InMemoryStorage,
//!     Operation, Request,
//! };
//!
//! # let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
//! # runtime.block_on(async {
//! let provider = InMemoryProvider::new("operator-token");
//! let backend = Backend::new(
//!     &BackendSettings::default(),
//!     Arc::new(InMemoryStorage::new()),
//!     InMemoryClientFactory::new(provider),
//! )
//! .expect("valid settings");
//!
//! let config = Request::new(Operation::Create, "config")
//!     .with_field("token", "operator-token")
//!     .with_field("address", "https://waypoint.internal:9702");
//! backend.handle_request(&config).await.expect("configured");
//!
//! let role = Request::new(Operation::Create, "role/ci").with_field("ttl", "5m");
//! backend.handle_request(&role).await.expect("role written");
//!
//! let creds = backend
//!     .handle_request(&Request::new(Operation::Read, "creds/ci"))
//!     .await
//!     .expect("issued")
//!     .expect("response");
//! assert!(creds.data.contains_key("token"));
//! # });
//! ```
//!
//! ## Security Considerations
//!
//! - Tokens are zeroized on drop and redacted from `Debug` output
//! - The provider operator token is write-only through the `config` path
//! - Provider failures are returned as errors; the engine never aborts the host

#![forbid(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod issuer;
pub mod lease;
pub mod memory;
pub mod provider;
pub mod request;
pub mod role;
pub mod settings;
pub mod storage;

// Re-export commonly used types
pub use error::{Error, ProviderStep, Result};

pub use backend::Backend;
pub use cache::{CacheState, ClientCache};
pub use config::{ConfigStore, ConfigUpdate, ProviderConfig, WriteMode};
pub use issuer::{Credential, CredentialIssuer};
pub use lease::{Lease, LeaseManager, LeaseTtl};
pub use memory::{InMemoryClient, InMemoryClientFactory, InMemoryProvider};
pub use provider::{
    AccessToken, ClientFactory, IdentityClient, Invitation, ProviderFailure, ProviderUser,
};
pub use request::{Operation, Request, Response};
pub use role::{Role, RoleStore, RoleUpdate};
pub use settings::BackendSettings;
pub use storage::{InMemoryStorage, Storage, StorageEntry, StorageError};
