//! idgate-core - client session layer for an identity service.
//!
//! - `vault`: password-derived AES-GCM encryption of credentials at rest
//! - `auth`: the `SessionManager` owning the bearer credential, its proactive
//!   refresh and the single-flight 401 refresh with FIFO replay
//! - `api`: transport seam, backoff and the typed `IdentityClient`
//! - `models`: wire types of the identity service
//! - `config`: on-disk configuration with environment overrides

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod vault;

pub use api::{ApiError, ApiRequest, ApiResponse, HttpTransport, IdentityClient, RetryPolicy, Transport};
pub use auth::{Credential, CredentialState, RefreshState, SessionManager, SessionSettings, SessionStatus};
pub use config::Config;
pub use vault::{CredentialVault, FileStore, KeyValueStore, MemoryStore, Scope, VaultError};
