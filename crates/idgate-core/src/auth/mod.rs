//! Authentication module for managing the bearer credential.
//!
//! This module provides:
//! - `Credential`: a bearer token plus the expiry read from its claims
//! - `SessionManager`: credential lifecycle, single-flight refresh and
//!   replay of requests that hit a 401 while a refresh was running
//!
//! Credentials are refreshed 5 minutes before they expire.

pub mod credential;
pub mod session;

pub use credential::{Credential, StoredSession};
pub use session::{CredentialState, RefreshState, SessionManager, SessionSettings, SessionStatus};
