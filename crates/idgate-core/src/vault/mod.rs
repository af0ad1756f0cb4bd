//! Encrypted at-rest storage for session data.
//!
//! This module provides:
//! - `crypto`: AES-256-GCM encryption of JSON payloads under a PBKDF2-derived key
//! - `storage`: the durable and ephemeral key-value scopes blobs are written to
//! - `CredentialVault`: encrypt-and-store / retrieve-and-decrypt over those scopes
//!
//! The vault passphrase is an application constant, not a user secret. It keeps
//! stored blobs opaque to anyone browsing the storage, nothing more.

pub mod credential_vault;
pub mod crypto;
pub mod error;
pub mod storage;

pub use credential_vault::CredentialVault;
pub use crypto::{decrypt, derive_api_signing_value, encrypt, hash_string, EncryptedBlob};
pub use error::VaultError;
pub use storage::{FileStore, KeyValueStore, MemoryStore, Scope, StorageError};
