use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::crypto::{self, EncryptedBlob};
use super::storage::{KeyValueStore, MemoryStore, Scope};
use super::VaultError;

/// Prefix marking the entries this vault owns inside a scope
const KEY_PREFIX: &str = "vault.";

/// Encrypts payloads under the application passphrase and keeps them in one
/// of two storage scopes.
///
/// Clone is cheap; clones share the same stores.
#[derive(Clone)]
pub struct CredentialVault {
    passphrase: Arc<str>,
    durable: Arc<dyn KeyValueStore>,
    ephemeral: Arc<dyn KeyValueStore>,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("passphrase", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    pub fn new(
        passphrase: impl Into<String>,
        durable: Arc<dyn KeyValueStore>,
        ephemeral: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            passphrase: Arc::from(passphrase.into()),
            durable,
            ephemeral,
        }
    }

    /// A vault whose scopes both live in memory
    pub fn in_memory(passphrase: impl Into<String>) -> Self {
        Self::new(passphrase, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    fn store(&self, scope: Scope) -> &dyn KeyValueStore {
        match scope {
            Scope::Durable => self.durable.as_ref(),
            Scope::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    fn scoped_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    pub fn encrypt<T: Serialize + ?Sized>(&self, payload: &T) -> Result<EncryptedBlob, VaultError> {
        crypto::encrypt(payload, &self.passphrase)
    }

    pub fn decrypt<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> Result<T, VaultError> {
        crypto::decrypt(blob, &self.passphrase)
    }

    fn try_store<T: Serialize + ?Sized>(&self, scope: Scope, key: &str, payload: &T) -> Result<(), VaultError> {
        let blob = self.encrypt(payload)?;
        self.store(scope).set(&Self::scoped_key(key), blob.as_str())?;
        Ok(())
    }

    /// Encrypt `payload` and write it under `key`.
    ///
    /// Returns false instead of an error when serialization or the write fails.
    pub fn store_securely<T: Serialize + ?Sized>(&self, scope: Scope, key: &str, payload: &T) -> bool {
        match self.try_store(scope, key, payload) {
            Ok(()) => {
                debug!(?scope, key, "Stored encrypted entry");
                true
            }
            Err(e) => {
                warn!(?scope, key, error = %e, "Secure storage failed");
                false
            }
        }
    }

    /// Read and decrypt the entry under `key`.
    ///
    /// Absence and every kind of failure both come back as `None`.
    pub fn retrieve_securely<T: DeserializeOwned>(&self, scope: Scope, key: &str) -> Option<T> {
        let encoded = match self.store(scope).get(&Self::scoped_key(key)) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return None,
            Err(e) => {
                warn!(?scope, key, error = %e, "Secure retrieval failed");
                return None;
            }
        };

        match self.decrypt(&EncryptedBlob::from(encoded)) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(?scope, key, error = %e, "Secure retrieval failed");
                None
            }
        }
    }

    /// Remove a single entry. Missing entries are not an error.
    pub fn remove(&self, scope: Scope, key: &str) {
        if let Err(e) = self.store(scope).remove(&Self::scoped_key(key)) {
            warn!(?scope, key, error = %e, "Failed to remove vault entry");
        }
    }

    /// Remove every vault-managed entry from `scope`, leaving foreign keys alone.
    pub fn clear(&self, scope: Scope) {
        let store = self.store(scope);
        let keys = match store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(?scope, error = %e, "Failed to list vault entries");
                return;
            }
        };

        for key in keys.iter().filter(|k| k.starts_with(KEY_PREFIX)) {
            if let Err(e) = store.remove(key) {
                warn!(?scope, key = %key, error = %e, "Failed to remove vault entry");
            }
        }
    }
}
