use thiserror::Error;

use super::storage::StorageError;

#[derive(Error, Debug)]
pub enum VaultError {
    /// The blob could not be authenticated under the given passphrase.
    /// Wrong passphrase, truncation and tampering all end up here.
    #[error("Failed to decrypt data - invalid passphrase or corrupted data")]
    Decryption,

    #[error("Failed to encrypt data")]
    Encryption,

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
