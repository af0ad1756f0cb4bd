//! Password-based authenticated encryption of JSON payloads.
//!
//! Every blob is framed as `salt (16) || iv (12) || ciphertext || tag (16)` and
//! base64 encoded into a single string. Salt and iv come fresh from the OS
//! random source on every call; the key is re-derived from the embedded salt
//! on every decrypt and never stored.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use super::VaultError;

/// Salt length in bytes
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes (96 bits)
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes
const TAG_LEN: usize = 16;

/// PBKDF2-HMAC-SHA256 rounds used to derive the AES key
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-256 key length in bytes
const KEY_LEN: usize = 32;

/// A base64 encoded `salt || iv || ciphertext` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptedBlob(String);

impl EncryptedBlob {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The salt and iv prefix of the blob, if it decodes and is long enough.
    pub fn nonce_material(&self) -> Option<Vec<u8>> {
        let framed = STANDARD.decode(&self.0).ok()?;
        if framed.len() < SALT_LEN + IV_LEN {
            return None;
        }
        Some(framed[..SALT_LEN + IV_LEN].to_vec())
    }
}

impl From<String> for EncryptedBlob {
    fn from(encoded: String) -> Self {
        Self(encoded)
    }
}

impl From<&str> for EncryptedBlob {
    fn from(encoded: &str) -> Self {
        Self(encoded.to_string())
    }
}

impl std::fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Fresh salt and iv from the OS random source. The only randomness `encrypt` uses.
fn fresh_nonce_material() -> ([u8; SALT_LEN], [u8; IV_LEN]) {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);
    (salt, iv)
}

/// Serialize `payload` to JSON and encrypt it under a key derived from `passphrase`.
pub fn encrypt<T: Serialize + ?Sized>(payload: &T, passphrase: &str) -> Result<EncryptedBlob, VaultError> {
    let plaintext = serde_json::to_vec(payload)?;
    let (salt, iv) = fresh_nonce_material();
    let key = derive_key(passphrase, &salt);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::Encryption)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|_| VaultError::Encryption)?;

    let mut framed = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    framed.extend_from_slice(&salt);
    framed.extend_from_slice(&iv);
    framed.extend_from_slice(&ciphertext);

    Ok(EncryptedBlob(STANDARD.encode(framed)))
}

/// Decrypt a blob produced by [`encrypt`] and deserialize its JSON payload.
///
/// Any failure (bad base64, short blob, tag mismatch, unexpected payload shape)
/// is reported as [`VaultError::Decryption`].
pub fn decrypt<T: DeserializeOwned>(blob: &EncryptedBlob, passphrase: &str) -> Result<T, VaultError> {
    let framed = STANDARD.decode(blob.as_str()).map_err(|_| VaultError::Decryption)?;
    if framed.len() < SALT_LEN + IV_LEN + TAG_LEN {
        return Err(VaultError::Decryption);
    }

    let (salt, rest) = framed.split_at(SALT_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);
    let key = derive_key(passphrase, salt);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::Decryption)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| VaultError::Decryption)?;

    serde_json::from_slice(&plaintext).map_err(|_| VaultError::Decryption)
}

/// SHA-256 of a string, hex encoded
pub fn hash_string(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningClaim<'a> {
    digest: &'a str,
    issued_at: i64,
}

/// Produce a single-use value authenticating a request to the identity service.
///
/// The digest covers every nonce source plus the issue instant and is sealed
/// under `secret` with fresh salt and iv, so two calls never yield the same value.
pub fn derive_api_signing_value(secret: &str, nonce_sources: &[&str]) -> Result<EncryptedBlob, VaultError> {
    let issued_at = Utc::now().timestamp_millis();

    let mut hasher = Sha256::new();
    for source in nonce_sources {
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(issued_at.to_be_bytes());
    let digest = hex::encode(hasher.finalize());

    encrypt(&SigningClaim { digest: &digest, issued_at }, secret)
}
