//! AES-256-GCM encryption for credentials at rest.
//!
//! The process-wide key is SHA-256 of the `OJPILOT_SECRET` environment
//! value, derived once at startup. Adapter credential bags and provider
//! API keys never touch the database unencrypted.
//!
//! Ciphertext format: `nonce(12) || ciphertext(N) || tag(16)`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SECRET_ENV: &str = "OJPILOT_SECRET";

/// A derived process-wide symmetric key.
#[derive(Clone)]
pub struct SecretKey {
    key: [u8; KEY_LEN],
}

impl SecretKey {
    /// Derive the key from the `OJPILOT_SECRET` environment value.
    pub fn from_env() -> Result<Self, StorageError> {
        let secret = std::env::var(SECRET_ENV).map_err(|_| StorageError::Crypto {
            message: format!("{SECRET_ENV} is not set"),
        })?;
        if secret.is_empty() {
            return Err(StorageError::Crypto {
                message: format!("{SECRET_ENV} is empty"),
            });
        }
        Ok(Self::from_secret(&secret))
    }

    /// Derive the key from an explicit secret string.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt plaintext. Returns `nonce(12) || ciphertext_with_tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| StorageError::Crypto {
            message: format!("cipher init failed: {e}"),
        })?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StorageError::Crypto {
                message: format!("encryption failed: {e}"),
            })?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`SecretKey::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, StorageError> {
        if blob.len() < NONCE_LEN + 16 {
            return Err(StorageError::Crypto {
                message: "ciphertext too short".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| StorageError::Crypto {
            message: format!("cipher init failed: {e}"),
        })?;
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| StorageError::Crypto {
                message: format!("decryption failed: {e}"),
            })
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SecretKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encrypt_decrypt() {
        let key = SecretKey::from_secret("test-secret");
        let plaintext = b"{\"password\":\"hunter2\"}";

        let blob = key.encrypt(plaintext).unwrap();
        let decrypted = key.decrypt(&blob).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key1 = SecretKey::from_secret("secret-one");
        let key2 = SecretKey::from_secret("secret-two");

        let blob = key1.encrypt(b"credentials").unwrap();
        assert!(key2.decrypt(&blob).is_err());
    }

    #[test]
    fn corrupt_ciphertext_fails() {
        let key = SecretKey::from_secret("test-secret");
        let mut blob = key.encrypt(b"credentials").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(key.decrypt(&blob).is_err());
    }

    #[test]
    fn short_blob_fails() {
        let key = SecretKey::from_secret("test-secret");
        assert!(key.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn same_secret_same_key() {
        let key1 = SecretKey::from_secret("stable");
        let key2 = SecretKey::from_secret("stable");
        let blob = key1.encrypt(b"data").unwrap();
        assert_eq!(key2.decrypt(&blob).unwrap(), b"data");
    }

    #[test]
    fn debug_does_not_leak_key() {
        let key = SecretKey::from_secret("super-secret");
        assert_eq!(format!("{key:?}"), "SecretKey(..)");
    }
}
