//! At-rest encryption for channel credentials and CRM tokens.
//!
//! AES-256-GCM with a key derived per blob from the process secret via
//! Argon2id. Blob layout: `base64(salt ‖ nonce ‖ ciphertext)`, the random
//! salt makes every blob distinct even for identical plaintexts.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as B64, Engine};

use crate::error::{ChasquiError, Result};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Encrypts and decrypts secret strings with a key derived from the
/// process-wide secret. Cheap to clone; holds no derived key material.
#[derive(Clone)]
pub struct SecretStore {
    process_secret: String,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretStore(..)")
    }
}

impl SecretStore {
    /// The process secret is validated non-empty at startup; reject here
    /// too so tests can't construct a store with a blank key.
    pub fn new(process_secret: impl Into<String>) -> Result<Self> {
        let process_secret = process_secret.into();
        if process_secret.trim().is_empty() {
            return Err(ChasquiError::Config(
                "process secret must not be empty".into(),
            ));
        }
        Ok(Self { process_secret })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = self.cipher_for(&salt)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| ChasquiError::Internal("AEAD encryption failed".into()))?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(B64.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let raw = B64
            .decode(blob)
            .map_err(|_| ChasquiError::Validation("secret blob is not valid base64".into()))?;
        if raw.len() < SALT_LEN + NONCE_LEN + 1 {
            return Err(ChasquiError::Validation("secret blob is truncated".into()));
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let cipher = self.cipher_for(salt)?;
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ChasquiError::Auth("secret blob failed authentication".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ChasquiError::Internal("decrypted secret is not UTF-8".into()))
    }

    fn cipher_for(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.process_secret.as_bytes(), salt, &mut key)
            .map_err(|e| ChasquiError::Internal(format!("key derivation failed: {e}")))?;
        Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ChasquiError::Internal("bad derived key length".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::new("unit-test-process-secret").unwrap()
    }

    #[test]
    fn roundtrip_restores_plaintext() {
        let s = store();
        let blob = s.encrypt("EAAGm0PX4ZCpsBO-access-token").unwrap();
        assert_eq!(s.decrypt(&blob).unwrap(), "EAAGm0PX4ZCpsBO-access-token");
    }

    #[test]
    fn blobs_are_salted() {
        let s = store();
        let a = s.encrypt("same").unwrap();
        let b = s.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_fails_closed() {
        let s = store();
        let blob = s.encrypt("secret").unwrap();
        let mut raw = B64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(s.decrypt(&B64.encode(raw)).is_err());
    }

    #[test]
    fn wrong_process_secret_fails() {
        let blob = store().encrypt("secret").unwrap();
        let other = SecretStore::new("a-different-secret").unwrap();
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn empty_process_secret_rejected() {
        assert!(SecretStore::new("   ").is_err());
    }
}
