//! Symmetric-encrypted at-rest credential store (§4.B).
//!
//! The source system uses Fernet (SHA-256 of a process secret, URL-safe
//! base64 encoded, as the key material) for authenticated symmetric
//! encryption. Fernet itself has no mainstream Rust crate; this module
//! derives the key identically (SHA-256 digest, round-tripped through
//! URL-safe base64 as the wire-visible key representation per §6) and uses
//! it with AES-256-GCM, an AEAD cipher with the same security property
//! (authenticated confidentiality under a process-derived key) without
//! hand-rolling Fernet's token framing. See `DESIGN.md` for the rationale.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credentials missing for user {0}")]
    Missing(String),
    #[error("failed to encrypt credential payload")]
    EncryptionFailed,
    #[error("failed to decrypt credential payload (key rotated or data corrupted)")]
    DecryptionFailed,
    #[error("failed to serialize credential payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Plaintext OAuth credential record. Only held in memory long enough for
/// the caller to issue one outbound request (§3 "Credential" ownership).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub provider_account_id: Option<String>,
    pub provider_account_email: Option<String>,
}

struct EncryptedRecord {
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

/// Derive the 32-byte AES-256-GCM key from the process-wide secret:
/// SHA-256 digest, round-tripped through URL-safe base64 (§4.B, §6).
pub fn derive_key(process_secret: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(process_secret);
    let encoded = URL_SAFE.encode(digest);
    let decoded = URL_SAFE
        .decode(encoded.as_bytes())
        .expect("round-tripping our own base64 encoding cannot fail");
    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded[..32]);
    key
}

/// Process-wide encrypted credential store, keyed by user id.
pub struct CredentialStore {
    cipher: Aes256Gcm,
    records: DashMap<String, EncryptedRecord>,
}

impl CredentialStore {
    pub fn new(process_secret: &[u8]) -> Self {
        let key = derive_key(process_secret);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self {
            cipher,
            records: DashMap::new(),
        }
    }

    fn encrypt(&self, record: &CredentialRecord) -> Result<EncryptedRecord, CredentialError> {
        let plaintext = serde_json::to_vec(record)?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| CredentialError::EncryptionFailed)?;
        Ok(EncryptedRecord {
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    fn decrypt(&self, encrypted: &EncryptedRecord) -> Result<CredentialRecord, CredentialError> {
        let nonce = Nonce::from_slice(&encrypted.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, encrypted.ciphertext.as_ref())
            .map_err(|_| CredentialError::DecryptionFailed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store_oauth_token(
        &self,
        user: &str,
        access_token: String,
        refresh_token: Option<String>,
        expiry: Option<DateTime<Utc>>,
        scopes: Vec<String>,
        provider_account_id: Option<String>,
        provider_account_email: Option<String>,
    ) -> Result<(), CredentialError> {
        let record = CredentialRecord {
            access_token,
            refresh_token,
            expiry,
            scopes,
            provider_account_id,
            provider_account_email,
        };
        let encrypted = self.encrypt(&record)?;
        self.records.insert(user.to_string(), encrypted);
        Ok(())
    }

    pub fn get_credentials(&self, user: &str) -> Result<CredentialRecord, CredentialError> {
        let encrypted = self
            .records
            .get(user)
            .ok_or_else(|| CredentialError::Missing(user.to_string()))?;
        self.decrypt(&encrypted)
    }

    pub fn get_access_token(&self, user: &str) -> Result<String, CredentialError> {
        self.get_credentials(user).map(|record| record.access_token)
    }

    pub fn delete_credentials(&self, user: &str) {
        self.records.remove(user);
    }

    pub fn has_credentials(&self, user: &str) -> bool {
        self.records.contains_key(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_is_deterministic() {
        let a = derive_key(b"process-secret");
        let b = derive_key(b"process-secret");
        assert_eq!(a, b);
        let c = derive_key(b"different-secret");
        assert_ne!(a, c);
    }

    #[test]
    fn store_then_get_round_trips_plaintext() {
        let store = CredentialStore::new(b"secret");
        store
            .store_oauth_token(
                "user-1",
                "access-123".to_string(),
                Some("refresh-456".to_string()),
                None,
                vec!["repo".to_string()],
                Some("acct-1".to_string()),
                Some("acct@example.com".to_string()),
            )
            .unwrap();

        let record = store.get_credentials("user-1").unwrap();
        assert_eq!(record.access_token, "access-123");
        assert_eq!(record.refresh_token.as_deref(), Some("refresh-456"));
        assert_eq!(store.get_access_token("user-1").unwrap(), "access-123");
    }

    #[test]
    fn missing_user_surfaces_distinct_error() {
        let store = CredentialStore::new(b"secret");
        let err = store.get_credentials("ghost").unwrap_err();
        assert!(matches!(err, CredentialError::Missing(_)));
        assert!(!store.has_credentials("ghost"));
    }

    #[test]
    fn delete_removes_credentials() {
        let store = CredentialStore::new(b"secret");
        store
            .store_oauth_token("user-1", "tok".to_string(), None, None, vec![], None, None)
            .unwrap();
        assert!(store.has_credentials("user-1"));
        store.delete_credentials("user-1");
        assert!(!store.has_credentials("user-1"));
    }

    #[test]
    fn different_keys_cannot_decrypt_each_others_data() {
        let store_a = CredentialStore::new(b"secret-a");
        store_a
            .store_oauth_token("user-1", "tok".to_string(), None, None, vec![], None, None)
            .unwrap();
        let store_b = CredentialStore::new(b"secret-b");
        // Simulate store_b trying to read store_a's ciphertext directly.
        let encrypted = store_a.records.get("user-1").unwrap();
        assert!(store_b.decrypt(&encrypted).is_err());
    }
}
