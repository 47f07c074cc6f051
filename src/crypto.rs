//! Opportunistic encryption of sensitive values (spec §4.5).
//!
//! Uses AES-256-GCM: authenticated symmetric encryption with a fresh random
//! nonce per entry. The cipher key is immutable for the lifetime of the
//! engine instance, so no locking is needed to read it.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::CacheError;
use crate::value::{lowercase_projection, Value};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Built-in sensitivity patterns, matched in addition to any
/// caller-configured set (§4.5).
pub const DEFAULT_SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "token",
    "secret",
    "key",
    "auth",
    "credential",
    "private",
    "confidential",
    "secure",
    "sensitive",
];

/// An opaque authenticated-ciphertext record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherRecord {
    /// Ciphertext bytes (does not include the tag).
    pub data: Vec<u8>,
    /// Random nonce used for this encryption.
    pub iv: Vec<u8>,
    /// Authentication tag, required for decryption.
    pub tag: Vec<u8>,
}

/// Decides sensitivity and performs AES-256-GCM encrypt/decrypt of values.
pub struct Encryptor {
    cipher: Aes256Gcm,
    patterns: Vec<String>,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").field("patterns", &self.patterns).finish_non_exhaustive()
    }
}

impl Encryptor {
    /// Builds an encryptor from a 32-byte key and the caller's extra
    /// sensitivity patterns (merged with [`DEFAULT_SENSITIVE_PATTERNS`]).
    pub fn new(key_bytes: &[u8; 32], extra_patterns: &[String]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        let mut patterns: Vec<String> =
            DEFAULT_SENSITIVE_PATTERNS.iter().map(|s| s.to_string()).collect();
        patterns.extend(extra_patterns.iter().cloned());
        Encryptor { cipher: Aes256Gcm::new(key), patterns }
    }

    /// Parses a 64-character hex key as used in [`crate::config::CacheConfig::encryption_key`].
    pub fn from_hex_key(hex_key: &str, extra_patterns: &[String]) -> crate::error::Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| CacheError::Configuration(format!("invalid encryption key hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CacheError::Configuration("encryption key must be 32 bytes".into()))?;
        Ok(Self::new(&key, extra_patterns))
    }

    /// `sensitive = patternMatch(key, value)`: true if the lowercase key or
    /// the lowercase textual encoding of the value contains any pattern.
    pub fn is_sensitive(&self, key: &str, value: &Value) -> bool {
        let key_lower = key.to_lowercase();
        let value_lower = lowercase_projection(value);
        self.patterns
            .iter()
            .any(|p| key_lower.contains(p.as_str()) || value_lower.contains(p.as_str()))
    }

    /// Encrypts `value`'s JSON encoding.
    pub fn encrypt(&self, value: &Value) -> crate::error::Result<CipherRecord> {
        let plaintext = serde_json::to_vec(value)
            .map_err(|e| CacheError::Encryption(format!("value encode failed: {e}")))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| CacheError::Encryption(format!("aes-gcm seal failed: {e}")))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(CipherRecord { data: sealed, iv: nonce_bytes.to_vec(), tag })
    }

    /// Decrypts a [`CipherRecord`] back into a [`Value`]. Any failure
    /// (bad key, truncated tag, tampered ciphertext) surfaces as
    /// [`CacheError::Encryption`], which the engine wraps as `UNKNOWN_ERROR`
    /// on the `get` path per §7.
    pub fn decrypt(&self, record: &CipherRecord) -> crate::error::Result<Value> {
        if record.iv.len() != NONCE_LEN {
            return Err(CacheError::Encryption("invalid nonce length".into()));
        }
        let nonce = Nonce::from_slice(&record.iv);
        let mut combined = record.data.clone();
        combined.extend_from_slice(&record.tag);
        let plaintext = self
            .cipher
            .decrypt(nonce, combined.as_ref())
            .map_err(|e| CacheError::Encryption(format!("aes-gcm open failed: {e}")))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CacheError::Encryption(format!("value decode failed: {e}")))
    }
}
