//! The cache entry and versioned-key encoding (spec §3, §4.2).

use crate::crypto::CipherRecord;
use crate::value::Value;

/// The stored form of an entry's payload: either plaintext or, when the
/// encryptor decided the pair was sensitive, an authenticated cipher record.
#[derive(Debug, Clone)]
pub enum StoredValue {
    /// Plaintext payload.
    Plain(Value),
    /// Encrypted payload; opaque until decrypted with the engine's key.
    Encrypted(CipherRecord),
}

/// One cached value and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Plaintext or cipher-record payload.
    pub value: StoredValue,
    /// Insertion time, ms.
    pub created: u64,
    /// Last hit time, ms. Updated on `get`.
    pub last_accessed: u64,
    /// Expiry horizon from `created`, in seconds.
    pub ttl_seconds: u64,
    /// Engine's byte-size estimate of the stored form, used for accounting.
    pub size: u64,
    /// Whether `value` is a cipher record.
    pub encrypted: bool,
    /// Caller-supplied or engine timestamp-derived version tag.
    pub version: Option<String>,
    /// Short hex content fingerprint taken at insertion.
    pub hash: Option<String>,
    /// External files whose modification invalidates this entry.
    pub dependencies: Vec<String>,
    /// Primary producing file, if any.
    pub source_file: Option<String>,
    /// `sourceFile`'s mtime at insertion, ms.
    pub file_timestamp: Option<u64>,
    /// Number of successful `get` hits. Feeds the GC smart-eviction weight
    /// (§4.1); not part of the wire-visible data model but required to
    /// compute `frequency` there.
    pub access_count: u64,
}

impl Entry {
    /// `now > created + ttlSeconds * 1000`.
    pub fn is_ttl_expired(&self, now: u64) -> bool {
        now > self.created.saturating_add(self.ttl_seconds.saturating_mul(1000))
    }
}

/// Short hex content fingerprint for an entry's plaintext value at insertion
/// (`Entry::hash`, spec §3). Not a security primitive, just a cheap
/// fingerprint for cache-debugging/diffing; collisions are acceptable.
pub fn content_hash(value: &Value) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Splits a caller-visible key into its base key, i.e. the substring before
/// the first `@`. Equal to the input when there is no `@`.
pub fn base_key(key: &str) -> &str {
    match key.split_once('@') {
        Some((base, _)) => base,
        None => key,
    }
}

/// Builds the effective (stored) key for version-aware mode: `"<key>@<version>"`.
pub fn effective_key(base: &str, version: &str) -> String {
    format!("{base}@{version}")
}

/// Returns `true` if `effective` is a versioned key belonging to `base`,
/// i.e. starts with `"<base>@"`.
pub fn belongs_to_base(effective: &str, base: &str) -> bool {
    effective
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('@'))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_key_splits_on_first_at() {
        assert_eq!(base_key("doc@1@2"), "doc");
        assert_eq!(base_key("doc"), "doc");
    }

    #[test]
    fn effective_key_roundtrips() {
        let eff = effective_key("doc", "42");
        assert_eq!(eff, "doc@42");
        assert!(belongs_to_base(&eff, "doc"));
        assert!(!belongs_to_base(&eff, "do"));
    }
}
