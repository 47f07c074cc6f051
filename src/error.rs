//! Error taxonomy.
//!
//! Freshness-check failures (TTL, source mtime, dependency mtime) are not
//! represented here: the engine recovers from them locally and reports a
//! miss, per the propagation policy in the design doc.

use thiserror::Error;

/// All error kinds the engine can surface to a caller.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Malformed key, value, or TTL passed to a public operation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A supplied `CacheConfig` failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The item would not fit even after evicting the entire LRU tail.
    #[error("memory limit exceeded: need {needed} bytes, have {available} available")]
    MemoryLimitExceeded {
        /// Bytes the insertion would have required.
        needed: u64,
        /// Bytes actually available under `max_memory`.
        available: u64,
    },

    /// The entry-count cap cannot be satisfied even after eviction.
    #[error("cache full: {max_entries} entry cap reached")]
    CacheFull {
        /// Configured maximum entry count.
        max_entries: usize,
    },

    /// Reserved for explicit-check APIs; `get` returns a miss instead.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Reserved for explicit-check APIs; `get` returns a miss instead.
    #[error("entry expired: {0}")]
    EntryExpired(String),

    /// A caller-supplied version could not be reconciled with the stored
    /// version history for a key.
    #[error("version conflict for {key}: {detail}")]
    VersionConflict {
        /// Base key in conflict.
        key: String,
        /// Human-readable detail.
        detail: String,
    },

    /// A registered dependency changed in a way the caller's options did not
    /// anticipate.
    #[error("dependency changed: {0}")]
    DependencyChanged(String),

    /// Reserved: the engine mutex discipline makes this unreachable in
    /// practice, but the variant exists for parity with the source taxonomy.
    #[error("lock acquisition failed: {0}")]
    LockAcquisitionFailed(String),

    /// Reserved: not expected under the mutex discipline (§5).
    #[error("concurrent modification detected: {0}")]
    ConcurrentModification(String),

    /// Access control denied the operation.
    #[error("access denied: {operation} on {key}")]
    AccessDenied {
        /// The operation that was denied (`get`, `set`, `delete`, `clear`).
        operation: &'static str,
        /// The key the operation targeted.
        key: String,
    },

    /// Encryption or decryption of a value failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// A file-system operation (stat or watcher registration) failed in a
    /// way that escaped the engine's "tolerate and log" handling.
    #[error("file system error: {0}")]
    FileSystem(#[from] std::io::Error),

    /// An operation exceeded its caller-imposed deadline. The engine itself
    /// never times out; this is surfaced by wrapper helpers in [`crate::retry`].
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Catch-all for conditions that do not fit another variant, including
    /// decrypt failures surfaced from `get` and loader panics.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CacheError {
    /// Wraps an arbitrary loader/decrypt failure with context, matching the
    /// source's `UNKNOWN_ERROR` wrapping convention.
    pub fn unknown(context: impl Into<String>) -> Self {
        CacheError::Unknown(context.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
