//! Configuration record consumed from external collaborators (spec §6).
//!
//! Loading this from a file, layering environment overrides, hot-reload,
//! and auto-tuning all remain the named non-goal — this is just the typed
//! record and its validation, the way a production crate still ships a
//! `serde`-backed config struct even when it doesn't own the file I/O.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Access-control portion of [`CacheConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessControlConfig {
    /// Operations permitted at all (`get`, `set`, `delete`, `clear`).
    pub allowed_operations: Vec<String>,
    /// Keys denied regardless of `allowed_operations`.
    pub restricted_keys: Vec<String>,
    /// Regex patterns; a key matching any of these is denied.
    pub restricted_patterns: Vec<String>,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        AccessControlConfig {
            allowed_operations: vec!["get".into(), "set".into(), "delete".into(), "clear".into()],
            restricted_keys: Vec::new(),
            restricted_patterns: Vec::new(),
        }
    }
}

/// Memory-pressure level thresholds, as fractions of `max_memory` in use.
/// Defaults match spec §4.1: `{LOW <= 0.50, MEDIUM <= 0.70, HIGH <= 0.85,
/// CRITICAL <= 0.95}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        PressureThresholds { low: 0.50, medium: 0.70, high: 0.85, critical: 0.95 }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries. Must be positive.
    pub max_entries: usize,
    /// Maximum total size in bytes. Must be positive.
    pub max_memory: u64,
    /// Default TTL in seconds, used when `set` is called without one.
    pub default_ttl_seconds: u64,
    /// How often the TTL/GC sweeper runs, in milliseconds.
    pub check_interval_millis: u64,
    /// How often aggregate stats are recalibrated, in milliseconds.
    pub stats_interval_millis: u64,
    /// Forces the precise size estimator regardless of the adaptive
    /// threshold.
    pub precise_memory_calculation: bool,
    /// Enables `"<base>@<version>"` effective keys and latest-version
    /// resolution.
    pub version_aware_mode: bool,
    /// Enables opportunistic AES-256-GCM encryption of sensitive values.
    pub encryption_enabled: bool,
    /// 64-character hex AES-256 key, required when `encryption_enabled`.
    pub encryption_key: Option<String>,
    /// Extra sensitivity patterns, merged with the built-in set.
    pub sensitive_patterns: Vec<String>,
    /// Access-control policy. `None` means every operation on every key is
    /// allowed.
    pub access_control: Option<AccessControlConfig>,
    /// Memory-pressure level thresholds.
    pub pressure_thresholds: PressureThresholds,
    /// TTL applied to negative-cache entries created when a loader resolves
    /// to absent (§4.3). Default 300s.
    pub null_value_ttl_seconds: u64,
    /// TTL applied to negative-cache entries created when a loader throws
    /// (§4.3). Default 60s.
    pub loader_error_ttl_seconds: u64,
    /// Adaptive size-estimator threshold in bytes (§4.4). Default 10 KiB.
    pub max_size_for_precise_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: 10_000,
            max_memory: 100 * 1024 * 1024,
            default_ttl_seconds: 3600,
            check_interval_millis: 60_000,
            stats_interval_millis: 10_000,
            precise_memory_calculation: false,
            version_aware_mode: false,
            encryption_enabled: false,
            encryption_key: None,
            sensitive_patterns: Vec::new(),
            access_control: None,
            pressure_thresholds: PressureThresholds::default(),
            null_value_ttl_seconds: 300,
            loader_error_ttl_seconds: 60,
            max_size_for_precise_bytes: crate::size::DEFAULT_MAX_SIZE_FOR_PRECISE,
        }
    }
}

impl CacheConfig {
    /// Validates the record, returning `CacheError::Configuration` on the
    /// first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Configuration("max_entries must be positive".into()));
        }
        if self.max_memory == 0 {
            return Err(CacheError::Configuration("max_memory must be positive".into()));
        }
        if self.default_ttl_seconds == 0 {
            return Err(CacheError::Configuration("default_ttl_seconds must be positive".into()));
        }
        if self.encryption_enabled {
            match &self.encryption_key {
                Some(k) if k.len() == 64 && k.chars().all(|c| c.is_ascii_hexdigit()) => {}
                _ => {
                    return Err(CacheError::Configuration(
                        "encryption_key must be a 64-character hex string when encryption_enabled"
                            .into(),
                    ))
                }
            }
        }
        let t = &self.pressure_thresholds;
        if !(0.0..=1.0).contains(&t.low)
            || !(0.0..=1.0).contains(&t.medium)
            || !(0.0..=1.0).contains(&t.high)
            || !(0.0..=1.0).contains(&t.critical)
            || !(t.low <= t.medium && t.medium <= t.high && t.high <= t.critical)
        {
            return Err(CacheError::Configuration(
                "pressure_thresholds must be non-decreasing fractions in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_entries_is_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.max_entries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn encryption_requires_valid_hex_key() {
        let mut cfg = CacheConfig::default();
        cfg.encryption_enabled = true;
        assert!(cfg.validate().is_err());
        cfg.encryption_key = Some("zz".repeat(32));
        assert!(cfg.validate().is_err());
        cfg.encryption_key = Some("ab".repeat(32));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = CacheConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_entries, cfg.max_entries);
    }
}
