//! Engine-level encryption and access-control behavior.
//!
//! [`src/crypto.rs`] and [`src/access.rs`] already unit-test the primitives
//! in isolation; these tests cover the engine wiring them together (opaque
//! transparent decryption on `get`, and operation/key-level denial).

use std::sync::Arc;

use mcp_cache_core::clock::ManualClock;
use mcp_cache_core::{AccessControlConfig, CacheConfig, CacheError, Engine, GetOptions, SetOptions};
use serde_json::json;

fn encrypted_config() -> CacheConfig {
    CacheConfig {
        encryption_enabled: true,
        encryption_key: Some("ab".repeat(32)),
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn sensitive_values_round_trip_transparently() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(encrypted_config(), clock).unwrap();

    engine.set("user_password", json!("hunter2"), Some(60), SetOptions::default()).await.unwrap();
    let value = engine.get("user_password", GetOptions::default()).await.unwrap();
    assert_eq!(value, Some(json!("hunter2")));
}

#[tokio::test]
async fn non_sensitive_values_are_stored_plain() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(encrypted_config(), clock).unwrap();

    engine.set("username", json!("alice"), Some(60), SetOptions::default()).await.unwrap();
    assert_eq!(engine.get("username", GetOptions::default()).await.unwrap(), Some(json!("alice")));
}

#[tokio::test]
async fn access_control_denies_disallowed_operation() {
    let clock = Arc::new(ManualClock::new(0));
    let mut cfg = CacheConfig::default();
    cfg.access_control = Some(AccessControlConfig {
        allowed_operations: vec!["get".into()],
        restricted_keys: Vec::new(),
        restricted_patterns: Vec::new(),
    });
    let engine = Engine::with_clock(cfg, clock).unwrap();

    let err = engine.set("k", json!(1), Some(60), SetOptions::default()).await.unwrap_err();
    assert!(matches!(err, CacheError::AccessDenied { operation: "set", .. }));
}

#[tokio::test]
async fn access_control_denies_restricted_key_pattern() {
    let clock = Arc::new(ManualClock::new(0));
    let mut cfg = CacheConfig::default();
    cfg.access_control = Some(AccessControlConfig {
        allowed_operations: vec!["get".into(), "set".into()],
        restricted_keys: Vec::new(),
        restricted_patterns: vec!["^admin_.*".into()],
    });
    let engine = Engine::with_clock(cfg, clock).unwrap();

    let err = engine.set("admin_users", json!(1), Some(60), SetOptions::default()).await.unwrap_err();
    assert!(matches!(err, CacheError::AccessDenied { .. }));
    engine.set("public_users", json!(1), Some(60), SetOptions::default()).await.unwrap();
}
