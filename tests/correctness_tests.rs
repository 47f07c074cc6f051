//! End-to-end correctness tests for the engine.
//!
//! Each test drives [`Engine::with_clock`] with a [`ManualClock`] so TTL and
//! GC behavior is deterministic: time only moves when a test calls
//! `clock.advance(...)`, and garbage collection only runs when a test calls
//! `force_gc`/`maybe_gc` explicitly rather than waiting on a background
//! timer.

use std::sync::Arc;

use mcp_cache_core::{CacheConfig, Engine, GetOptions, SetItem, SetOptions};
use serde_json::json;

use mcp_cache_core::clock::ManualClock;

fn config(max_entries: usize, max_memory: u64) -> CacheConfig {
    CacheConfig { max_entries, max_memory, ..CacheConfig::default() }
}

#[tokio::test]
async fn basic_ttl_expiry() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(100, 1_000_000), clock.clone()).unwrap();

    engine.set("greeting", json!("hello"), Some(1), SetOptions::default()).await.unwrap();
    assert_eq!(engine.get("greeting", GetOptions::default()).await.unwrap(), Some(json!("hello")));

    clock.advance(1_500);
    assert_eq!(engine.get("greeting", GetOptions::default()).await.unwrap(), None);
}

#[tokio::test]
async fn lru_evicts_least_recently_used_under_count_cap() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(2, 1_000_000), clock.clone()).unwrap();

    engine.set("a", json!(1), Some(3600), SetOptions::default()).await.unwrap();
    engine.set("b", json!(2), Some(3600), SetOptions::default()).await.unwrap();
    // touch "a" so "b" becomes the least recently used entry
    assert_eq!(engine.get("a", GetOptions::default()).await.unwrap(), Some(json!(1)));

    engine.set("c", json!(3), Some(3600), SetOptions::default()).await.unwrap();

    assert_eq!(engine.get("b", GetOptions::default()).await.unwrap(), None);
    assert_eq!(engine.get("a", GetOptions::default()).await.unwrap(), Some(json!(1)));
    assert_eq!(engine.get("c", GetOptions::default()).await.unwrap(), Some(json!(3)));
}

#[tokio::test]
async fn set_rejects_a_value_larger_than_max_memory() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(100, 64), clock).unwrap();

    let big = json!("x".repeat(10_000));
    let err = engine.set("oversized", big, Some(60), SetOptions::default()).await.unwrap_err();
    assert!(matches!(err, mcp_cache_core::CacheError::MemoryLimitExceeded { .. }));
    assert_eq!(engine.stats().await.total_entries, 0);
}

#[tokio::test]
async fn version_aware_mode_resolves_latest_version() {
    let clock = Arc::new(ManualClock::new(0));
    let mut cfg = config(100, 1_000_000);
    cfg.version_aware_mode = true;
    let engine = Engine::with_clock(cfg, clock.clone()).unwrap();

    engine
        .set("doc", json!("v1"), Some(3600), SetOptions { version: Some("1".into()), ..Default::default() })
        .await
        .unwrap();
    clock.advance(10);
    engine
        .set("doc", json!("v2"), Some(3600), SetOptions { version: Some("2".into()), ..Default::default() })
        .await
        .unwrap();

    assert_eq!(engine.get("doc", GetOptions::default()).await.unwrap(), Some(json!("v2")));
    assert_eq!(
        engine.get("doc", GetOptions { version: Some("1".into()), ..Default::default() }).await.unwrap(),
        Some(json!("v1"))
    );
}

#[tokio::test]
async fn dependency_change_invalidates_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let dep_path = dir.path().join("dep.txt");
    std::fs::write(&dep_path, b"v1").unwrap();
    let dep = dep_path.to_string_lossy().to_string();

    // The clock must start near real wall-clock time: `get`'s freshness check
    // compares the dependency's real filesystem mtime against `created`, so a
    // clock starting at 0 would make every dependency look newer than the
    // entry regardless of whether it was actually touched again.
    let start = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let clock = Arc::new(ManualClock::new(start));
    let engine = Engine::with_clock(config(100, 1_000_000), clock.clone()).unwrap();

    engine
        .set(
            "report",
            json!("stale-free"),
            Some(3600),
            SetOptions { dependencies: vec![dep.clone()], ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(engine.get("report", GetOptions::default()).await.unwrap(), Some(json!("stale-free")));

    // the dependency's mtime must move past the entry's insertion time
    clock.advance(2_000);
    std::fs::write(&dep_path, b"v2").unwrap();

    let opts = GetOptions { validate_dependencies: Some(true), ..Default::default() };
    assert_eq!(engine.get("report", opts).await.unwrap(), None);
}

#[tokio::test]
async fn single_flight_coalesces_concurrent_loaders() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(100, 1_000_000), clock).unwrap();
    let call_count = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let call_count = Arc::clone(&call_count);
        handles.push(tokio::spawn(async move {
            engine
                .get_with_protection::<_, _, mcp_cache_core::CacheError>(
                    "expensive",
                    move || {
                        let call_count = Arc::clone(&call_count);
                        async move {
                            call_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Some(json!("computed")))
                        }
                    },
                    GetOptions::default(),
                )
                .await
        }));
    }

    for h in handles {
        assert_eq!(h.await.unwrap().unwrap(), Some(json!("computed")));
    }
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn negative_cache_short_circuits_repeated_absent_loads() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(100, 1_000_000), clock).unwrap();
    let call_count = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let call_count = Arc::clone(&call_count);
        let result = engine
            .get_with_protection::<_, _, mcp_cache_core::CacheError>(
                "missing",
                move || {
                    let call_count = Arc::clone(&call_count);
                    async move {
                        call_count.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                },
                GetOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    assert_eq!(call_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_operations_report_per_item_outcomes() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(100, 1_000_000), clock).unwrap();

    let items = vec![
        SetItem { key: "a".into(), value: json!(1), ttl_seconds: Some(60), options: SetOptions::default() },
        SetItem { key: "b".into(), value: json!(2), ttl_seconds: Some(60), options: SetOptions::default() },
    ];
    let (success, failed) = engine.set_many(items).await;
    assert_eq!(success.len(), 2);
    assert!(failed.is_empty());

    let (found, missing) = engine.get_many(vec!["a".into(), "b".into(), "c".into()], GetOptions::default()).await;
    assert_eq!(found.len(), 2);
    assert_eq!(missing, vec!["c".to_string()]);

    let (deleted, not_deleted) = engine.delete_many(vec!["a".into(), "z".into()]).await;
    assert_eq!(deleted, vec!["a".to_string()]);
    assert_eq!(not_deleted, vec!["z".to_string()]);
}

#[tokio::test]
async fn force_gc_removes_expired_entries_and_reports_freed_bytes() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(100, 1_000_000), clock.clone()).unwrap();

    engine.set("short", json!("a"), Some(1), SetOptions::default()).await.unwrap();
    engine.set("long", json!("b"), Some(3600), SetOptions::default()).await.unwrap();

    clock.advance(1_500);
    let outcome = engine.force_gc(false).await;
    assert_eq!(outcome.entries_removed, 1);
    assert_eq!(engine.get("short", GetOptions::default()).await.unwrap(), None);
    assert_eq!(engine.get("long", GetOptions::default()).await.unwrap(), Some(json!("b")));
}

#[tokio::test]
async fn clear_resets_live_and_historical_stats() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::with_clock(config(100, 1_000_000), clock).unwrap();

    engine.set("a", json!(1), Some(60), SetOptions::default()).await.unwrap();
    let _ = engine.get("a", GetOptions::default()).await.unwrap();
    let _ = engine.get("missing", GetOptions::default()).await.unwrap();

    engine.clear().await.unwrap();

    let snapshot = engine.stats().await;
    assert_eq!(snapshot.total_entries, 0);
    assert_eq!(snapshot.hits, 0);
    assert_eq!(snapshot.misses, 0);
}
