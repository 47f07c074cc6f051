//! The engine: the composed façade holding the map, statistics, timers, and
//! the mutex that serializes all structural operations (spec §2, §4.1, §5).
//!
//! All public operations acquire [`Engine`]'s single `tokio::sync::Mutex`
//! before touching the map, LRU list, dependency graph, null-value cache, or
//! stats — that mutex is the "fair FIFO" primitive spec §5 requires, and it
//! is what makes every invariant in spec §3 hold between any two operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::access::{AccessController, Operation};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, PressureThresholds};
use crate::crypto::Encryptor;
use crate::entry::{base_key, belongs_to_base, content_hash, effective_key, Entry, StoredValue};
use crate::error::{CacheError, Result};
use crate::list::{List, NodeRef};
use crate::negative::NullValueCache;
use crate::singleflight::{LoadOutcome, SingleFlightRegistry};
use crate::size::SizeEstimator;
use crate::stats::{PressureLevel, Stats, StatsSnapshot};
use crate::value::Value;
use crate::watch::{DependencyGraph, FileWatcherRegistry};

/// Options accepted by [`Engine::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Caller-supplied version tag. Only consulted in version-aware mode; if
    /// absent there, the engine derives one from the current timestamp.
    pub version: Option<String>,
    /// External files whose modification invalidates this entry.
    pub dependencies: Vec<String>,
    /// Primary producing file; its mtime is stamped at insertion and
    /// re-checked on every `get`.
    pub source_file: Option<String>,
}

/// Options accepted by [`Engine::get`] (and the batch/protected variants).
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Explicit version to resolve, in version-aware mode. `None` triggers
    /// latest-version resolution.
    pub version: Option<String>,
    /// Whether to stat `dependencies` and invalidate on a newer mtime.
    /// Defaults to `version_aware_mode` when unset.
    pub validate_dependencies: Option<bool>,
}

/// One `set` spec inside a [`Engine::set_many`] batch.
#[derive(Debug, Clone)]
pub struct SetItem {
    pub key: String,
    pub value: Value,
    pub ttl_seconds: Option<u64>,
    pub options: SetOptions,
}

/// Outcome of [`Engine::force_gc`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GcOutcome {
    pub freed_bytes: u64,
    pub duration: Duration,
    pub entries_removed: usize,
}

/// Partial update accepted by [`Engine::set_memory_pressure_thresholds`];
/// unset fields keep their current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PressureThresholdUpdate {
    pub low: Option<f64>,
    pub medium: Option<f64>,
    pub high: Option<f64>,
    pub critical: Option<f64>,
}

const FULL_GC_INTERVAL_MILLIS: u64 = 600_000;
const RECALIBRATION_INTERVAL_MILLIS: u64 = 1_000;
const RECALIBRATION_DRIFT_BYTES: u64 = 1024 * 1024;
const SMART_EVICTION_TARGET_FRACTION: f64 = 0.20;
const AGGRESSIVE_EVICTION_TARGET_FRACTION: f64 = 0.40;

struct StoredEntry {
    entry: Entry,
    node: NodeRef<String>,
}

/// Everything protected by the engine's single mutex (spec §5: "the map,
/// LRU, stats, dependency graph, and null-value cache are all protected by
/// the engine mutex. Hot-key counters and the single-flight registry share
/// the same protection.").
struct EngineState {
    map: HashMap<String, StoredEntry>,
    lru: List<String>,
    dependency_graph: DependencyGraph,
    null_cache: NullValueCache,
    single_flight: SingleFlightRegistry,
    watchers: FileWatcherRegistry,
    stats: Stats,
    pressure_thresholds: PressureThresholds,
    last_gc: u64,
    last_full_gc: u64,
    last_recalibration: u64,
}

impl EngineState {
    fn usage_fraction(&self, max_memory: u64) -> f64 {
        self.stats.memory_usage as f64 / max_memory as f64
    }

    /// Unlinks and drops an entry by effective key, wherever it came from
    /// (explicit delete, TTL sweep, capacity eviction, watcher invalidation,
    /// version cleanup). Does not consult access control: spec §4.2 calls
    /// this "internal delete that skips access control".
    fn remove_entry(&mut self, key: &str) -> Option<Entry> {
        let stored = self.map.remove(key)?;
        self.lru.remove(stored.node);
        self.stats.memory_usage = self.stats.memory_usage.saturating_sub(stored.entry.size);
        self.dependency_graph.forget_key(key);
        Some(stored.entry)
    }

    fn latest_version_key(&self, base: &str) -> Option<String> {
        self.map
            .iter()
            .filter(|(k, _)| belongs_to_base(k, base))
            .max_by_key(|(_, v)| v.entry.created)
            .map(|(k, _)| k.clone())
    }

    /// Evicts from the LRU tail while `predicate` still holds, for capacity
    /// enforcement (spec §4.1 `set`/`setMany`). Returns total bytes freed.
    /// `pop_back` already unlinks the node, so this removes the map entry
    /// directly rather than going through `remove_entry` (which would also
    /// try to unlink an already-detached node).
    fn evict_while(&mut self, mut predicate: impl FnMut(&EngineState) -> bool) -> u64 {
        let mut freed = 0u64;
        while predicate(self) {
            let Some(key) = self.lru.pop_back() else { break };
            match self.map.remove(&key) {
                Some(stored) => {
                    self.stats.memory_usage = self.stats.memory_usage.saturating_sub(stored.entry.size);
                    self.dependency_graph.forget_key(&key);
                    freed += stored.entry.size;
                }
                None => break,
            }
        }
        freed
    }
}

/// The composed façade: map, LRU, dependency graph, null cache,
/// single-flight registry, stats, and the mutex serializing all of it.
pub struct Engine {
    state: Mutex<EngineState>,
    clock: Arc<dyn Clock>,
    encryptor: Option<Encryptor>,
    access: AccessController,
    size_estimator: SizeEstimator,
    config: CacheConfig,
    watch_tx: mpsc::UnboundedSender<String>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds an engine backed by the real wall clock, with background TTL
    /// sweep, GC, and stats-recalibration tasks running.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        Self::build(config, Arc::new(SystemClock), true)
    }

    /// Builds an engine with an injected [`Clock`] and no background
    /// periodic tasks, for deterministic tests that drive TTL/GC by calling
    /// [`Engine::force_gc`] / [`Engine::maybe_gc`] explicitly instead of
    /// waiting on real time.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        Self::build(config, clock, false)
    }

    fn build(config: CacheConfig, clock: Arc<dyn Clock>, spawn_background: bool) -> Result<Arc<Self>> {
        config.validate()?;
        let encryptor = if config.encryption_enabled {
            let key = config
                .encryption_key
                .as_deref()
                .ok_or_else(|| CacheError::Configuration("encryption_key required".into()))?;
            Some(Encryptor::from_hex_key(key, &config.sensitive_patterns)?)
        } else {
            None
        };
        let access = match &config.access_control {
            Some(ac) => {
                let (controller, errs) = AccessController::new(
                    ac.allowed_operations.iter().cloned(),
                    ac.restricted_keys.iter().cloned(),
                    &ac.restricted_patterns,
                );
                for e in errs {
                    warn!(error = %e, "access control configuration problem");
                }
                controller
            }
            None => AccessController::permissive(),
        };
        let size_estimator = SizeEstimator::new(config.max_size_for_precise_bytes);
        let now = clock.now_millis();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let state = Mutex::new(EngineState {
            map: HashMap::new(),
            lru: List::new(),
            dependency_graph: DependencyGraph::new(),
            null_cache: NullValueCache::new(),
            single_flight: SingleFlightRegistry::new(),
            watchers: FileWatcherRegistry::new(),
            stats: Stats::default(),
            pressure_thresholds: config.pressure_thresholds,
            last_gc: now,
            last_full_gc: now,
            last_recalibration: now,
        });
        let engine = Arc::new(Engine {
            state,
            clock,
            encryptor,
            access,
            size_estimator,
            config,
            watch_tx,
            background: Mutex::new(Vec::new()),
        });

        let watcher_engine = Arc::clone(&engine);
        let watch_handle = tokio::spawn(watcher_engine.run_watch_processor(watch_rx));

        let mut handles = vec![watch_handle];
        if spawn_background {
            let maintenance_engine = Arc::clone(&engine);
            handles.push(tokio::spawn(maintenance_engine.run_maintenance_loop()));
            let stats_engine = Arc::clone(&engine);
            handles.push(tokio::spawn(stats_engine.run_stats_loop()));
        }
        // `background` was just constructed empty; `try_lock` cannot fail.
        *engine.background.try_lock().expect("engine freshly constructed") = handles;

        Ok(engine)
    }

    fn effective_access_key<'a>(&self, key: &'a str) -> &'a str {
        base_key(key)
    }

    // ---- set -----------------------------------------------------------

    /// Inserts or replaces `key`. See spec §4.1.
    pub async fn set(
        self: &Arc<Self>,
        key: &str,
        value: Value,
        ttl_seconds: Option<u64>,
        options: SetOptions,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidInput("key must not be empty".into()));
        }
        let base = self.effective_access_key(key);
        if !self.access.check(Operation::Set, base) {
            return Err(CacheError::AccessDenied { operation: "set", key: key.to_string() });
        }
        let ttl_seconds = ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        if ttl_seconds == 0 {
            return Err(CacheError::InvalidInput("ttl_seconds must be >= 1".into()));
        }

        // stat(sourceFile) is a suspension point performed before acquiring
        // the lock (spec §5); registering watchers happens later, outside
        // the critical section entirely.
        let file_timestamp = match &options.source_file {
            Some(path) => Some(stat_mtime_millis(path).await?),
            None => None,
        };

        let now = self.clock.now_millis();
        let version = if self.config.version_aware_mode {
            Some(options.version.clone().unwrap_or_else(|| now.to_string()))
        } else {
            None
        };
        let eff_key = match &version {
            Some(v) => effective_key(key, v),
            None => key.to_string(),
        };

        let sensitive = self.encryptor.as_ref().map(|e| e.is_sensitive(key, &value)).unwrap_or(false);
        let hash = content_hash(&value);
        let (stored_value, size, encrypted) = if sensitive {
            let encryptor = self.encryptor.as_ref().expect("sensitive implies encryptor configured");
            let record = encryptor.encrypt(&value)?;
            let size = SizeEstimator::estimate_cipher(&eff_key, &record);
            (StoredValue::Encrypted(record), size, true)
        } else {
            let size = self.size_estimator.estimate(&eff_key, &value, self.config.precise_memory_calculation);
            (StoredValue::Plain(value), size, false)
        };

        if size > self.config.max_memory {
            return Err(CacheError::MemoryLimitExceeded { needed: size, available: self.config.max_memory });
        }

        let entry = Entry {
            value: stored_value,
            created: now,
            last_accessed: now,
            ttl_seconds,
            size,
            encrypted,
            version,
            hash: Some(hash),
            dependencies: options.dependencies.clone(),
            source_file: options.source_file.clone(),
            file_timestamp,
            access_count: 0,
        };

        {
            let mut state = self.state.lock().await;
            let replacing = state.map.contains_key(&eff_key);
            if replacing {
                state.remove_entry(&eff_key);
            }
            let max_entries = self.config.max_entries;
            let max_memory = self.config.max_memory;
            state.evict_while(|s| {
                s.stats.memory_usage.saturating_add(size) > max_memory
                    || s.map.len().saturating_add(1) > max_entries
            });
            if state.stats.memory_usage.saturating_add(size) > max_memory
                || state.map.len().saturating_add(1) > max_entries
            {
                // Unreachable in practice once `size <= max_memory` and
                // `max_entries >= 1` (both guaranteed above/by config
                // validation); kept as a defensive, non-mutating failure.
                return Err(CacheError::MemoryLimitExceeded { needed: size, available: max_memory });
            }
            let node = state.lru.push_front(eff_key.clone());
            state.stats.memory_usage = state.stats.memory_usage.saturating_add(size);
            state.map.insert(eff_key.clone(), StoredEntry { entry, node });
        }

        if options.source_file.is_some() && !options.dependencies.is_empty() {
            let engine = Arc::clone(self);
            let eff = eff_key.clone();
            let source_file = options.source_file.clone();
            let deps = options.dependencies.clone();
            tokio::spawn(async move { engine.register_watchers(eff, source_file, deps).await });
        }
        if self.config.version_aware_mode {
            let engine = Arc::clone(self);
            let base = key.to_string();
            tokio::spawn(async move { engine.prune_old_versions(base).await });
        }

        Ok(())
    }

    async fn register_watchers(self: Arc<Self>, effective_key: String, source_file: Option<String>, dependencies: Vec<String>) {
        let mut paths = Vec::with_capacity(dependencies.len() + 1);
        paths.extend(source_file);
        paths.extend(dependencies);
        let mut state = self.state.lock().await;
        for path in paths {
            state.dependency_graph.add(&path, &effective_key);
            if !state.watchers.is_watching(&path) {
                state.watchers.watch(&path, self.watch_tx.clone());
            }
        }
    }

    async fn prune_old_versions(self: Arc<Self>, base: String) {
        let mut state = self.state.lock().await;
        let mut versions: Vec<(String, u64)> = state
            .map
            .iter()
            .filter(|(k, _)| belongs_to_base(k, &base))
            .map(|(k, v)| (k.clone(), v.entry.created))
            .collect();
        versions.sort_by_key(|(_, created)| *created);
        if versions.len() > 2 {
            for (k, _) in &versions[..versions.len() - 2] {
                state.remove_entry(k);
            }
        }
    }

    async fn run_watch_processor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(path) = rx.recv().await {
            let mut state = self.state.lock().await;
            let dependents = state.dependency_graph.take_dependents(&path);
            debug!(path, dependents = dependents.len(), "invalidating dependents of modified path");
            for key in dependents {
                state.remove_entry(&key);
            }
        }
    }

    // ---- get -------------------------------------------------------------

    /// Reads `key`. See spec §4.1.
    pub async fn get(self: &Arc<Self>, key: &str, options: GetOptions) -> Result<Option<Value>> {
        let started = Instant::now();
        let base = self.effective_access_key(key);
        if !self.access.check(Operation::Get, base) {
            return Err(CacheError::AccessDenied { operation: "get", key: key.to_string() });
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let result = self.get_locked(&mut state, key, &options, now).await?;
        let access_millis = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Some(_) => state.stats.record_hit(access_millis),
            None => state.stats.record_miss(),
        }
        Ok(result)
    }

    /// Shared implementation of a single lookup, assuming the caller already
    /// holds `state`'s lock. Used by `get`, `get_many`, and
    /// `get_with_protection`'s initial probe.
    async fn get_locked(
        self: &Arc<Self>,
        state: &mut EngineState,
        key: &str,
        options: &GetOptions,
        now: u64,
    ) -> Result<Option<Value>> {
        let eff_key = if self.config.version_aware_mode {
            match &options.version {
                Some(v) => effective_key(key, v),
                None => match state.latest_version_key(key) {
                    Some(k) => k,
                    None => return Ok(None),
                },
            }
        } else {
            key.to_string()
        };

        // Extract the fields freshness checks need into owned values up
        // front, so this immutable borrow of `state.map` ends immediately
        // rather than staying alive across the later `&mut state` calls
        // (removal) and `.await` points (stat) below.
        let (created, ttl_seconds, source_file, file_timestamp, dependencies) = match state.map.get(&eff_key) {
            Some(stored) => (
                stored.entry.created,
                stored.entry.ttl_seconds,
                stored.entry.source_file.clone(),
                stored.entry.file_timestamp,
                stored.entry.dependencies.clone(),
            ),
            None => return Ok(None),
        };

        if now > created.saturating_add(ttl_seconds.saturating_mul(1000)) {
            trace!(key = %eff_key, "ttl expired");
            state.remove_entry(&eff_key);
            return Ok(None);
        }

        if let (Some(source_file), Some(file_timestamp)) = (&source_file, file_timestamp) {
            match stat_mtime_millis(source_file).await {
                Ok(mtime) if mtime <= file_timestamp => {}
                _ => {
                    trace!(key = %eff_key, "source file missing or newer than insertion-time mtime");
                    state.remove_entry(&eff_key);
                    return Ok(None);
                }
            }
        }

        let validate_deps = options.validate_dependencies.unwrap_or(self.config.version_aware_mode);
        if validate_deps && !dependencies.is_empty() {
            let mut stale = false;
            for dep in &dependencies {
                match stat_mtime_millis(dep).await {
                    Ok(mtime) if mtime <= created => {}
                    _ => {
                        stale = true;
                        break;
                    }
                }
            }
            if stale {
                trace!(key = %eff_key, "dependency changed since insertion");
                state.remove_entry(&eff_key);
                return Ok(None);
            }
        }

        let stored = state.map.get_mut(&eff_key).expect("just validated presence above");
        stored.entry.last_accessed = now;
        stored.entry.access_count += 1;
        let node = stored.node;
        let value = match &stored.entry.value {
            StoredValue::Plain(v) => v.clone(),
            StoredValue::Encrypted(record) => {
                let encryptor = self
                    .encryptor
                    .as_ref()
                    .ok_or_else(|| CacheError::unknown("entry is encrypted but no encryptor configured"))?;
                encryptor.decrypt(record).map_err(|e| CacheError::unknown(e.to_string()))?
            }
        };
        state.lru.touch(node);
        state.stats.touch_hot_key(base_key(key), now);
        Ok(Some(value))
    }

    // ---- delete / clear ----------------------------------------------------

    /// Removes `key` if present. Operates on the literal key exactly as
    /// given (no latest-version resolution) — version cleanup and
    /// watcher-driven invalidation already cover the versioned-key paths;
    /// see `DESIGN.md` for the rationale.
    pub async fn delete(self: &Arc<Self>, key: &str) -> Result<bool> {
        if !self.access.check(Operation::Delete, self.effective_access_key(key)) {
            return Err(CacheError::AccessDenied { operation: "delete", key: key.to_string() });
        }
        let mut state = self.state.lock().await;
        Ok(state.remove_entry(key).is_some())
    }

    /// Drops all entries and resets live *and* historical counters (spec
    /// §4.1: "Persistent historical counters ... are also reset by this
    /// operation."). Watchers are left running; `destroy()` is the one that
    /// tears those down.
    pub async fn clear(self: &Arc<Self>) -> Result<()> {
        if !self.access.check(Operation::Clear, "") {
            return Err(CacheError::AccessDenied { operation: "clear", key: String::new() });
        }
        let mut state = self.state.lock().await;
        state.map.clear();
        state.lru.clear();
        state.dependency_graph = DependencyGraph::new();
        state.stats.reset();
        Ok(())
    }

    // ---- batch operations ------------------------------------------------

    /// Inserts every item, pre-checking and proactively evicting for the
    /// batch's total estimated size; items that still would not fit land in
    /// `failed` without mutating the cache (spec §4.1 `setMany`).
    pub async fn set_many(self: &Arc<Self>, items: Vec<SetItem>) -> (Vec<String>, Vec<(String, String)>) {
        let total_estimate: u64 = items
            .iter()
            .map(|item| SizeEstimator::fast_value_size(&item.value) + crate::size::METADATA_OVERHEAD)
            .sum();
        {
            let mut state = self.state.lock().await;
            let max_memory = self.config.max_memory;
            state.evict_while(|s| {
                s.stats.memory_usage.saturating_add(total_estimate) > max_memory && !s.map.is_empty()
            });
        }

        let mut success = Vec::with_capacity(items.len());
        let mut failed = Vec::new();
        for item in items {
            match self.set(&item.key, item.value, item.ttl_seconds, item.options).await {
                Ok(()) => success.push(item.key),
                Err(e) => failed.push((item.key, e.to_string())),
            }
        }
        (success, failed)
    }

    /// Looks up every key under a single lock acquisition (spec §4.1
    /// `getMany`).
    pub async fn get_many(
        self: &Arc<Self>,
        keys: Vec<String>,
        options: GetOptions,
    ) -> (Vec<(String, Value)>, Vec<String>) {
        let now = self.clock.now_millis();
        let mut found = Vec::new();
        let mut missing = Vec::new();
        let mut state = self.state.lock().await;
        for key in keys {
            if !self.access.check(Operation::Get, self.effective_access_key(&key)) {
                missing.push(key);
                continue;
            }
            let started = Instant::now();
            match self.get_locked(&mut state, &key, &options, now).await {
                Ok(Some(value)) => {
                    state.stats.record_hit(started.elapsed().as_secs_f64() * 1000.0);
                    found.push((key, value));
                }
                Ok(None) => {
                    state.stats.record_miss();
                    missing.push(key);
                }
                Err(_) => missing.push(key),
            }
        }
        (found, missing)
    }

    /// Deletes every key under a single lock acquisition (spec §4.1
    /// `deleteMany`).
    pub async fn delete_many(self: &Arc<Self>, keys: Vec<String>) -> (Vec<String>, Vec<String>) {
        let mut success = Vec::new();
        let mut failed = Vec::new();
        let mut state = self.state.lock().await;
        for key in keys {
            if !self.access.check(Operation::Delete, self.effective_access_key(&key)) {
                failed.push(key);
                continue;
            }
            if state.remove_entry(&key).is_some() {
                success.push(key);
            } else {
                failed.push(key);
            }
        }
        (success, failed)
    }

    // ---- single-flight + negative cache ----------------------------------

    /// Coalesced, negative-cached load (spec §4.3). The mutex is released
    /// around `loader` itself (design note in spec §5 permits this as long
    /// as the single-flight registry still coalesces concurrent callers and
    /// the cache is re-checked on entry, which the initial `self.get` call
    /// above provides).
    pub async fn get_with_protection<F, Fut, E>(
        self: &Arc<Self>,
        key: &str,
        loader: F,
        options: GetOptions,
    ) -> std::result::Result<Option<Value>, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<Value>, E>> + Send + 'static,
        E: std::fmt::Display + From<CacheError> + Send + 'static,
    {
        if let Some(value) = self.get(key, options.clone()).await? {
            return Ok(Some(value));
        }

        let now = self.clock.now_millis();
        let shared = {
            let mut state = self.state.lock().await;
            if state.null_cache.contains_fresh(key, now) {
                return Ok(None);
            }
            match state.single_flight.join(key) {
                Some(shared) => shared,
                None => {
                    let fut = self.clone().run_loader(key.to_string(), loader);
                    state.single_flight.register(key.to_string(), fut)
                }
            }
        };

        let outcome: LoadOutcome = shared.await;
        {
            let mut state = self.state.lock().await;
            state.single_flight.deregister(key);
        }
        outcome.map_err(|msg| E::from(CacheError::unknown(msg)))
    }

    /// Runs the caller's loader outside the engine lock, then (double-check)
    /// fast-path inserts a returned value or records a negative-cache entry,
    /// per the three outcomes in spec §4.3.
    async fn run_loader<F, Fut, E>(self: Arc<Self>, key: String, loader: F) -> LoadOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<Value>, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        match loader().await {
            Ok(Some(value)) => {
                self.insert_from_loader(&key, value.clone()).await;
                Ok(Some(value))
            }
            Ok(None) => {
                let now = self.clock.now_millis();
                let mut state = self.state.lock().await;
                state.null_cache.insert(key, now, self.config.null_value_ttl_seconds * 1000);
                Ok(None)
            }
            Err(e) => {
                let now = self.clock.now_millis();
                let mut state = self.state.lock().await;
                state.null_cache.insert(key, now, self.config.loader_error_ttl_seconds * 1000);
                Err(e.to_string())
            }
        }
    }

    /// Internal fast-path set used by `get_with_protection`: no access
    /// control, reusing the adaptive size estimator, with a double-check
    /// that skips the insert if a concurrent writer already populated the
    /// key (spec §4.3).
    async fn insert_from_loader(self: &Arc<Self>, key: &str, value: Value) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        if state.map.contains_key(key) {
            return;
        }
        let size = self.size_estimator.estimate(key, &value, self.config.precise_memory_calculation);
        if size > self.config.max_memory {
            warn!(key, size, "loader result too large to cache; returning without caching");
            return;
        }
        let max_entries = self.config.max_entries;
        let max_memory = self.config.max_memory;
        state.evict_while(|s| {
            s.stats.memory_usage.saturating_add(size) > max_memory || s.map.len().saturating_add(1) > max_entries
        });
        let entry = Entry {
            value: StoredValue::Plain(value),
            created: now,
            last_accessed: now,
            ttl_seconds: self.config.default_ttl_seconds,
            size,
            encrypted: false,
            version: None,
            hash: None,
            dependencies: Vec::new(),
            source_file: None,
            file_timestamp: None,
            access_count: 0,
        };
        let node = state.lru.push_front(key.to_string());
        state.stats.memory_usage = state.stats.memory_usage.saturating_add(size);
        state.map.insert(key.to_string(), StoredEntry { entry, node });
    }

    // ---- stats / pressure / GC --------------------------------------------

    /// Point-in-time snapshot, per spec §6 `getStats`.
    pub async fn stats(self: &Arc<Self>) -> StatsSnapshot {
        let state = self.state.lock().await;
        state.stats.snapshot(state.map.len())
    }

    /// Current memory-pressure level.
    pub async fn pressure_level(self: &Arc<Self>) -> PressureLevel {
        let state = self.state.lock().await;
        PressureLevel::classify(state.usage_fraction(self.config.max_memory), &state.pressure_thresholds)
    }

    /// Updates the memory-pressure thresholds used by the GC pacing state
    /// machine; unset fields keep their current value.
    pub async fn set_memory_pressure_thresholds(self: &Arc<Self>, update: PressureThresholdUpdate) {
        let mut state = self.state.lock().await;
        if let Some(v) = update.low {
            state.pressure_thresholds.low = v;
        }
        if let Some(v) = update.medium {
            state.pressure_thresholds.medium = v;
        }
        if let Some(v) = update.high {
            state.pressure_thresholds.high = v;
        }
        if let Some(v) = update.critical {
            state.pressure_thresholds.critical = v;
        }
    }

    /// Registers a file watcher for `path`, optionally tying it to `key` as
    /// a dependent (spec §6 `setupFileWatcher`). Returns whether a new
    /// watcher was actually created.
    pub async fn setup_file_watcher(self: &Arc<Self>, path: &str, key: Option<&str>) -> bool {
        let mut state = self.state.lock().await;
        if let Some(key) = key {
            state.dependency_graph.add(path, key);
        }
        if state.watchers.is_watching(path) {
            return false;
        }
        state.watchers.watch(path, self.watch_tx.clone())
    }

    /// Stops watching `path` (spec §6 `stopFileWatcher`). Idempotent.
    pub async fn stop_file_watcher(self: &Arc<Self>, path: &str) -> bool {
        let mut state = self.state.lock().await;
        state.watchers.unwatch(path)
    }

    /// Runs a GC cycle unconditionally, ignoring the pressure-dependent
    /// cool-down `maybe_gc` otherwise enforces (spec §6 `forceGC`).
    pub async fn force_gc(self: &Arc<Self>, aggressive: bool) -> GcOutcome {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let pressure = PressureLevel::classify(state.usage_fraction(self.config.max_memory), &state.pressure_thresholds);
        let started = Instant::now();
        let before_count = state.map.len();
        let mut freed = self.expired_sweep(&mut state, now);
        freed += self.smart_eviction(&mut state, now, pressure, aggressive);
        if aggressive {
            freed += self.aggressive_eviction(&mut state);
        }
        self.auxiliary_cleanup(&mut state, now);
        state.last_gc = now;
        let entries_removed = before_count - state.map.len();
        GcOutcome { freed_bytes: freed, duration: started.elapsed(), entries_removed }
    }

    /// Runs a smart or full GC cycle if the pressure-dependent cool-down (or
    /// the 600s full-GC ceiling) has elapsed (spec §4.1 "GC pacing").
    pub async fn maybe_gc(self: &Arc<Self>, now: u64) -> GcOutcome {
        let mut state = self.state.lock().await;
        let pressure = PressureLevel::classify(state.usage_fraction(self.config.max_memory), &state.pressure_thresholds);
        let force_full = now.saturating_sub(state.last_full_gc) >= FULL_GC_INTERVAL_MILLIS;
        if !force_full && now.saturating_sub(state.last_gc) < pressure.gc_cooldown_millis() {
            return GcOutcome::default();
        }
        let started = Instant::now();
        let before_count = state.map.len();
        let mut freed = self.expired_sweep(&mut state, now);
        if force_full {
            self.auxiliary_cleanup(&mut state, now);
            self.recalibrate(&mut state, now);
            self.rebuild_lru(&mut state);
            state.last_full_gc = now;
        } else {
            freed += self.smart_eviction(&mut state, now, pressure, false);
            if pressure == PressureLevel::Critical {
                freed += self.aggressive_eviction(&mut state);
            }
            self.auxiliary_cleanup(&mut state, now);
        }
        state.last_gc = now;
        let entries_removed = before_count - state.map.len();
        GcOutcome { freed_bytes: freed, duration: started.elapsed(), entries_removed }
    }

    fn expired_sweep(&self, state: &mut EngineState, now: u64) -> u64 {
        let expired: Vec<String> = state
            .map
            .iter()
            .filter(|(_, v)| v.entry.is_ttl_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut freed = 0;
        for key in expired {
            if let Some(entry) = state.remove_entry(&key) {
                freed += entry.size;
            }
        }
        freed
    }

    /// Phase 2 of the smart GC cycle (spec §4.1): evicts ascending weight
    /// until ~20% of `memoryUsage` is freed. Only runs at HIGH/CRITICAL
    /// pressure, unless `force` (used by `forceGC`).
    fn smart_eviction(&self, state: &mut EngineState, now: u64, pressure: PressureLevel, force: bool) -> u64 {
        if !force && pressure < PressureLevel::High {
            return 0;
        }
        let target = (state.stats.memory_usage as f64 * SMART_EVICTION_TARGET_FRACTION) as u64;
        if target == 0 {
            return 0;
        }
        let mut weighted: Vec<(String, f64)> =
            state.map.iter().map(|(k, v)| (k.clone(), eviction_weight(&v.entry, now))).collect();
        weighted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut freed = 0u64;
        for (key, _) in weighted {
            if freed >= target {
                break;
            }
            if let Some(entry) = state.remove_entry(&key) {
                freed += entry.size;
            }
        }
        freed
    }

    /// Phase 3 of the smart GC cycle: evict largest entries first until
    /// ~40% is freed. Only runs at CRITICAL pressure, unless `forceGC`'s
    /// `aggressive` flag asked for it directly.
    fn aggressive_eviction(&self, state: &mut EngineState) -> u64 {
        let target = (state.stats.memory_usage as f64 * AGGRESSIVE_EVICTION_TARGET_FRACTION) as u64;
        if target == 0 {
            return 0;
        }
        let mut by_size: Vec<(String, u64)> = state.map.iter().map(|(k, v)| (k.clone(), v.entry.size)).collect();
        by_size.sort_by(|a, b| b.1.cmp(&a.1));
        let mut freed = 0u64;
        for (key, _) in by_size {
            if freed >= target {
                break;
            }
            if let Some(entry) = state.remove_entry(&key) {
                freed += entry.size;
            }
        }
        freed
    }

    /// Phase 4: drop hot-key counters untouched for 24h and sweep expired
    /// null-value cache entries.
    fn auxiliary_cleanup(&self, state: &mut EngineState, now: u64) {
        state.stats.sweep_stale_hot_keys(now);
        state.null_cache.sweep_expired(now);
    }

    /// Recomputes `memoryUsage` exactly from the map, repairing any drift
    /// accumulated between incremental updates (spec §3 invariant 2).
    fn recalibrate(&self, state: &mut EngineState, now: u64) {
        let exact: u64 = state.map.values().map(|v| v.entry.size).sum();
        if exact.abs_diff(state.stats.memory_usage) > 0 {
            debug!(
                drift = state.stats.memory_usage.abs_diff(exact),
                "recalibrating memory usage"
            );
        }
        state.stats.memory_usage = exact;
        state.last_recalibration = now;
    }

    /// Rebuilds the LRU list ordered by descending `lastAccessed`, repairing
    /// any prior bookkeeping drift (spec §4.1 full GC cycle).
    fn rebuild_lru(&self, state: &mut EngineState) {
        let mut by_recency: Vec<(String, u64)> =
            state.map.iter().map(|(k, v)| (k.clone(), v.entry.last_accessed)).collect();
        by_recency.sort_by(|a, b| b.1.cmp(&a.1));
        state.lru.clear();
        for (key, _) in by_recency {
            if let Some(stored) = state.map.get_mut(&key) {
                stored.node = state.lru.push_front(key.clone());
            }
        }
    }

    async fn run_maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.check_interval_millis.max(1)));
        loop {
            interval.tick().await;
            let now = self.clock.now_millis();
            self.maybe_gc(now).await;
        }
    }

    async fn run_stats_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.stats_interval_millis.max(1)));
        loop {
            interval.tick().await;
            let now = self.clock.now_millis();
            let mut state = self.state.lock().await;
            if now.saturating_sub(state.last_recalibration) >= RECALIBRATION_INTERVAL_MILLIS
                || drifted_beyond(&state, RECALIBRATION_DRIFT_BYTES)
            {
                self.recalibrate(&mut state, now);
            }
        }
    }

    /// Stops background periodic tasks, closes every watcher, and clears
    /// all state (spec §5 `destroy()`).
    pub async fn destroy(self: &Arc<Self>) {
        let mut handles = self.background.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        drop(handles);
        let mut state = self.state.lock().await;
        state.watchers.clear();
        state.map.clear();
        state.lru.clear();
        state.dependency_graph = DependencyGraph::new();
        state.null_cache = NullValueCache::new();
        state.single_flight = SingleFlightRegistry::new();
    }
}

fn drifted_beyond(state: &EngineState, tolerance: u64) -> bool {
    let exact: u64 = state.map.values().map(|v| v.entry.size).sum();
    exact.abs_diff(state.stats.memory_usage) > tolerance
}

/// `0.4*time_recency + 0.4*frequency + 0.2*size_inverse` (spec §4.1).
fn eviction_weight(entry: &Entry, now: u64) -> f64 {
    let time_recency = (1.0 - (now.saturating_sub(entry.last_accessed) as f64) / 86_400_000.0).max(0.0);
    let frequency = (((entry.access_count + 1) as f64).ln() / 10.0).min(1.0);
    let size_inverse = (1.0 - entry.size as f64 / 1_048_576.0).max(0.0);
    0.4 * time_recency + 0.4 * frequency + 0.2 * size_inverse
}

/// Stats a path's mtime in milliseconds since the epoch. An unreadable path
/// (or one whose mtime is unavailable on this platform) surfaces as
/// `CacheError::FileSystem`; freshness checks in `get_locked` treat that the
/// same as a newer mtime, per §7's "watcher/stat failure treated as
/// invalidation, not a user-visible error" for the read path. `set`'s
/// `sourceFile` stamping propagates the error instead, since a caller asking
/// to track a file that cannot be stat'd at insertion time is a mistake
/// worth surfacing.
async fn stat_mtime_millis(path: &str) -> Result<u64> {
    let metadata = tokio::fs::metadata(path).await?;
    let modified = metadata.modified()?;
    let millis = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(millis)
}
