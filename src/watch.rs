//! Dependency graph and file watcher registry (spec §4.2).
//!
//! `registerWatchers` iterates `[sourceFile] + dependencies`, opening a
//! platform watcher per not-yet-watched path whose callback invalidates that
//! path's dependents. The watcher itself survives invalidation — other keys
//! may later register against the same path — only the dependent set for
//! that path is cleared.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

/// Reverse index from watched path to the effective keys that depend on it.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Records that `effective_key` depends on `path`.
    pub fn add(&mut self, path: &str, effective_key: &str) {
        self.dependents.entry(path.to_string()).or_default().insert(effective_key.to_string());
    }

    /// Removes `effective_key` from every path's dependent set, e.g. when the
    /// entry is deleted directly (explicit delete, TTL sweep, eviction).
    pub fn forget_key(&mut self, effective_key: &str) {
        for set in self.dependents.values_mut() {
            set.remove(effective_key);
        }
    }

    /// Returns and clears the dependent set for `path` (the watcher event
    /// handler calls this, then deletes each returned key).
    pub fn take_dependents(&mut self, path: &str) -> HashSet<String> {
        self.dependents.remove(path).unwrap_or_default()
    }

    pub fn is_watched(&self, path: &str) -> bool {
        self.dependents.contains_key(path)
    }
}

/// Owns per-path platform watchers. Watchers are never exposed to callers;
/// closing one is idempotent.
#[derive(Default)]
pub struct FileWatcherRegistry {
    watchers: HashMap<String, RecommendedWatcher>,
}

impl std::fmt::Debug for FileWatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcherRegistry")
            .field("watched_paths", &self.watchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FileWatcherRegistry {
    pub fn new() -> Self {
        FileWatcherRegistry::default()
    }

    pub fn is_watching(&self, path: &str) -> bool {
        self.watchers.contains_key(path)
    }

    /// Starts watching `path`, sending its name on `on_modified` whenever the
    /// platform reports a modification. A no-op returning `false` if `path`
    /// is already watched. Registration failures are tolerated per §7: the
    /// entry remains cached and falls back to TTL/explicit stat checks.
    pub fn watch(&mut self, path: &str, on_modified: mpsc::UnboundedSender<String>) -> bool {
        if self.watchers.contains_key(path) {
            return false;
        }
        let watched_path = path.to_string();
        let make_watcher = || -> notify::Result<RecommendedWatcher> {
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                match res {
                    Ok(event) if matches!(event.kind, EventKind::Modify(_)) => {
                        let _ = on_modified.send(watched_path.clone());
                    }
                    Ok(_) => {}
                    Err(e) => warn!(path = %watched_path, error = %e, "file watcher reported an error"),
                }
            })?;
            watcher.watch(Path::new(path), RecursiveMode::NonRecursive)?;
            Ok(watcher)
        };
        match make_watcher() {
            Ok(watcher) => {
                self.watchers.insert(path.to_string(), watcher);
                true
            }
            Err(e) => {
                warn!(path, error = %e, "failed to register file watcher; falling back to stat-based freshness checks");
                false
            }
        }
    }

    /// Stops watching `path`. Idempotent: returns `false` if it wasn't watched.
    pub fn unwatch(&mut self, path: &str) -> bool {
        self.watchers.remove(path).is_some()
    }

    pub fn clear(&mut self) {
        self.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_graph_tracks_and_clears() {
        let mut g = DependencyGraph::new();
        g.add("f.txt", "doc@1");
        g.add("f.txt", "doc@2");
        assert!(g.is_watched("f.txt"));
        let dependents = g.take_dependents("f.txt");
        assert_eq!(dependents.len(), 2);
        assert!(!g.is_watched("f.txt"));
    }

    #[test]
    fn forget_key_removes_from_all_paths() {
        let mut g = DependencyGraph::new();
        g.add("a.txt", "k");
        g.add("b.txt", "k");
        g.forget_key("k");
        assert!(g.take_dependents("a.txt").is_empty());
        assert!(g.take_dependents("b.txt").is_empty());
    }

    #[test]
    fn watch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dep.txt");
        std::fs::write(&path, b"v1").unwrap();
        let mut reg = FileWatcherRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let path_str = path.to_string_lossy().to_string();
        assert!(reg.watch(&path_str, tx.clone()));
        assert!(!reg.watch(&path_str, tx));
        assert!(reg.unwatch(&path_str));
        assert!(!reg.unwatch(&path_str));
    }
}
