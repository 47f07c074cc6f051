//! Per-key single-flight registry used to coalesce concurrent misses (spec §4.3).
//!
//! For any key, at most one loader future is registered; concurrent callers
//! clone the same [`futures::future::Shared`] handle and await it rather than
//! re-invoking the loader.

use std::collections::HashMap;
use std::pin::Pin;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::value::Value;

/// What a loader resolves to: a value, absent, or a stringified failure.
/// Errors are carried as `String` (rather than a generic `E`) so the shared
/// future's output is `Clone`, which `Shared` requires to hand the same
/// outcome to every coalescing waiter.
pub type LoadOutcome = Result<Option<Value>, String>;

type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

/// Registry of in-flight loaders, keyed by effective key.
#[derive(Default)]
pub struct SingleFlightRegistry {
    inflight: HashMap<String, SharedLoad>,
}

impl std::fmt::Debug for SingleFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightRegistry")
            .field("inflight_keys", &self.inflight.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SingleFlightRegistry {
    pub fn new() -> Self {
        SingleFlightRegistry::default()
    }

    /// Returns a clone of the in-flight future for `key`, if any.
    pub fn join(&self, key: &str) -> Option<SharedLoad> {
        self.inflight.get(key).cloned()
    }

    /// Registers `fut` as the in-flight loader for `key` and returns a
    /// clone the caller can await immediately.
    pub fn register<F>(&mut self, key: String, fut: F) -> SharedLoad
    where
        F: std::future::Future<Output = LoadOutcome> + Send + 'static,
    {
        let shared: SharedLoad = (Box::pin(fut) as Pin<Box<dyn std::future::Future<Output = LoadOutcome> + Send>>)
            .shared();
        self.inflight.insert(key, shared.clone());
        shared
    }

    /// Removes the in-flight entry for `key`, run unconditionally after the
    /// loader settles (success, absent, or error) so a later miss starts a
    /// fresh load instead of rejoining a finished future.
    pub fn deregister(&mut self, key: &str) {
        self.inflight.remove(key);
    }

    pub fn is_inflight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesces_concurrent_joins() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = SingleFlightRegistry::new();
        let calls_clone = calls.clone();
        let fut = async move {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(Some(serde_json::json!(42)))
        };
        let shared = registry.register("x".to_string(), fut);

        let joiners: Vec<_> = (0..5)
            .map(|_| {
                let f = shared.clone();
                tokio::spawn(async move { f.await })
            })
            .collect();

        for j in joiners {
            let outcome = j.await.unwrap();
            assert_eq!(outcome, Ok(Some(serde_json::json!(42))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        registry.deregister("x");
        assert!(!registry.is_inflight("x"));
    }
}
