//! Periodic metrics collector with threshold-based alerting (SPEC_FULL §2
//! "(added) Metrics collector").
//!
//! This is intentionally thin: it is not the alert-rule engine spec.md §1
//! names as an external collaborator, just the ambient observability hook a
//! production crate ships so the engine is not silently opaque. It reads
//! [`Engine::stats`] and [`Engine::pressure_level`] on an interval and logs a
//! `tracing` event when a configured threshold is crossed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::stats::PressureLevel;

/// Thresholds the collector watches for.
#[derive(Debug, Clone, Copy)]
pub struct MetricsThresholds {
    /// Logs a warning when the hit rate drops at or below this fraction
    /// (ignored until at least one hit or miss has been recorded).
    pub hit_rate_floor: f64,
    /// Logs a warning at or above this memory-pressure level.
    pub pressure_alert_level: PressureLevel,
}

impl Default for MetricsThresholds {
    fn default() -> Self {
        MetricsThresholds { hit_rate_floor: 0.5, pressure_alert_level: PressureLevel::High }
    }
}

/// Polls an [`Engine`] on an interval and emits `tracing` events for
/// threshold crossings. Does not install a subscriber — wiring one up is the
/// embedding application's job.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    interval: Duration,
    thresholds: MetricsThresholds,
}

impl MetricsCollector {
    pub fn new(interval: Duration, thresholds: MetricsThresholds) -> Self {
        MetricsCollector { interval, thresholds }
    }

    /// Spawns the polling loop against `engine`, returning a handle the
    /// caller can abort. Runs until aborted; it does not stop itself.
    pub fn spawn(self, engine: Arc<Engine>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let snapshot = engine.stats().await;
                let pressure = engine.pressure_level().await;
                info!(
                    hits = snapshot.hits,
                    misses = snapshot.misses,
                    total_entries = snapshot.total_entries,
                    memory_usage = snapshot.memory_usage,
                    hit_rate = snapshot.hit_rate,
                    ?pressure,
                    "cache metrics tick"
                );
                if snapshot.hits + snapshot.misses > 0 && snapshot.hit_rate <= self.thresholds.hit_rate_floor {
                    warn!(
                        hit_rate = snapshot.hit_rate,
                        floor = self.thresholds.hit_rate_floor,
                        "cache hit rate below configured floor"
                    );
                }
                if pressure >= self.thresholds.pressure_alert_level {
                    warn!(?pressure, "cache memory pressure at or above alert level");
                }
            }
        })
    }
}
