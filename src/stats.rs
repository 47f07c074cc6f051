//! Aggregate statistics and the memory-pressure level state machine (spec §3, §4.1).

use std::collections::HashMap;

use crate::config::PressureThresholds;

/// Memory pressure level, driving GC policy. `u = memory_usage / max_memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    /// Classifies `usage_fraction` against `thresholds`.
    pub fn classify(usage_fraction: f64, thresholds: &PressureThresholds) -> Self {
        if usage_fraction <= thresholds.low {
            PressureLevel::Low
        } else if usage_fraction <= thresholds.medium {
            PressureLevel::Medium
        } else if usage_fraction <= thresholds.high {
            PressureLevel::High
        } else {
            PressureLevel::Critical
        }
    }

    /// GC cool-down before another cycle may run at this pressure level,
    /// in milliseconds: `{LOW: 120000, MEDIUM: 30000, HIGH: 15000, CRITICAL: 5000}`.
    pub fn gc_cooldown_millis(self) -> u64 {
        match self {
            PressureLevel::Low => 120_000,
            PressureLevel::Medium => 30_000,
            PressureLevel::High => 15_000,
            PressureLevel::Critical => 5_000,
        }
    }
}

/// A point-in-time snapshot returned by `getStats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub total_entries: usize,
    pub memory_usage: u64,
    pub hit_rate: f64,
    pub average_access_millis: f64,
}

/// Counter tracked per base key, used by the GC's auxiliary cleanup phase
/// (entries untouched for 24h are dropped) and available for "hot key"
/// introspection.
#[derive(Debug, Clone, Copy)]
pub struct HotKeyCounter {
    pub count: u64,
    pub last_touched: u64,
}

/// Mutable aggregate counters, held inside the engine's locked state.
#[derive(Debug, Default)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub memory_usage: u64,
    access_time_samples: u64,
    average_access_millis: f64,
    pub hot_keys: HashMap<String, HotKeyCounter>,
}

const HOT_KEY_RETENTION_MILLIS: u64 = 24 * 60 * 60 * 1000;

impl Stats {
    pub fn record_hit(&mut self, access_millis: f64) {
        self.hits += 1;
        self.access_time_samples += 1;
        // Incremental (Welford-style) moving average; avoids re-summing history.
        self.average_access_millis +=
            (access_millis - self.average_access_millis) / self.access_time_samples as f64;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn touch_hot_key(&mut self, base_key: &str, now: u64) {
        self.hot_keys
            .entry(base_key.to_string())
            .and_modify(|c| {
                c.count += 1;
                c.last_touched = now;
            })
            .or_insert(HotKeyCounter { count: 1, last_touched: now });
    }

    /// Drops hot-key counters untouched for more than 24h (GC auxiliary
    /// cleanup, §4.1 phase 4).
    pub fn sweep_stale_hot_keys(&mut self, now: u64) -> usize {
        let before = self.hot_keys.len();
        self.hot_keys.retain(|_, c| now.saturating_sub(c.last_touched) <= HOT_KEY_RETENTION_MILLIS);
        before - self.hot_keys.len()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self, total_entries: usize) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits,
            misses: self.misses,
            total_entries,
            memory_usage: self.memory_usage,
            hit_rate: self.hit_rate(),
            average_access_millis: self.average_access_millis,
        }
    }

    /// Resets live and historical counters (used by `clear`, per spec §4.1:
    /// "persistent historical counters are also reset by this operation").
    pub fn reset(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.memory_usage = 0;
        self.access_time_samples = 0;
        self.average_access_millis = 0.0;
        self.hot_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_level_classification_matches_spec_defaults() {
        let t = PressureThresholds::default();
        assert_eq!(PressureLevel::classify(0.10, &t), PressureLevel::Low);
        assert_eq!(PressureLevel::classify(0.60, &t), PressureLevel::Medium);
        assert_eq!(PressureLevel::classify(0.80, &t), PressureLevel::High);
        assert_eq!(PressureLevel::classify(0.99, &t), PressureLevel::Critical);
    }

    #[test]
    fn hit_rate_tracks_hits_over_total() {
        let mut s = Stats::default();
        s.record_hit(1.0);
        s.record_hit(1.0);
        s.record_miss();
        assert!((s.hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn stale_hot_keys_are_swept() {
        let mut s = Stats::default();
        s.touch_hot_key("a", 0);
        s.touch_hot_key("b", 100_000);
        let removed = s.sweep_stale_hot_keys(HOT_KEY_RETENTION_MILLIS + 1);
        assert_eq!(removed, 1);
        assert!(s.hot_keys.contains_key("b"));
    }
}
