//! Routing statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Snapshot of routing counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    /// Every routing call, including cache hits and fallbacks
    pub total_routes: u64,
    /// Computed decisions per matched rule (`"default"` included)
    pub rule_matches: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Running average decision time over computed decisions
    pub avg_route_time_ms: f64,
    /// Calls that failed and returned the default route
    pub fallbacks: u64,
}

/// Mutable counters behind a lock
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    stats: Mutex<RouteStats>,
}

impl StatsRecorder {
    pub(crate) fn record_hit(&self) {
        let mut stats = self.lock();
        stats.total_routes += 1;
        stats.cache_hits += 1;
    }

    pub(crate) fn record_miss(&self, rule: &str, decision_time_ms: f64) {
        let mut stats = self.lock();
        stats.total_routes += 1;
        stats.cache_misses += 1;
        *stats.rule_matches.entry(rule.to_string()).or_insert(0) += 1;

        let n = stats.cache_misses as f64;
        stats.avg_route_time_ms = (stats.avg_route_time_ms * (n - 1.0) + decision_time_ms) / n;
    }

    pub(crate) fn record_fallback(&self) {
        let mut stats = self.lock();
        stats.total_routes += 1;
        stats.fallbacks += 1;
    }

    pub(crate) fn snapshot(&self) -> RouteStats {
        self.lock().clone()
    }

    pub(crate) fn reset(&self) {
        *self.lock() = RouteStats::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouteStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_do_not_touch_rule_counts() {
        let recorder = StatsRecorder::default();
        recorder.record_miss("high", 2.0);
        recorder.record_hit();
        recorder.record_hit();

        let stats = recorder.snapshot();
        assert_eq!(stats.total_routes, 3);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.rule_matches.get("high"), Some(&1));
    }

    #[test]
    fn test_running_average_over_misses() {
        let recorder = StatsRecorder::default();
        recorder.record_miss("a", 2.0);
        recorder.record_hit();
        recorder.record_miss("default", 4.0);
        recorder.record_miss("a", 6.0);

        let stats = recorder.snapshot();
        assert!((stats.avg_route_time_ms - 4.0).abs() < 1e-9);
        assert_eq!(stats.rule_matches.get("a"), Some(&2));
        assert_eq!(stats.rule_matches.get("default"), Some(&1));
    }

    #[test]
    fn test_fallback_and_reset() {
        let recorder = StatsRecorder::default();
        recorder.record_fallback();

        let stats = recorder.snapshot();
        assert_eq!(stats.total_routes, 1);
        assert_eq!(stats.fallbacks, 1);
        assert!(stats.rule_matches.is_empty());

        recorder.reset();
        assert_eq!(recorder.snapshot(), RouteStats::default());
    }
}
