//! In-process metrics registry.
//!
//! Counters, gauges, and timing aggregates behind a mutex-protected map,
//! with labelled variants keyed as `name{label}`. The registry is created
//! at manager construction and consulted by tests, the status surface, and
//! the HTTP endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Metric names used across the core.
pub mod names {
    pub const FILES_DISCOVERED: &str = "files_discovered";
    pub const FILES_EXISTING: &str = "files_existing";

    pub const CYCLES_RUN: &str = "cycles_run";
    pub const DUE_PICKED: &str = "due_picked";
    pub const HANDLER_ERRORS: &str = "handler_errors";
    pub const BACKOFF_APPLIED: &str = "backoff_applied";

    pub const INTEGRITY_PASS: &str = "integrity_pass";
    pub const INTEGRITY_FAIL: &str = "integrity_fail";
    pub const INTEGRITY_ERROR: &str = "integrity_error";

    pub const SKIPPED_EN2: &str = "skipped_en2";
    pub const READY_FOR_CONVERSION: &str = "ready_for_conversion";
    pub const NO_SUITABLE_AUDIO: &str = "no_suitable_audio";

    pub const CONVERSIONS_DONE: &str = "conversions_done";
    pub const CONVERSIONS_FAILED: &str = "conversions_failed";

    pub const GROUPS_PROCESSED: &str = "groups_processed";
    pub const ENTRIES_PRUNED: &str = "entries_pruned";
    pub const STORE_ERRORS: &str = "store_errors";

    pub const HANDLER_MS: &str = "handler_ms";
    pub const TICK_MS: &str = "tick_ms";
}

/// Aggregate of observed durations for one timing metric.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TimingSummary {
    pub count: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

impl TimingSummary {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// Point-in-time copy of the whole registry, JSON-serializable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub timings: BTreeMap<String, TimingSummary>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    timings: BTreeMap<String, TimingSummary>,
}

/// Process-wide metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

/// Shared handle used across planner, manager, and server.
pub type SharedMetrics = Arc<Metrics>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(Metrics::default())
}

impl Metrics {
    pub fn inc(&self, name: &str) {
        self.inc_by(name, 1);
    }

    pub fn inc_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Labelled counter, keyed as `name{label}`.
    pub fn inc_labeled(&self, name: &str, label: &str) {
        self.inc_by(&format!("{}{{{}}}", name, label), 1);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.gauges.insert(name.to_string(), value);
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.inner.lock().unwrap().gauges.get(name).copied()
    }

    pub fn observe_ms(&self, name: &str, ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        let t = inner.timings.entry(name.to_string()).or_default();
        t.count += 1;
        t.total_ms += ms;
        if ms > t.max_ms {
            t.max_ms = ms;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            timings: inner.timings.clone(),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.clear();
        inner.gauges.clear();
        inner.timings.clear();
    }
}

/// Refreshes system-level gauges (CPU, memory) on the registry.
pub fn collect_system_gauges(metrics: &Metrics) {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64) * 100.0
    } else {
        0.0
    };

    metrics.set_gauge("cpu_usage_percent", sys.global_cpu_usage() as f64);
    metrics.set_gauge("mem_usage_percent", mem_usage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::default();
        assert_eq!(m.counter(names::CYCLES_RUN), 0);

        m.inc(names::CYCLES_RUN);
        m.inc(names::CYCLES_RUN);
        m.inc_by(names::DUE_PICKED, 5);

        assert_eq!(m.counter(names::CYCLES_RUN), 2);
        assert_eq!(m.counter(names::DUE_PICKED), 5);
    }

    #[test]
    fn test_labeled_counters_are_distinct() {
        let m = Metrics::default();
        m.inc_labeled("outcome", "integrity_complete");
        m.inc_labeled("outcome", "integrity_complete");
        m.inc_labeled("outcome", "skipped_has_en2");

        assert_eq!(m.counter("outcome{integrity_complete}"), 2);
        assert_eq!(m.counter("outcome{skipped_has_en2}"), 1);
        assert_eq!(m.counter("outcome"), 0);
    }

    #[test]
    fn test_gauges_overwrite() {
        let m = Metrics::default();
        m.set_gauge("cpu_usage_percent", 12.5);
        m.set_gauge("cpu_usage_percent", 80.0);
        assert_eq!(m.gauge("cpu_usage_percent"), Some(80.0));
        assert_eq!(m.gauge("missing"), None);
    }

    #[test]
    fn test_timings_aggregate() {
        let m = Metrics::default();
        m.observe_ms(names::HANDLER_MS, 10.0);
        m.observe_ms(names::HANDLER_MS, 30.0);
        m.observe_ms(names::HANDLER_MS, 20.0);

        let snap = m.snapshot();
        let t = snap.timings.get(names::HANDLER_MS).unwrap();
        assert_eq!(t.count, 3);
        assert_eq!(t.total_ms, 60.0);
        assert_eq!(t.max_ms, 30.0);
        assert_eq!(t.avg_ms(), 20.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let m = Metrics::default();
        m.inc(names::CYCLES_RUN);
        m.set_gauge("g", 1.0);
        m.observe_ms("t", 5.0);

        m.reset();
        let snap = m.snapshot();
        assert!(snap.counters.is_empty());
        assert!(snap.gauges.is_empty());
        assert!(snap.timings.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_snapshot_round_trips_through_json(
            increments in prop::collection::vec((0usize..5, 1u64..100), 0..20),
            observations in prop::collection::vec(0.0f64..10_000.0, 0..20),
        ) {
            let name_pool = ["a", "b", "c", "d", "e"];
            let m = Metrics::default();
            for (idx, delta) in increments {
                m.inc_by(name_pool[idx], delta);
            }
            for ms in observations {
                m.observe_ms("t", ms);
            }

            let snap = m.snapshot();
            let json = serde_json::to_string(&snap).expect("serialize");
            let back: MetricsSnapshot = serde_json::from_str(&json).expect("deserialize");
            prop_assert_eq!(snap, back);
        }
    }
}
