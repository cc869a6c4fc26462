//! Write-only metrics sink.
//!
//! Scheduling decisions never read metrics back; the sink only records.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

pub const DISPATCH_FAILURES: &str = "dispatch_failures_total";
pub const JOBS_DISPATCHED: &str = "jobs_dispatched_total";
pub const RESULTS_APPLIED: &str = "results_applied_total";
pub const RESULTS_REJECTED: &str = "results_rejected_total";
pub const JOBS_TIMED_OUT: &str = "jobs_timed_out_total";
pub const ADMISSION_BLOCKED: &str = "admission_blocked";
pub const DISPATCH_BATCH_SIZE: &str = "dispatch_batch_size";

pub type Labels<'a> = &'a [(&'static str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>);

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Emits every sample as a `debug!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

fn render(labels: Labels<'_>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

impl MetricsSink for TracingMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>) {
        debug!(metric = name, labels = %render(labels), "counter += 1");
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        debug!(metric = name, labels = %render(labels), value, "gauge set");
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        debug!(metric = name, labels = %render(labels), value, "observed");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: Labels<'_>) {}

    fn set_gauge(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}

    fn observe(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
}

/// Keeps the latest values in memory, keyed by `name{labels}`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
}

fn key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        name.to_string()
    } else {
        format!("{name}{{{}}}", render(labels))
    }
}

impl InMemoryMetrics {
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(name, labels))
            .copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>) {
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key(name, labels))
            .or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key(name, labels), value);
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.set_gauge(name, labels, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters_are_keyed_by_labels() {
        let metrics = InMemoryMetrics::default();
        metrics.increment_counter(DISPATCH_FAILURES, &[("cause", "credential")]);
        metrics.increment_counter(DISPATCH_FAILURES, &[("cause", "credential")]);
        metrics.increment_counter(DISPATCH_FAILURES, &[("cause", "transport")]);

        assert_eq!(metrics.counter(DISPATCH_FAILURES, &[("cause", "credential")]), 2);
        assert_eq!(metrics.counter(DISPATCH_FAILURES, &[("cause", "transport")]), 1);
        assert_eq!(metrics.counter(RESULTS_REJECTED, &[]), 0);
    }

    #[test]
    fn test_gauge_keeps_latest_value() {
        let metrics = InMemoryMetrics::default();
        metrics.set_gauge(ADMISSION_BLOCKED, &[("reason", "max_queued")], 1.0);
        metrics.set_gauge(ADMISSION_BLOCKED, &[("reason", "max_queued")], 0.0);
        assert_eq!(
            metrics.gauge(ADMISSION_BLOCKED, &[("reason", "max_queued")]),
            Some(0.0)
        );
    }
}
