/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Metrics Module
//!
//! Prometheus metrics for the operator: reconcile outcomes, external tool
//! latency, object phases, merge queue activity and escalations.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all operator metrics
static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Reconcile counter
/// Labels: kind, result (success/error)
pub fn reconcile_total() -> &'static CounterVec {
    static COUNTER: OnceLock<CounterVec> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let opts = Opts::new("gastown_reconcile_total", "Total number of reconciles");
        let counter = CounterVec::new(opts, &["kind", "result"])
            .expect("Failed to create reconcile counter");
        registry()
            .register(Box::new(counter.clone()))
            .expect("Failed to register reconcile counter");
        counter
    })
}

/// Reconcile error counter
/// Labels: kind, reason (condition reason of the error)
pub fn reconcile_errors_total() -> &'static CounterVec {
    static COUNTER: OnceLock<CounterVec> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let opts = Opts::new(
            "gastown_reconcile_errors_total",
            "Total number of failed reconciles by error reason",
        );
        let counter = CounterVec::new(opts, &["kind", "reason"])
            .expect("Failed to create reconcile error counter");
        registry()
            .register(Box::new(counter.clone()))
            .expect("Failed to register reconcile error counter");
        counter
    })
}

/// Reconcile duration histogram
/// Labels: kind
pub fn reconcile_duration_seconds() -> &'static HistogramVec {
    static HISTOGRAM: OnceLock<HistogramVec> = OnceLock::new();
    HISTOGRAM.get_or_init(|| {
        let opts = HistogramOpts::new(
            "gastown_reconcile_duration_seconds",
            "Reconcile latency distribution in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]);
        let histogram = HistogramVec::new(opts, &["kind"])
            .expect("Failed to create reconcile duration histogram");
        registry()
            .register(Box::new(histogram.clone()))
            .expect("Failed to register reconcile duration histogram");
        histogram
    })
}

/// External tool call duration histogram
/// Labels: tool, result (success/failed/spawn_error/timeout)
pub fn tool_call_duration_seconds() -> &'static HistogramVec {
    static HISTOGRAM: OnceLock<HistogramVec> = OnceLock::new();
    HISTOGRAM.get_or_init(|| {
        let opts = HistogramOpts::new(
            "gastown_tool_call_duration_seconds",
            "External tool call latency distribution in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]);
        let histogram = HistogramVec::new(opts, &["tool", "result"])
            .expect("Failed to create tool call duration histogram");
        registry()
            .register(Box::new(histogram.clone()))
            .expect("Failed to register tool call duration histogram");
        histogram
    })
}

/// Objects per phase, refreshed on every reconcile
/// Labels: kind, phase
pub fn objects_by_phase() -> &'static GaugeVec {
    static GAUGE: OnceLock<GaugeVec> = OnceLock::new();
    GAUGE.get_or_init(|| {
        let opts = Opts::new("gastown_objects_by_phase", "Number of objects in each phase");
        let gauge = GaugeVec::new(opts, &["kind", "phase"])
            .expect("Failed to create objects by phase gauge");
        registry()
            .register(Box::new(gauge.clone()))
            .expect("Failed to register objects by phase gauge");
        gauge
    })
}

/// Merge attempt counter
/// Labels: result (merged/conflict/failed/skipped)
pub fn merge_attempts_total() -> &'static CounterVec {
    static COUNTER: OnceLock<CounterVec> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let opts = Opts::new("gastown_merge_attempts_total", "Total number of merge attempts");
        let counter = CounterVec::new(opts, &["result"])
            .expect("Failed to create merge attempts counter");
        registry()
            .register(Box::new(counter.clone()))
            .expect("Failed to register merge attempts counter");
        counter
    })
}

/// Merge conflict counter
pub fn merge_conflicts_total() -> &'static IntCounter {
    static COUNTER: OnceLock<IntCounter> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let opts = Opts::new(
            "gastown_merge_conflicts_total",
            "Total number of rebase conflicts hit by the merge queue",
        );
        let counter =
            IntCounter::with_opts(opts).expect("Failed to create merge conflicts counter");
        registry()
            .register(Box::new(counter.clone()))
            .expect("Failed to register merge conflicts counter");
        counter
    })
}

/// Merge queue depth
/// Labels: refinery
pub fn merge_queue_depth() -> &'static GaugeVec {
    static GAUGE: OnceLock<GaugeVec> = OnceLock::new();
    GAUGE.get_or_init(|| {
        let opts = Opts::new(
            "gastown_merge_queue_depth",
            "Number of queue items not yet merged, failed or skipped",
        );
        let gauge = GaugeVec::new(opts, &["refinery"])
            .expect("Failed to create merge queue depth gauge");
        registry()
            .register(Box::new(gauge.clone()))
            .expect("Failed to register merge queue depth gauge");
        gauge
    })
}

/// Escalation counter
/// Labels: target
pub fn escalations_total() -> &'static CounterVec {
    static COUNTER: OnceLock<CounterVec> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let opts = Opts::new(
            "gastown_escalations_total",
            "Total number of escalations sent by witnesses",
        );
        let counter =
            CounterVec::new(opts, &["target"]).expect("Failed to create escalations counter");
        registry()
            .register(Box::new(counter.clone()))
            .expect("Failed to register escalations counter");
        counter
    })
}

/// Encodes all registered metrics in Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to UTF-8")
}

/// Registers every metric so `/metrics` lists them before first use
pub fn init() {
    let _ = reconcile_total();
    let _ = reconcile_errors_total();
    let _ = reconcile_duration_seconds();
    let _ = tool_call_duration_seconds();
    let _ = objects_by_phase();
    let _ = merge_attempts_total();
    let _ = merge_conflicts_total();
    let _ = merge_queue_depth();
    let _ = escalations_total();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_counter_is_encoded() {
        reconcile_total()
            .with_label_values(&["Polecat", "success"])
            .inc();
        let output = encode_metrics();
        assert!(output.contains("gastown_reconcile_total"));
        assert!(output.contains("kind=\"Polecat\""));
    }

    #[test]
    fn test_phase_gauge_and_conflicts() {
        objects_by_phase()
            .with_label_values(&["Rig", "Ready"])
            .set(3.0);
        merge_conflicts_total().inc();
        let output = encode_metrics();
        assert!(output.contains("gastown_objects_by_phase"));
        assert!(output.contains("gastown_merge_conflicts_total"));
    }
}
