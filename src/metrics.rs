//! Prometheus observability surface of the pipeline.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `dbintel_records_ingested_total` | Counter | |
//! | `dbintel_records_unroutable_total` | Counter | |
//! | `dbintel_records_late_dropped_total` | Counter | |
//! | `dbintel_windows_emitted_total` | Counter | |
//! | `dbintel_windows_partial_total` | Counter | |
//! | `dbintel_windows_empty_total` | Counter | |
//! | `dbintel_windows_forced_total` | Counter | |
//! | `dbintel_records_admitted_total` | Counter | |
//! | `dbintel_records_downsampled_total` | Counter | |
//! | `dbintel_records_rejected_total` | Counter | |
//! | `dbintel_records_sampled_out_total` | Counter | |
//! | `dbintel_records_quarantined_total` | Counter | `reason` |
//! | `dbintel_records_exported_total` | Counter | |
//! | `dbintel_records_export_dropped_total` | Counter | `reason` |
//! | `dbintel_export_attempts_total` | Counter | `outcome` |
//! | `dbintel_feedback_signals_dropped_total` | Counter | |
//! | `dbintel_plans_unparsed_total` | Counter | |
//! | `dbintel_plans_truncated_total` | Counter | |
//! | `dbintel_records_lost_on_shutdown_total` | Counter | |
//! | `dbintel_keep_probability` | Gauge | `signal` |
//! | `dbintel_breaker_state` | Gauge | `target` |
//! | `dbintel_budget_utilization` | Gauge | `dimension` |
//! | `dbintel_cost_estimate_bytes` | Gauge | |
//! | `dbintel_queue_depth` | Gauge | `stage` |
//!
//! The registry is private to the pipeline; the health endpoint that scrapes
//! it lives outside this crate and only sees [`PipelineMetrics::render`].

use std::collections::BTreeMap;

use prometheus::proto::MetricType;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitState;
use crate::error::{PipelineError, PipelineResult};

/// Label values longer than this are truncated.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

const NAMESPACE: &str = "dbintel";

/// Every counter and gauge the pipeline exposes.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    registry: Registry,

    pub records_ingested: IntCounter,
    pub records_unroutable: IntCounter,
    pub records_late_dropped: IntCounter,
    pub windows_emitted: IntCounter,
    pub windows_partial: IntCounter,
    pub windows_empty: IntCounter,
    pub windows_forced: IntCounter,
    pub records_admitted: IntCounter,
    pub records_downsampled: IntCounter,
    pub records_rejected: IntCounter,
    pub records_sampled_out: IntCounter,
    pub records_quarantined: IntCounterVec,
    pub records_exported: IntCounter,
    pub records_export_dropped: IntCounterVec,
    pub export_attempts: IntCounterVec,
    pub feedback_signals_dropped: IntCounter,
    pub plans_unparsed: IntCounter,
    pub plans_truncated: IntCounter,
    pub records_lost_on_shutdown: IntCounter,

    pub keep_probability: GaugeVec,
    pub breaker_state: IntGaugeVec,
    pub budget_utilization: GaugeVec,
    pub cost_estimate_bytes: IntGauge,
    pub queue_depth: IntGaugeVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn map_err(e: prometheus::Error) -> PipelineError {
    PipelineError::Internal(format!("metric registration failed: {}", e))
}

fn counter(registry: &Registry, name: &str, help: &str) -> PipelineResult<IntCounter> {
    let c = IntCounter::with_opts(opts(name, help)).map_err(map_err)?;
    registry.register(Box::new(c.clone())).map_err(map_err)?;
    Ok(c)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> PipelineResult<IntCounterVec> {
    let c = IntCounterVec::new(opts(name, help), &[label]).map_err(map_err)?;
    registry.register(Box::new(c.clone())).map_err(map_err)?;
    Ok(c)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, label: &str) -> PipelineResult<GaugeVec> {
    let g = GaugeVec::new(opts(name, help), &[label]).map_err(map_err)?;
    registry.register(Box::new(g.clone())).map_err(map_err)?;
    Ok(g)
}

fn int_gauge_vec(registry: &Registry, name: &str, help: &str, label: &str) -> PipelineResult<IntGaugeVec> {
    let g = IntGaugeVec::new(opts(name, help), &[label]).map_err(map_err)?;
    registry.register(Box::new(g.clone())).map_err(map_err)?;
    Ok(g)
}

/// Truncate a label value at a char boundary
pub fn label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

impl PipelineMetrics {
    /// Create the metric set on a fresh private registry.
    pub fn new() -> PipelineResult<Self> {
        let r = Registry::new();
        Ok(Self {
            records_ingested: counter(&r, "records_ingested_total", "Telemetry records admitted to the correlator")?,
            records_unroutable: counter(&r, "records_unroutable_total", "Records discarded for an unparseable entity key")?,
            records_late_dropped: counter(&r, "records_late_dropped_total", "Records that arrived after allowed lateness")?,
            windows_emitted: counter(&r, "windows_emitted_total", "Correlation windows emitted")?,
            windows_partial: counter(&r, "windows_partial_total", "Windows emitted without all three sources")?,
            windows_empty: counter(&r, "windows_empty_total", "Windows discarded with zero records")?,
            windows_forced: counter(&r, "windows_forced_total", "Windows closed early by the open-window bound")?,
            records_admitted: counter(&r, "records_admitted_total", "Records admitted by the cost gate")?,
            records_downsampled: counter(&r, "records_downsampled_total", "Records downsampled by the cost gate")?,
            records_rejected: counter(&r, "records_rejected_total", "Records rejected by the cost gate")?,
            records_sampled_out: counter(&r, "records_sampled_out_total", "Records dropped by the adaptive sampler")?,
            records_quarantined: counter_vec(&r, "records_quarantined_total", "Records quarantined by the verifier", "reason")?,
            records_exported: counter(&r, "records_exported_total", "Records acknowledged by the exporter")?,
            records_export_dropped: counter_vec(&r, "records_export_dropped_total", "Records dropped at the export hop", "reason")?,
            export_attempts: counter_vec(&r, "export_attempts_total", "Export attempts by outcome", "outcome")?,
            feedback_signals_dropped: counter(&r, "feedback_signals_dropped_total", "Feedback signals dropped on full subscribers")?,
            plans_unparsed: counter(&r, "plans_unparsed_total", "Plans that failed to parse")?,
            plans_truncated: counter(&r, "plans_truncated_total", "Plans truncated to the byte limit")?,
            records_lost_on_shutdown: counter(&r, "records_lost_on_shutdown_total", "Records discarded when the drain deadline passed")?,
            keep_probability: gauge_vec(&r, "keep_probability", "Current keep probability per signal class", "signal")?,
            breaker_state: int_gauge_vec(&r, "breaker_state", "Breaker state per target (0 closed, 1 half-open, 2 open)", "target")?,
            budget_utilization: gauge_vec(&r, "budget_utilization", "Used fraction of each cost dimension", "dimension")?,
            cost_estimate_bytes: {
                let g = IntGauge::with_opts(opts("cost_estimate_bytes", "Running estimate of admitted bytes")).map_err(map_err)?;
                r.register(Box::new(g.clone())).map_err(map_err)?;
                g
            },
            queue_depth: int_gauge_vec(&r, "queue_depth", "Items waiting in each stage queue", "stage")?,
            registry: r,
        })
    }

    pub fn set_keep_probability(&self, signal: &str, p: f64) {
        self.keep_probability.with_label_values(&[label(signal)]).set(p);
    }

    pub fn set_breaker_state(&self, target: &str, state: CircuitState) {
        self.breaker_state.with_label_values(&[label(target)]).set(state.as_gauge());
    }

    pub fn set_budget_utilization(&self, dimension: &str, fraction: f64) {
        self.budget_utilization.with_label_values(&[label(dimension)]).set(fraction);
    }

    pub fn set_queue_depth(&self, stage: &str, depth: usize) {
        self.queue_depth.with_label_values(&[stage]).set(depth as i64);
    }

    pub fn quarantined(&self, reason: &str) {
        self.records_quarantined.with_label_values(&[reason]).inc();
    }

    pub fn export_dropped(&self, reason: &str, records: usize) {
        self.records_export_dropped.with_label_values(&[reason]).inc_by(records as u64);
    }

    pub fn export_attempt(&self, outcome: &str) {
        self.export_attempts.with_label_values(&[outcome]).inc();
    }

    /// Prometheus text exposition
    pub fn render(&self) -> PipelineResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PipelineError::Internal(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| PipelineError::Internal(format!("metrics are not UTF-8: {}", e)))
    }

    /// Flattened point-in-time copy of every series
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut values = BTreeMap::new();
        for family in self.registry.gather() {
            let name = family.get_name().trim_start_matches("dbintel_").to_string();
            let is_counter = family.get_field_type() == MetricType::COUNTER;
            for metric in family.get_metric() {
                let labels: Vec<String> = metric
                    .get_label()
                    .iter()
                    .map(|l| format!("{}={}", l.get_name(), l.get_value()))
                    .collect();
                let key = if labels.is_empty() {
                    name.clone()
                } else {
                    format!("{}{{{}}}", name, labels.join(","))
                };
                let value = if is_counter {
                    metric.get_counter().get_value()
                } else {
                    metric.get_gauge().get_value()
                };
                values.insert(key, value);
            }
        }
        MetricsSnapshot { values }
    }
}

/// Serializable copy of the metric values, keyed `name` or `name{label=value}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub values: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    /// Value of a series, zero when it was never touched
    pub fn get(&self, key: &str) -> f64 {
        self.values.get(key).copied().unwrap_or(0.0)
    }
}
