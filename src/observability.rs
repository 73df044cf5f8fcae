// src/observability.rs
//! Tracing setup and injected metrics
//!
//! Metrics go through [`MetricsRecorder`] handed to each component at
//! construction, so tests can observe them without a global recorder.

use crate::utils::config::LoggingSettings;
use crate::utils::errors::{OrchestratorError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const RUNS_SUBMITTED: &str = "orchestrator_runs_submitted_total";
pub const RUNS_REJECTED: &str = "orchestrator_runs_rejected_total";
pub const RUNS_TERMINAL: &str = "orchestrator_runs_terminal_total";
pub const TERMINATION_FAILED: &str = "orchestrator_termination_failed_total";
pub const EVENT_APPEND_FAILED: &str = "orchestrator_event_append_failed_total";
pub const ACTIVE_RUNS: &str = "orchestrator_active_runs";
pub const RECONCILER_ORPHANED: &str = "reconciler_orphaned_total";
pub const RECONCILER_STALE_RECOVERED: &str = "reconciler_stale_recovered_total";
pub const RECONCILER_ORPHANS_KILLED: &str = "reconciler_orphans_killed_total";
pub const RECONCILER_PASS_DURATION: &str = "reconciler_pass_duration_ms";
pub const SUBSCRIBERS_DROPPED: &str = "broadcaster_subscribers_dropped_total";

/// Label set attached to a metric sample
pub type Labels<'a> = &'a [(&'static str, String)];

/// Metric sink
pub trait MetricsRecorder: Send + Sync {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>);

    fn record_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>);

    fn set_gauge(&self, name: &'static str, value: f64);
}

/// Forwards to the `metrics` facade; the host decides which exporter to install
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacade;

fn to_labels(labels: Labels<'_>) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(k, v)| metrics::Label::new(*k, v.clone()))
        .collect()
}

impl MetricsRecorder for MetricsFacade {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>) {
        let labels = to_labels(labels);
        metrics::counter!(name, labels).increment(1);
    }

    fn record_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        let labels = to_labels(labels);
        metrics::histogram!(name, labels).record(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _labels: Labels<'_>) {}

    fn record_histogram(&self, _name: &'static str, _value: f64, _labels: Labels<'_>) {}

    fn set_gauge(&self, _name: &'static str, _value: f64) {}
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured filter when set.
pub fn init_tracing(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .map_err(|e| OrchestratorError::ConfigError(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if settings.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| OrchestratorError::ConfigError(format!("Tracing already initialized: {}", e)))
}
