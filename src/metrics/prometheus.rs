//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by scribe_forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all scribe_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage submissions, labeled by stage and result (`started`, `rejected`, `failed`).
pub static STAGE_SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handled task events, labeled by stage and outcome.
pub static STAGE_COMPLETIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent handling one task event, labeled by stage.
pub static EVENT_HANDLING_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

/// Reconciler actions, labeled by kind (`unattributed`, `orphan`, `zombie`, ...).
pub static RECONCILE_ACTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Direct upload attempts, labeled by result (`success`, `retry`, `failure`).
pub static UPLOAD_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due
/// to duplicate metric names.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let stage_submissions_total = CounterVec::new(
        Opts::new(
            "scribe_forge_stage_submissions_total",
            "Total stage submissions",
        ),
        &["stage", "result"],
    )?;

    let stage_completions_total = CounterVec::new(
        Opts::new(
            "scribe_forge_stage_completions_total",
            "Total task events handled",
        ),
        &["stage", "outcome"],
    )?;

    let event_handling_seconds = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "scribe_forge_event_handling_seconds",
            "Time spent handling one task event",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["stage"],
    )?;

    let reconcile_actions_total = CounterVec::new(
        Opts::new(
            "scribe_forge_reconcile_actions_total",
            "Total reconciler actions",
        ),
        &["kind"],
    )?;

    let upload_attempts_total = CounterVec::new(
        Opts::new(
            "scribe_forge_upload_attempts_total",
            "Total direct upload attempts",
        ),
        &["result"],
    )?;

    registry.register(Box::new(stage_submissions_total.clone()))?;
    registry.register(Box::new(stage_completions_total.clone()))?;
    registry.register(Box::new(event_handling_seconds.clone()))?;
    registry.register(Box::new(reconcile_actions_total.clone()))?;
    registry.register(Box::new(upload_attempts_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = STAGE_SUBMISSIONS_TOTAL.set(stage_submissions_total);
    let _ = STAGE_COMPLETIONS_TOTAL.set(stage_completions_total);
    let _ = EVENT_HANDLING_SECONDS.set(event_handling_seconds);
    let _ = RECONCILE_ACTIONS_TOTAL.set(reconcile_actions_total);
    let _ = UPLOAD_ATTEMPTS_TOTAL.set(upload_attempts_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
