//! Recording helpers for pipeline metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites pass
//! domain values instead of label slices. Every method is a no-op until
//! [`init_metrics`](super::init_metrics) has run.

use std::time::Duration;

use super::prometheus::{
    EVENT_HANDLING_SECONDS, RECONCILE_ACTIONS_TOTAL, STAGE_COMPLETIONS_TOTAL,
    STAGE_SUBMISSIONS_TOTAL, UPLOAD_ATTEMPTS_TOTAL,
};
use crate::artifact::StageKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a stage submission.
    ///
    /// # Arguments
    ///
    /// * `stage` - The submitted stage
    /// * `result` - `started`, `rejected` (not eligible) or `failed` (registry refused)
    pub fn record_submission(&self, stage: StageKind, result: &str) {
        if let Some(counter) = STAGE_SUBMISSIONS_TOTAL.get() {
            counter.with_label_values(&[stage.as_str(), result]).inc();
        }
        tracing::trace!(stage = %stage, result = result, "Recorded submission metric");
    }

    /// Record one handled task event and how long handling took.
    pub fn record_completion(&self, stage: StageKind, outcome: &str, elapsed: Duration) {
        if let Some(counter) = STAGE_COMPLETIONS_TOTAL.get() {
            counter.with_label_values(&[stage.as_str(), outcome]).inc();
        }
        if let Some(histogram) = EVENT_HANDLING_SECONDS.get() {
            histogram
                .with_label_values(&[stage.as_str()])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_reconcile_action(&self, kind: &str) {
        if let Some(counter) = RECONCILE_ACTIONS_TOTAL.get() {
            counter.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_upload_attempt(&self, result: &str) {
        if let Some(counter) = UPLOAD_ATTEMPTS_TOTAL.get() {
            counter.with_label_values(&[result]).inc();
        }
    }
}
