//! Prometheus metrics for the pipeline.
//!
//! # Example
//!
//! ```ignore
//! use scribe_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_reconcile_action("orphan");
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    EVENT_HANDLING_SECONDS, RECONCILE_ACTIONS_TOTAL, REGISTRY, STAGE_COMPLETIONS_TOTAL,
    STAGE_SUBMISSIONS_TOTAL, UPLOAD_ATTEMPTS_TOTAL,
};
