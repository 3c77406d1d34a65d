//! Durable stage orchestration for captured recordings.
//!
//! Each artifact moves through three stages, each run as a background task
//! by the [`TaskRegistry`](crate::registry::TaskRegistry):
//!
//! 1. **transcribe**: the recording is uploaded to a speech-to-text endpoint
//! 2. **summarize**: the transcript is condensed by a text generation endpoint
//! 3. **title_generate**: a short title is generated from the summary
//!
//! Because tasks outlive this process, nothing here holds pipeline state in
//! memory. Every decision re-reads the artifact from the record store.
//!
//! # Components
//!
//! - **StageSubmitter**: checks a stage's inputs, marks the artifact
//!   `processing` and hands the request to the registry
//! - **CompletionHandler**: applies a task's result and chains the next stage
//! - **Reconciler**: repairs store and registry drift before events are handled
//! - **PipelineService**: owns the above and the event loop
//!
//! # Example
//!
//! ```rust,ignore
//! use scribe_forge::pipeline::{PipelineConfig, PipelineService};
//!
//! let config = PipelineConfig::from_env()?;
//! let service = PipelineService::new(config, store, registry);
//!
//! let report = service.start().await?;
//! println!("Reconciled: {}", report);
//!
//! let (artifact, task_id) = service.ingest("Lesson 12", "/recordings/lesson-12.m4a").await?;
//! ```

pub mod config;
pub mod handler;
pub mod reconciler;
pub mod request;
pub mod response;
pub mod service;
pub mod submitter;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use handler::{CompletionHandler, HandleOutcome};
pub use reconciler::{ReconcileReport, Reconciler};
pub use request::build_task_spec;
pub use response::{parse_stage_response, strip_code_fences, validate_title, StageOutput};
pub use service::PipelineService;
pub use submitter::StageSubmitter;
