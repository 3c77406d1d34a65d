//! scribe_forge: durable transcription, summary and titling pipeline.
//!
//! Recordings are captured as [`Artifact`](artifact::Artifact) records and
//! driven through three background stages by a task registry. Pipeline state
//! lives in the record store, so a restarted process resumes by reconciling
//! instead of replaying in-memory state.

// Core modules
pub mod artifact;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod upload;
pub mod utils;

// Re-export commonly used types
pub use artifact::{Artifact, PipelineStatus, StageKind};
pub use error::{
    ParseError, PipelineError, RegistryError, StoreError, UploadError, ValidationError,
};
