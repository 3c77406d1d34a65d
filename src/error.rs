//! Error types for scribe-forge operations.
//!
//! Defines error types for each subsystem:
//! - Record store reads and writes
//! - Task registry calls
//! - Stage response parsing and title validation
//! - Direct (non-persisted) uploads
//! - Pipeline stage handling, which folds the others together

use thiserror::Error;

use crate::artifact::StageKind;

/// Errors raised by a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact '{0}' not found")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt record '{id}': {message}")]
    Corrupt { id: String, message: String },
}

/// Errors raised by a task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task registry unavailable: {0}")]
    Unavailable(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Task event stream has already been taken")]
    EventsTaken,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A terminal stage response did not have the expected shape.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("{stage} response is not valid JSON: {message}")]
    InvalidJson { stage: StageKind, message: String },

    #[error("{stage} response is missing '{path}'")]
    MissingField { stage: StageKind, path: &'static str },
}

/// A generated title was rejected. Never fatal to the pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Generated title is too short ({len} < {min} characters)")]
    TooShort { len: usize, min: usize },

    #[error("Generated title matches failure phrase '{0}'")]
    FailurePhrase(String),
}

/// Errors from a direct upload to the secondary store.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload is not configured: {0}")]
    NotConfigured(String),

    #[error("Upload request failed: {0}")]
    Request(String),

    #[error("Upload rejected ({code}): {message}")]
    Status { code: u16, message: String },
}

/// Errors from driving a stage of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The registry could not even register the task.
    #[error("Failed to submit {stage} for artifact '{artifact_id}': {message}")]
    Submission {
        stage: StageKind,
        artifact_id: String,
        message: String,
    },

    /// The registry reported that the task failed.
    #[error("{stage} task {task_id} failed: {message}")]
    Transfer {
        task_id: String,
        stage: StageKind,
        message: String,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Title rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The stage's inputs are not available on the artifact.
    #[error("{stage} is not eligible for artifact '{artifact_id}': {reason}")]
    Precondition {
        stage: StageKind,
        artifact_id: String,
        reason: String,
    },

    #[error("Artifact '{0}' not found")]
    ArtifactNotFound(String),

    /// The requested action does not apply in the artifact's current state.
    #[error("Invalid state for artifact '{artifact_id}': {reason}")]
    InvalidState { artifact_id: String, reason: String },

    #[error("Pipeline service is already running")]
    AlreadyRunning,

    #[error("Pipeline service is not running")]
    NotRunning,
}
