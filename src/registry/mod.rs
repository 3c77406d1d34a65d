//! Task registry: the durable runner that executes stage requests.
//!
//! The pipeline never performs a stage's HTTP call itself. It hands a
//! [`TaskSpec`] to a [`TaskRegistry`], which owns the task from then on and
//! eventually delivers exactly one terminal [`TaskEvent`] for it, possibly
//! after a process restart.
//!
//! Two implementations are provided:
//!
//! - [`InMemoryTaskRegistry`]: scriptable, used by tests and embedders that
//!   drive completion themselves
//! - [`LocalTaskRegistry`]: persists tasks in SQLite and executes them with
//!   an HTTP client on background tasks

pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::artifact::StageKind;
use crate::error::RegistryError;

pub use local::LocalTaskRegistry;
pub use memory::InMemoryTaskRegistry;

/// Opaque identifier assigned by the registry.
pub type TaskId = String;

/// Data the registry carries alongside a task and hands back in events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Weak reference to the artifact the task works for.
    #[serde(default)]
    pub artifact_id: Option<String>,
}

impl TaskMetadata {
    pub fn for_artifact(artifact_id: impl Into<String>) -> Self {
        Self {
            artifact_id: Some(artifact_id.into()),
        }
    }

    /// The artifact id, if present and non-blank.
    pub fn resolvable_artifact_id(&self) -> Option<&str> {
        self.artifact_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Everything the registry needs to perform one stage request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Local file to upload as the request body's `file` part.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    pub endpoint_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body, or the extra form fields when `file_path` is set.
    pub body: String,
    pub stage: StageKind,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

/// Registry-side state of a live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task state: {}", s)),
        }
    }
}

/// A task the registry still holds (not yet cleared).
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub stage: StageKind,
    pub metadata: TaskMetadata,
    pub status: TaskState,
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Completed {
        task_id: TaskId,
        stage: StageKind,
        artifact_id: Option<String>,
        raw_response: String,
    },
    Failed {
        task_id: TaskId,
        stage: StageKind,
        artifact_id: Option<String>,
        error_message: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Completed { task_id, .. } | Self::Failed { task_id, .. } => task_id,
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            Self::Completed { stage, .. } | Self::Failed { stage, .. } => *stage,
        }
    }

    pub fn artifact_id(&self) -> Option<&str> {
        match self {
            Self::Completed { artifact_id, .. } | Self::Failed { artifact_id, .. } => {
                artifact_id.as_deref()
            }
        }
    }
}

/// Durable job runner consumed by the pipeline.
///
/// Every started task yields exactly one terminal event on the receiver
/// returned by [`TaskRegistry::take_events`], even if delivery happens after
/// a restart. Clearing a task removes it from [`TaskRegistry::list_active`]
/// and suppresses any event not yet delivered.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Registers and starts a task.
    async fn start(&self, spec: TaskSpec) -> Result<TaskId, RegistryError>;

    /// All tasks not yet cleared, keyed by id.
    async fn list_active(&self) -> Result<BTreeMap<TaskId, ActiveTask>, RegistryError>;

    /// Forgets a task. Clearing an unknown id is not an error.
    async fn clear(&self, task_id: &str) -> Result<(), RegistryError>;

    /// Stops the task if it is running and forgets it.
    async fn cancel(&self, task_id: &str) -> Result<(), RegistryError>;

    /// Hands out the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TaskEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolvable_artifact_id() {
        assert_eq!(
            TaskMetadata::for_artifact("a1").resolvable_artifact_id(),
            Some("a1")
        );
        assert_eq!(TaskMetadata::default().resolvable_artifact_id(), None);
        assert_eq!(
            TaskMetadata::for_artifact("  ").resolvable_artifact_id(),
            None
        );
    }

    #[test]
    fn test_task_spec_json_shape() {
        let spec = TaskSpec {
            file_path: None,
            endpoint_url: "https://example.test/converse".to_string(),
            headers: BTreeMap::new(),
            body: "{}".to_string(),
            stage: StageKind::TitleGenerate,
            metadata: TaskMetadata::for_artifact("a1"),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["stage"], "title_generate");
        assert_eq!(json["metadata"]["artifact_id"], "a1");

        let back: TaskSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_event_accessors() {
        let event = TaskEvent::Failed {
            task_id: "t1".to_string(),
            stage: StageKind::Summarize,
            artifact_id: Some("a1".to_string()),
            error_message: "boom".to_string(),
        };
        assert_eq!(event.task_id(), "t1");
        assert_eq!(event.stage(), StageKind::Summarize);
        assert_eq!(event.artifact_id(), Some("a1"));
    }
}
