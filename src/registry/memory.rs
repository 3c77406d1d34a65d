//! Scriptable in-process task registry.
//!
//! Tasks never execute on their own: the owner decides when and how each
//! one finishes by calling [`InMemoryTaskRegistry::complete`] or
//! [`InMemoryTaskRegistry::fail`]. Every registry call is recorded so the
//! exact interaction can be asserted.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ActiveTask, TaskEvent, TaskId, TaskMetadata, TaskRegistry, TaskSpec, TaskState};
use crate::artifact::StageKind;
use crate::error::RegistryError;

#[derive(Default)]
struct State {
    next_id: u64,
    tasks: BTreeMap<TaskId, ActiveTask>,
    started: Vec<(TaskId, TaskSpec)>,
    cleared: Vec<TaskId>,
    cancelled: Vec<TaskId>,
    refuse_starts: bool,
}

pub struct InMemoryTaskRegistry {
    state: Mutex<State>,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskEvent>>>,
}

impl Default for InMemoryTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskRegistry {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes `start` fail with [`RegistryError::Unavailable`] until reset.
    pub fn refuse_starts(&self, refuse: bool) {
        self.state().refuse_starts = refuse;
    }

    /// Seeds a live task, as if left over from a previous process.
    pub fn insert_active(
        &self,
        task_id: impl Into<TaskId>,
        stage: StageKind,
        metadata: TaskMetadata,
    ) {
        let task_id = task_id.into();
        self.state().tasks.insert(
            task_id.clone(),
            ActiveTask {
                task_id,
                stage,
                metadata,
                status: TaskState::Running,
            },
        );
    }

    /// Finishes a live task successfully and emits its event.
    ///
    /// Returns `false` (and emits nothing) if the task is unknown, cleared
    /// or already finished.
    pub fn complete(&self, task_id: &str, raw_response: impl Into<String>) -> bool {
        let Some(task) = self.finish(task_id, TaskState::Succeeded) else {
            return false;
        };
        self.deliver(TaskEvent::Completed {
            task_id: task.task_id,
            stage: task.stage,
            artifact_id: task.metadata.artifact_id,
            raw_response: raw_response.into(),
        });
        true
    }

    /// Finishes a live task with a failure and emits its event.
    pub fn fail(&self, task_id: &str, error_message: impl Into<String>) -> bool {
        let Some(task) = self.finish(task_id, TaskState::Failed) else {
            return false;
        };
        self.deliver(TaskEvent::Failed {
            task_id: task.task_id,
            stage: task.stage,
            artifact_id: task.metadata.artifact_id,
            error_message: error_message.into(),
        });
        true
    }

    fn finish(&self, task_id: &str, outcome: TaskState) -> Option<ActiveTask> {
        let mut state = self.state();
        let task = state.tasks.get_mut(task_id)?;
        if matches!(task.status, TaskState::Succeeded | TaskState::Failed) {
            return None;
        }
        task.status = outcome;
        Some(task.clone())
    }

    /// Pushes an arbitrary event, bypassing task bookkeeping. Used to
    /// simulate duplicate or late delivery.
    pub fn deliver(&self, event: TaskEvent) {
        // The receiver only goes away when the consumer shuts down.
        let _ = self.events_tx.send(event);
    }

    /// Tasks started so far, in order.
    pub fn started(&self) -> Vec<(TaskId, TaskSpec)> {
        self.state().started.clone()
    }

    /// Id of the most recently started task.
    pub fn last_started(&self) -> Option<TaskId> {
        self.state().started.last().map(|(id, _)| id.clone())
    }

    pub fn cleared(&self) -> Vec<TaskId> {
        self.state().cleared.clone()
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.state().cancelled.clone()
    }

    pub fn active_count(&self) -> usize {
        self.state().tasks.len()
    }
}

#[async_trait]
impl TaskRegistry for InMemoryTaskRegistry {
    async fn start(&self, spec: TaskSpec) -> Result<TaskId, RegistryError> {
        let mut state = self.state();
        if state.refuse_starts {
            return Err(RegistryError::Unavailable(
                "registry refused the task".to_string(),
            ));
        }

        state.next_id += 1;
        let task_id = format!("task-{}", state.next_id);
        state.tasks.insert(
            task_id.clone(),
            ActiveTask {
                task_id: task_id.clone(),
                stage: spec.stage,
                metadata: spec.metadata.clone(),
                status: TaskState::Queued,
            },
        );
        state.started.push((task_id.clone(), spec));
        Ok(task_id)
    }

    async fn list_active(&self) -> Result<BTreeMap<TaskId, ActiveTask>, RegistryError> {
        Ok(self.state().tasks.clone())
    }

    async fn clear(&self, task_id: &str) -> Result<(), RegistryError> {
        let mut state = self.state();
        state.tasks.remove(task_id);
        state.cleared.push(task_id.to_string());
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<(), RegistryError> {
        let mut state = self.state();
        state.tasks.remove(task_id);
        state.cancelled.push(task_id.to_string());
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TaskEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
