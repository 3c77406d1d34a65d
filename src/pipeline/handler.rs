//! Completion handling: the pipeline state machine.
//!
//! Every terminal [`TaskEvent`] goes through [`CompletionHandler::handle`],
//! which re-reads the artifact, applies the stage's result, submits the
//! next stage or marks the artifact terminal, and finally clears the task.
//!
//! ```text
//! pending -> processing(transcribe) -> processing(summarize)
//!         -> processing(title_generate) -> complete
//!                      \_______________________/
//!                        any fatal stage -> error
//! ```
//!
//! Handling is idempotent per task id: recent ids are remembered in a
//! bounded window, and a redelivered event whose output is already on the
//! artifact, or whose artifact is terminal, is treated as a duplicate.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::config::PipelineConfig;
use super::response::{parse_stage_response, validate_title, StageOutput};
use super::submitter::StageSubmitter;
use crate::artifact::{Artifact, PipelineStatus, StageKind};
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::registry::{TaskEvent, TaskId, TaskRegistry};
use crate::storage::ArtifactWriter;

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The next stage was submitted.
    Advanced { next_stage: StageKind, task_id: TaskId },
    /// The artifact reached `complete`.
    Completed,
    /// The artifact was set to `error` (or the attempt was logged).
    Failed,
    /// Nothing applied: duplicate, unattributed, orphaned or stale event.
    Ignored,
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
        }
    }
}

/// Recently handled task ids kept for duplicate detection.
///
/// Older ids fall out first. An evicted id's redelivery is still caught by
/// the stale-output and terminal-status checks.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Bounded set of task ids, evicting the oldest insert when full.
struct RecentIds {
    ids: HashSet<TaskId>,
    order: VecDeque<TaskId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Inserts `id`; `false` if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Consumes task events and drives artifacts through the stages.
pub struct CompletionHandler {
    writer: ArtifactWriter,
    registry: Arc<dyn TaskRegistry>,
    submitter: StageSubmitter,
    config: Arc<PipelineConfig>,
    handled: Mutex<RecentIds>,
    metrics: MetricsCollector,
}

impl CompletionHandler {
    pub fn new(
        writer: ArtifactWriter,
        registry: Arc<dyn TaskRegistry>,
        submitter: StageSubmitter,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            writer,
            registry,
            submitter,
            config,
            handled: Mutex::new(RecentIds::new(DEFAULT_DEDUP_CAPACITY)),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets how many recent task ids are remembered for duplicate detection.
    pub fn with_dedup_capacity(self, capacity: usize) -> Self {
        Self {
            handled: Mutex::new(RecentIds::new(capacity)),
            ..self
        }
    }

    /// Handles one terminal event and clears its task.
    ///
    /// Never returns an error: every failure is converted into a status
    /// update attempt and logged.
    pub async fn handle(&self, event: TaskEvent) -> HandleOutcome {
        let started = Instant::now();
        let task_id = event.task_id().to_string();
        let stage = event.stage();

        let outcome = if self.first_delivery(&task_id) {
            self.dispatch(&event).await
        } else {
            debug!(task_id = %task_id, stage = %stage, "Duplicate event; ignoring");
            HandleOutcome::Ignored
        };

        if let Err(e) = self.registry.clear(&task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to clear task");
        }

        self.metrics
            .record_completion(stage, outcome.as_str(), started.elapsed());
        outcome
    }

    /// Records `task_id` as handled; `false` if it recently was.
    fn first_delivery(&self, task_id: &str) -> bool {
        self.recent().insert(task_id)
    }

    fn recent(&self) -> MutexGuard<'_, RecentIds> {
        self.handled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn dispatch(&self, event: &TaskEvent) -> HandleOutcome {
        let stage = event.stage();
        let task_id = event.task_id();

        let Some(artifact_id) = event.artifact_id().map(str::trim).filter(|id| !id.is_empty())
        else {
            warn!(task_id = %task_id, stage = %stage, "Event has no artifact id; ignoring");
            return HandleOutcome::Ignored;
        };

        let artifact = match self.writer.get(artifact_id).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                warn!(task_id = %task_id, artifact_id = %artifact_id, "Event for deleted artifact; ignoring");
                return HandleOutcome::Ignored;
            }
            Err(e) => {
                return self
                    .fail(artifact_id, stage, &PipelineError::Store(e))
                    .await;
            }
        };

        if artifact.pipeline_status.is_terminal() {
            info!(
                task_id = %task_id,
                artifact_id = %artifact_id,
                status = %artifact.pipeline_status,
                "Artifact already terminal; ignoring event"
            );
            return HandleOutcome::Ignored;
        }

        match event {
            TaskEvent::Failed { error_message, .. } => {
                let err = PipelineError::Transfer {
                    task_id: task_id.to_string(),
                    stage,
                    message: error_message.clone(),
                };
                if stage.is_fatal_on_failure() {
                    self.fail(artifact_id, stage, &err).await
                } else {
                    warn!(artifact_id = %artifact_id, error = %err, "Title generation failed; keeping current title");
                    self.complete(artifact_id, stage).await
                }
            }
            TaskEvent::Completed { raw_response, .. } => {
                match self.apply(stage, &artifact, raw_response).await {
                    Ok(outcome) => outcome,
                    Err(err) if stage.is_fatal_on_failure() => {
                        self.fail(artifact_id, stage, &err).await
                    }
                    Err(err) => {
                        warn!(artifact_id = %artifact_id, error = %err, "Title generation unusable; keeping current title");
                        self.complete(artifact_id, stage).await
                    }
                }
            }
        }
    }

    /// Parses the response and applies the stage's mutation.
    async fn apply(
        &self,
        stage: StageKind,
        artifact: &Artifact,
        raw_response: &str,
    ) -> Result<HandleOutcome, PipelineError> {
        let output = parse_stage_response(stage, raw_response)?;
        let id = artifact.id.as_str();

        match output {
            StageOutput::Transcript(text) => {
                if artifact.transcript.is_some() {
                    debug!(artifact_id = %id, "Transcript already stored; stale event");
                    return Ok(HandleOutcome::Ignored);
                }
                let updated = self
                    .store_output(id, move |a| a.transcript = Some(text))
                    .await?;
                self.advance(StageKind::Summarize, &updated).await
            }
            StageOutput::Summary(text) => {
                if artifact.summary.is_some() {
                    debug!(artifact_id = %id, "Summary already stored; stale event");
                    return Ok(HandleOutcome::Ignored);
                }
                let updated = self.store_output(id, move |a| a.summary = Some(text)).await?;
                self.advance(StageKind::TitleGenerate, &updated).await
            }
            StageOutput::Title(text) => {
                let title = if artifact.title_user_locked {
                    info!(artifact_id = %id, "Title locked by user; skipping generated title");
                    None
                } else {
                    match validate_title(
                        &text,
                        self.config.min_title_len,
                        &self.config.title_failure_phrases,
                    ) {
                        Ok(title) => Some(title),
                        Err(e) => {
                            warn!(artifact_id = %id, title = %text, reason = %e, "Generated title rejected");
                            None
                        }
                    }
                };

                self.writer
                    .update(id, move |a| {
                        if let Some(title) = title {
                            // A rename may have landed since the event was read.
                            if !a.title_user_locked {
                                a.title = title;
                            }
                        }
                        a.pipeline_status = PipelineStatus::Complete;
                        true
                    })
                    .await?
                    .ok_or_else(|| PipelineError::ArtifactNotFound(id.to_string()))?;

                info!(artifact_id = %id, "Pipeline complete");
                Ok(HandleOutcome::Completed)
            }
        }
    }

    async fn store_output<F>(&self, id: &str, set: F) -> Result<Artifact, PipelineError>
    where
        F: FnOnce(&mut Artifact) + Send,
    {
        self.writer
            .update(id, move |a| {
                set(a);
                true
            })
            .await?
            .ok_or_else(|| PipelineError::ArtifactNotFound(id.to_string()))
    }

    async fn advance(
        &self,
        next_stage: StageKind,
        artifact: &Artifact,
    ) -> Result<HandleOutcome, PipelineError> {
        let task_id = self.submitter.submit_stage(next_stage, artifact).await?;
        Ok(HandleOutcome::Advanced {
            next_stage,
            task_id,
        })
    }

    /// Sets `error` unless the artifact is already terminal.
    async fn fail(&self, artifact_id: &str, stage: StageKind, err: &PipelineError) -> HandleOutcome {
        error!(artifact_id = %artifact_id, stage = %stage, error = %err, "Stage failed");

        let result = self
            .writer
            .update(artifact_id, |a| {
                if a.pipeline_status.is_terminal() {
                    return false;
                }
                a.pipeline_status = PipelineStatus::Error;
                true
            })
            .await;
        if let Err(e) = result {
            error!(artifact_id = %artifact_id, error = %e, "Failed to record error status");
        }
        HandleOutcome::Failed
    }

    async fn complete(&self, artifact_id: &str, stage: StageKind) -> HandleOutcome {
        let result = self
            .writer
            .update(artifact_id, |a| {
                a.pipeline_status = PipelineStatus::Complete;
                true
            })
            .await;
        match result {
            Ok(_) => {
                info!(artifact_id = %artifact_id, "Pipeline complete");
                HandleOutcome::Completed
            }
            Err(e) => self.fail(artifact_id, stage, &PipelineError::Store(e)).await,
        }
    }
}
