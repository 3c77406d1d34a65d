//! The pipeline service: one explicit object owning the submitter, the
//! completion handler and the reconciler.
//!
//! Nothing happens at construction. [`PipelineService::start`] reconciles
//! first and only then begins consuming registry events on a single event
//! loop; [`PipelineService::stop`] ends that loop and keeps the event stream
//! so the service can be started again.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::config::PipelineConfig;
use super::handler::{CompletionHandler, HandleOutcome};
use super::reconciler::{ReconcileReport, Reconciler};
use super::submitter::StageSubmitter;
use crate::artifact::{Artifact, PipelineStatus, StageKind};
use crate::error::{PipelineError, RegistryError};
use crate::registry::{TaskEvent, TaskId, TaskRegistry};
use crate::storage::{ArtifactWriter, RecordStore};

type EventReceiver = mpsc::UnboundedReceiver<TaskEvent>;

pub struct PipelineService {
    config: Arc<PipelineConfig>,
    writer: ArtifactWriter,
    registry: Arc<dyn TaskRegistry>,
    submitter: StageSubmitter,
    handler: Arc<CompletionHandler>,
    reconciler: Reconciler,
    shutdown_tx: broadcast::Sender<()>,
    events: Mutex<Option<EventReceiver>>,
    event_loop: Mutex<Option<JoinHandle<EventReceiver>>>,
    is_running: AtomicBool,
}

impl PipelineService {
    /// Wires the components together. Does not touch the store or registry.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        registry: Arc<dyn TaskRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let writer = ArtifactWriter::new(store);
        let submitter = StageSubmitter::new(writer.clone(), registry.clone(), config.clone());
        let handler = Arc::new(CompletionHandler::new(
            writer.clone(),
            registry.clone(),
            submitter.clone(),
            config.clone(),
        ));
        let reconciler = Reconciler::new(writer.clone(), registry.clone());

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            writer,
            registry,
            submitter,
            handler,
            reconciler,
            shutdown_tx,
            events: Mutex::new(None),
            event_loop: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Reconciles, then starts handling registry events.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if the service is started
    /// - `Registry(EventsTaken)` if someone else owns the event stream
    /// - `Registry` if the reconciler cannot list live tasks
    pub async fn start(&self) -> Result<ReconcileReport, PipelineError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }

        match self.start_inner().await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<ReconcileReport, PipelineError> {
        let mut events_slot = self.events.lock().await;
        let events = match events_slot.take() {
            Some(events) => events,
            None => self
                .registry
                .take_events()
                .ok_or(PipelineError::Registry(RegistryError::EventsTaken))?,
        };

        let report = match self.reconciler.run().await {
            Ok(report) => report,
            Err(e) => {
                *events_slot = Some(events);
                return Err(e);
            }
        };

        let handle = tokio::spawn(run_event_loop(
            Arc::clone(&self.handler),
            events,
            self.shutdown_tx.subscribe(),
        ));
        *self.event_loop.lock().await = Some(handle);

        info!(report = %report, "Pipeline service started");
        Ok(report)
    }

    /// Stops the event loop after the event in hand, if any, is handled.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PipelineError::NotRunning);
        }

        info!("Stopping pipeline service");
        // Ignore send error - the loop may have already stopped
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.event_loop.lock().await.take() {
            match handle.await {
                Ok(events) => *self.events.lock().await = Some(events),
                Err(e) => error!(error = %e, "Event loop panicked during shutdown"),
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Pipeline service stopped");
        Ok(())
    }

    /// Runs the reconciler on demand.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PipelineError> {
        self.reconciler.run().await
    }

    /// Handles one event directly, bypassing the event loop.
    pub async fn handle_event(&self, event: TaskEvent) -> HandleOutcome {
        self.handler.handle(event).await
    }

    pub async fn get(&self, id: &str) -> Result<Artifact, PipelineError> {
        self.writer
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::ArtifactNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Artifact>, PipelineError> {
        Ok(self.writer.list().await?)
    }

    /// Records a newly captured file and submits transcription.
    ///
    /// The artifact is kept even if submission fails, so it can be retried.
    pub async fn ingest(
        &self,
        title: impl Into<String>,
        source_file_path: impl Into<PathBuf>,
    ) -> Result<(Artifact, TaskId), PipelineError> {
        let artifact = Artifact::capture(title, source_file_path);
        self.writer.insert(&artifact).await?;
        info!(artifact_id = %artifact.id, path = %artifact.source_file_path.display(), "Artifact captured");

        let task_id = self
            .submitter
            .submit_stage(StageKind::Transcribe, &artifact)
            .await?;
        let artifact = self.get(&artifact.id).await?;
        Ok((artifact, task_id))
    }

    /// Resubmits the first unmet stage of a `pending` or `error` artifact.
    pub async fn retry(&self, id: &str) -> Result<(StageKind, TaskId), PipelineError> {
        let artifact = self.get(id).await?;
        match artifact.pipeline_status {
            PipelineStatus::Pending | PipelineStatus::Error => {}
            status => {
                return Err(PipelineError::InvalidState {
                    artifact_id: id.to_string(),
                    reason: format!("cannot retry while {}", status),
                });
            }
        }

        // At most one task per artifact, including finished but uncleared ones.
        let tasks = self.registry.list_active().await?;
        if let Some(task) = tasks
            .values()
            .find(|t| t.metadata.resolvable_artifact_id() == Some(id))
        {
            return Err(PipelineError::InvalidState {
                artifact_id: id.to_string(),
                reason: format!(
                    "task {} ({}, {}) is still registered; reconcile first",
                    task.task_id, task.stage, task.status
                ),
            });
        }

        let stage = artifact.first_unmet_stage();
        info!(artifact_id = %id, stage = %stage, "Retrying stage");
        let task_id = self.submitter.submit_stage(stage, &artifact).await?;
        Ok((stage, task_id))
    }

    /// Sets a user title and locks it against generated titles.
    pub async fn rename(&self, id: &str, title: &str) -> Result<Artifact, PipelineError> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(PipelineError::InvalidState {
                artifact_id: id.to_string(),
                reason: "title must not be empty".to_string(),
            });
        }

        self.writer
            .update(id, move |a| {
                a.title = title;
                a.title_user_locked = true;
                true
            })
            .await?
            .ok_or_else(|| PipelineError::ArtifactNotFound(id.to_string()))
    }

    /// Cancels the artifact's live tasks and deletes its record.
    pub async fn delete(&self, id: &str) -> Result<(), PipelineError> {
        if self.writer.get(id).await?.is_none() {
            return Err(PipelineError::ArtifactNotFound(id.to_string()));
        }

        let tasks = self.registry.list_active().await?;
        for task in tasks
            .values()
            .filter(|t| t.metadata.resolvable_artifact_id() == Some(id))
        {
            if let Err(e) = self.registry.cancel(&task.task_id).await {
                warn!(artifact_id = %id, task_id = %task.task_id, error = %e, "Failed to cancel task");
            }
        }

        self.writer.delete(id).await?;
        info!(artifact_id = %id, "Artifact deleted");
        Ok(())
    }
}

/// Handles events one at a time until shutdown. Hands the receiver back.
async fn run_event_loop(
    handler: Arc<CompletionHandler>,
    mut events: EventReceiver,
    mut shutdown: broadcast::Receiver<()>,
) -> EventReceiver {
    info!("Event loop started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(event) => {
                    handler.handle(event).await;
                }
                None => {
                    warn!("Task event stream closed");
                    break;
                }
            },
        }
    }
    info!("Event loop stopped");
    events
}
