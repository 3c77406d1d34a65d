//! Startup reconciliation between the task registry and the record store.
//!
//! Runs once before any event is handled. It only repairs record-store
//! bookkeeping and clears tasks nobody can use; it never starts or cancels
//! registry work.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::artifact::PipelineStatus;
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::registry::{ActiveTask, TaskRegistry};
use crate::storage::ArtifactWriter;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live tasks inspected.
    pub inspected: usize,
    /// Cleared because they carried no artifact id.
    pub unattributed: usize,
    /// Cleared because their artifact no longer exists.
    pub orphans: usize,
    /// Cleared because their artifact is already `complete` or `error`.
    pub zombies: usize,
    /// Artifacts moved from `pending` to `processing`.
    pub recovered_pending: usize,
    /// Tasks already matching a `processing` artifact.
    pub in_flight: usize,
    /// Tasks left untouched because a store or registry call failed.
    pub errors: usize,
}

impl ReconcileReport {
    /// Number of tasks cleared.
    pub fn cleared(&self) -> usize {
        self.unattributed + self.orphans + self.zombies
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inspected {}, cleared {} (unattributed {}, orphans {}, zombies {}), recovered {}, in flight {}, errors {}",
            self.inspected,
            self.cleared(),
            self.unattributed,
            self.orphans,
            self.zombies,
            self.recovered_pending,
            self.in_flight,
            self.errors
        )
    }
}

pub struct Reconciler {
    writer: ArtifactWriter,
    registry: Arc<dyn TaskRegistry>,
    metrics: MetricsCollector,
}

enum Action {
    ClearUnattributed,
    ClearOrphan,
    ClearZombie,
    RecoverPending,
    InFlight,
}

impl Reconciler {
    pub fn new(writer: ArtifactWriter, registry: Arc<dyn TaskRegistry>) -> Self {
        Self {
            writer,
            registry,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs one pass over every live task.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Registry` only if the live task list cannot be
    /// read. Failures on individual tasks are logged and counted.
    pub async fn run(&self) -> Result<ReconcileReport, PipelineError> {
        let tasks = self.registry.list_active().await?;
        let mut report = ReconcileReport {
            inspected: tasks.len(),
            ..Default::default()
        };

        for task in tasks.values() {
            match self.reconcile_task(task).await {
                Ok(Action::ClearUnattributed) => {
                    report.unattributed += 1;
                    self.metrics.record_reconcile_action("unattributed");
                }
                Ok(Action::ClearOrphan) => {
                    report.orphans += 1;
                    self.metrics.record_reconcile_action("orphan");
                }
                Ok(Action::ClearZombie) => {
                    report.zombies += 1;
                    self.metrics.record_reconcile_action("zombie");
                }
                Ok(Action::RecoverPending) => {
                    report.recovered_pending += 1;
                    self.metrics.record_reconcile_action("recovered_pending");
                }
                Ok(Action::InFlight) => report.in_flight += 1,
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Failed to reconcile task; leaving it in place");
                    report.errors += 1;
                    self.metrics.record_reconcile_action("error");
                }
            }
        }

        info!(report = %report, "Reconciliation finished");
        Ok(report)
    }

    async fn reconcile_task(&self, task: &ActiveTask) -> Result<Action, PipelineError> {
        let Some(artifact_id) = task.metadata.resolvable_artifact_id() else {
            warn!(task_id = %task.task_id, stage = %task.stage, "Clearing task without artifact id");
            self.registry.clear(&task.task_id).await?;
            return Ok(Action::ClearUnattributed);
        };

        let Some(artifact) = self.writer.get(artifact_id).await? else {
            warn!(task_id = %task.task_id, artifact_id = %artifact_id, "Clearing orphan task");
            self.registry.clear(&task.task_id).await?;
            return Ok(Action::ClearOrphan);
        };

        match artifact.pipeline_status {
            PipelineStatus::Complete | PipelineStatus::Error => {
                warn!(
                    task_id = %task.task_id,
                    artifact_id = %artifact_id,
                    status = %artifact.pipeline_status,
                    "Clearing zombie task"
                );
                self.registry.clear(&task.task_id).await?;
                Ok(Action::ClearZombie)
            }
            PipelineStatus::Pending => {
                self.writer
                    .update(artifact_id, |a| {
                        if a.pipeline_status != PipelineStatus::Pending {
                            return false;
                        }
                        a.pipeline_status = PipelineStatus::Processing;
                        true
                    })
                    .await?;
                info!(task_id = %task.task_id, artifact_id = %artifact_id, "Recovered pending artifact with live task");
                Ok(Action::RecoverPending)
            }
            PipelineStatus::Processing => {
                debug!(task_id = %task.task_id, artifact_id = %artifact_id, "Task in flight");
                Ok(Action::InFlight)
            }
        }
    }
}
