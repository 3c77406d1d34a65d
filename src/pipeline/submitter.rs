//! Stage submission: the only place pipeline tasks are started.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::config::PipelineConfig;
use super::request::build_task_spec;
use crate::artifact::{Artifact, PipelineStatus, StageKind};
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::registry::{TaskId, TaskRegistry};
use crate::storage::ArtifactWriter;

/// Starts stage tasks for artifacts.
#[derive(Clone)]
pub struct StageSubmitter {
    writer: ArtifactWriter,
    registry: Arc<dyn TaskRegistry>,
    config: Arc<PipelineConfig>,
    metrics: MetricsCollector,
}

impl StageSubmitter {
    pub fn new(
        writer: ArtifactWriter,
        registry: Arc<dyn TaskRegistry>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            writer,
            registry,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Submits `stage` for `artifact`.
    ///
    /// The artifact is marked `processing` before the registry is called, so
    /// a crash in between leaves a record the reconciler can still explain.
    ///
    /// # Errors
    ///
    /// - `Precondition` if the stage's inputs are missing; nothing is written
    /// - `Store` if the `processing` write fails; the registry is not called
    /// - `Submission` if the registry refuses the task; the artifact is set
    ///   to `error`
    pub async fn submit_stage(
        &self,
        stage: StageKind,
        artifact: &Artifact,
    ) -> Result<TaskId, PipelineError> {
        if let Err(reason) = self.check_preconditions(stage, artifact).await {
            self.metrics.record_submission(stage, "rejected");
            warn!(artifact_id = %artifact.id, stage = %stage, reason = %reason, "Stage not eligible");
            return Err(PipelineError::Precondition {
                stage,
                artifact_id: artifact.id.clone(),
                reason,
            });
        }

        let spec = build_task_spec(stage, artifact, &self.config).map_err(|e| {
            PipelineError::Submission {
                stage,
                artifact_id: artifact.id.clone(),
                message: format!("failed to encode request: {}", e),
            }
        })?;

        let marked = self
            .writer
            .update(&artifact.id, |a| {
                a.pipeline_status = PipelineStatus::Processing;
                true
            })
            .await?;
        if marked.is_none() {
            return Err(PipelineError::ArtifactNotFound(artifact.id.clone()));
        }

        match self.registry.start(spec).await {
            Ok(task_id) => {
                self.metrics.record_submission(stage, "started");
                info!(artifact_id = %artifact.id, stage = %stage, task_id = %task_id, "Stage submitted");
                Ok(task_id)
            }
            Err(e) => {
                self.metrics.record_submission(stage, "failed");
                let err = PipelineError::Submission {
                    stage,
                    artifact_id: artifact.id.clone(),
                    message: e.to_string(),
                };
                error!(artifact_id = %artifact.id, stage = %stage, error = %e, "Failed to start stage task");
                self.mark_error(&artifact.id).await;
                Err(err)
            }
        }
    }

    async fn check_preconditions(&self, stage: StageKind, artifact: &Artifact) -> Result<(), String> {
        stage.check_eligible(artifact)?;

        if stage == StageKind::Transcribe {
            let path = &artifact.source_file_path;
            match tokio::fs::try_exists(path).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(format!("source file {} does not exist", path.display()));
                }
                Err(e) => {
                    return Err(format!("source file {} is unreachable: {}", path.display(), e));
                }
            }
        }
        Ok(())
    }

    async fn mark_error(&self, artifact_id: &str) {
        let result = self
            .writer
            .update(artifact_id, |a| {
                a.pipeline_status = PipelineStatus::Error;
                true
            })
            .await;
        if let Err(e) = result {
            error!(artifact_id = %artifact_id, error = %e, "Failed to record error status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryTaskRegistry;
    use crate::storage::{MemoryRecordStore, RecordStore};
    use tempfile::NamedTempFile;

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        registry: Arc<InMemoryTaskRegistry>,
        submitter: StageSubmitter,
    }

    fn fixture(artifacts: Vec<Artifact>) -> Fixture {
        let store = Arc::new(MemoryRecordStore::with_artifacts(artifacts));
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let submitter = StageSubmitter::new(
            ArtifactWriter::new(store.clone()),
            registry.clone(),
            Arc::new(PipelineConfig::default()),
        );
        Fixture {
            store,
            registry,
            submitter,
        }
    }

    #[tokio::test]
    async fn test_submit_marks_processing_then_starts() {
        let artifact = Artifact::new("a1", "Lesson", "/tmp/a1.m4a").with_transcript("t");
        let f = fixture(vec![artifact.clone()]);

        let task_id = f
            .submitter
            .submit_stage(StageKind::Summarize, &artifact)
            .await
            .unwrap();

        let started = f.registry.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, task_id);
        assert_eq!(started[0].1.metadata.artifact_id.as_deref(), Some("a1"));
        assert_eq!(f.store.write_count(), 1);

        let stored = f.store.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Processing);
    }

    #[tokio::test]
    async fn test_ineligible_stage_writes_nothing() {
        let artifact = Artifact::new("a1", "Lesson", "/tmp/a1.m4a");
        let f = fixture(vec![artifact.clone()]);

        let err = f
            .submitter
            .submit_stage(StageKind::TitleGenerate, &artifact)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Precondition { .. }));
        assert_eq!(f.store.write_count(), 0);
        assert!(f.registry.started().is_empty());
    }

    #[tokio::test]
    async fn test_transcribe_requires_existing_file() {
        let artifact = Artifact::new("a1", "Lesson", "/definitely/not/here.m4a");
        let f = fixture(vec![artifact.clone()]);

        let err = f
            .submitter
            .submit_stage(StageKind::Transcribe, &artifact)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition { stage: StageKind::Transcribe, .. }));
        assert!(f.registry.started().is_empty());

        let audio = NamedTempFile::new().unwrap();
        let artifact = Artifact::new("a2", "Lesson", audio.path());
        let f = fixture(vec![artifact.clone()]);
        f.submitter
            .submit_stage(StageKind::Transcribe, &artifact)
            .await
            .unwrap();
        assert_eq!(f.registry.started().len(), 1);
    }

    #[tokio::test]
    async fn test_registry_refusal_sets_error() {
        let artifact = Artifact::new("a1", "Lesson", "/tmp/a1.m4a").with_transcript("t");
        let f = fixture(vec![artifact.clone()]);
        f.registry.refuse_starts(true);

        let err = f
            .submitter
            .submit_stage(StageKind::Summarize, &artifact)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Submission { .. }));
        let stored = f.store.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Error);
    }

    #[tokio::test]
    async fn test_failed_processing_write_skips_registry() {
        let artifact = Artifact::new("a1", "Lesson", "/tmp/a1.m4a").with_transcript("t");
        let f = fixture(vec![artifact.clone()]);
        f.store.set_fail_writes(true);

        let err = f
            .submitter
            .submit_stage(StageKind::Summarize, &artifact)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Store(_)));
        assert!(f.registry.started().is_empty());
    }
}
