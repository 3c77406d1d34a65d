//! Artifact records and the pipeline stage model.
//!
//! An [`Artifact`] is one recording moving through the pipeline. Each
//! [`StageKind`] is one ordered unit of external work; stage eligibility is
//! an explicit precondition check rather than ad-hoc null checks at call
//! sites.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of an artifact through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Captured, no stage submitted yet.
    Pending,
    /// A stage task is (or is believed to be) in flight.
    Processing,
    /// All stages finished.
    Complete,
    /// A stage failed; a caller may retry.
    Error,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Terminal states never have a live task attached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid pipeline status: {}", s)),
        }
    }
}

/// One ordered unit of pipeline work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Transcribe,
    Summarize,
    TitleGenerate,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [StageKind; 3] = [Self::Transcribe, Self::Summarize, Self::TitleGenerate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Summarize => "summarize",
            Self::TitleGenerate => "title_generate",
        }
    }

    /// The stage submitted after this one completes, if any.
    pub fn next(&self) -> Option<StageKind> {
        match self {
            Self::Transcribe => Some(Self::Summarize),
            Self::Summarize => Some(Self::TitleGenerate),
            Self::TitleGenerate => None,
        }
    }

    /// Whether a failure of this stage blocks completion of the pipeline.
    ///
    /// Title generation only tries to improve the title, so it never does.
    pub fn is_fatal_on_failure(&self) -> bool {
        !matches!(self, Self::TitleGenerate)
    }

    /// Checks the data preconditions for running this stage on `artifact`.
    ///
    /// Source file reachability for `Transcribe` is an I/O concern and is
    /// checked by the submitter; here only the record itself is inspected.
    pub fn check_eligible(&self, artifact: &Artifact) -> Result<(), String> {
        match self {
            Self::Transcribe => {
                if artifact.source_file_path.as_os_str().is_empty() {
                    return Err("artifact has no source file".to_string());
                }
                Ok(())
            }
            Self::Summarize => {
                if artifact.transcript.is_none() {
                    return Err("summarize requires a transcript".to_string());
                }
                Ok(())
            }
            Self::TitleGenerate => {
                if artifact.summary.is_none() {
                    return Err("title generation requires a summary".to_string());
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" => Ok(Self::Transcribe),
            "summarize" => Ok(Self::Summarize),
            "title_generate" | "titleGenerate" => Ok(Self::TitleGenerate),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// A recorded item progressing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Opaque stable identifier.
    pub id: String,
    /// Display title; may be improved by the title stage unless locked.
    pub title: String,
    /// Path of the captured audio file.
    pub source_file_path: PathBuf,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub pipeline_status: PipelineStatus,
    /// Set once the user edits the title; stages then leave it alone.
    #[serde(default)]
    pub title_user_locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates a `pending` artifact for a freshly captured recording.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        source_file_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            source_file_path: source_file_path.into(),
            transcript: None,
            summary: None,
            pipeline_status: PipelineStatus::Pending,
            title_user_locked: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a `pending` artifact with a generated id.
    pub fn capture(title: impl Into<String>, source_file_path: impl Into<PathBuf>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), title, source_file_path)
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_status(mut self, status: PipelineStatus) -> Self {
        self.pipeline_status = status;
        self
    }

    pub fn with_locked_title(mut self) -> Self {
        self.title_user_locked = true;
        self
    }

    /// The stage a manual retry should resubmit.
    ///
    /// This is the first stage whose output is missing. Once transcript and
    /// summary both exist only the optional title stage is left to try.
    pub fn first_unmet_stage(&self) -> StageKind {
        if self.transcript.is_none() {
            StageKind::Transcribe
        } else if self.summary.is_none() {
            StageKind::Summarize
        } else {
            StageKind::TitleGenerate
        }
    }

    /// Marks the record as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(StageKind::Transcribe.next(), Some(StageKind::Summarize));
        assert_eq!(StageKind::Summarize.next(), Some(StageKind::TitleGenerate));
        assert_eq!(StageKind::TitleGenerate.next(), None);
    }

    #[test]
    fn test_stage_round_trips_through_str() {
        for stage in StageKind::ALL {
            assert_eq!(stage.as_str().parse::<StageKind>().unwrap(), stage);
        }
        assert_eq!(
            "titleGenerate".parse::<StageKind>().unwrap(),
            StageKind::TitleGenerate
        );
        assert!("upload".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_status_parse_and_terminal() {
        assert_eq!(
            "processing".parse::<PipelineStatus>().unwrap(),
            PipelineStatus::Processing
        );
        assert!(PipelineStatus::Complete.is_terminal());
        assert!(PipelineStatus::Error.is_terminal());
        assert!(!PipelineStatus::Pending.is_terminal());
        assert!(!PipelineStatus::Processing.is_terminal());
        assert!("done".parse::<PipelineStatus>().is_err());
    }

    #[test]
    fn test_eligibility_requires_previous_output() {
        let artifact = Artifact::new("a1", "Lesson", "/tmp/a1.m4a");
        assert!(StageKind::Transcribe.check_eligible(&artifact).is_ok());
        assert!(StageKind::Summarize.check_eligible(&artifact).is_err());
        assert!(StageKind::TitleGenerate.check_eligible(&artifact).is_err());

        let artifact = artifact.with_transcript("bow hold");
        assert!(StageKind::Summarize.check_eligible(&artifact).is_ok());
        assert!(StageKind::TitleGenerate.check_eligible(&artifact).is_err());

        let artifact = artifact.with_summary("Lesson notes");
        assert!(StageKind::TitleGenerate.check_eligible(&artifact).is_ok());
    }

    #[test]
    fn test_transcribe_requires_source_path() {
        let artifact = Artifact::new("a1", "Lesson", "");
        assert!(StageKind::Transcribe.check_eligible(&artifact).is_err());
    }

    #[test]
    fn test_first_unmet_stage() {
        let artifact = Artifact::new("a1", "Lesson", "/tmp/a1.m4a");
        assert_eq!(artifact.first_unmet_stage(), StageKind::Transcribe);

        let artifact = artifact.with_transcript("t");
        assert_eq!(artifact.first_unmet_stage(), StageKind::Summarize);

        let artifact = artifact.with_summary("s");
        assert_eq!(artifact.first_unmet_stage(), StageKind::TitleGenerate);
    }

    #[test]
    fn test_only_title_stage_is_non_fatal() {
        assert!(StageKind::Transcribe.is_fatal_on_failure());
        assert!(StageKind::Summarize.is_fatal_on_failure());
        assert!(!StageKind::TitleGenerate.is_fatal_on_failure());
    }

    #[test]
    fn test_artifact_serde_uses_wire_names() {
        let artifact = Artifact::new("a1", "Lesson", "/tmp/a1.m4a")
            .with_status(PipelineStatus::Processing);
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["pipeline_status"], "processing");
        assert_eq!(json["title_user_locked"], false);
        assert!(json["transcript"].is_null());
    }
}
