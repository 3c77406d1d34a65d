//! Builds the task spec for each pipeline stage.

use std::collections::BTreeMap;

use serde::Serialize;

use super::config::PipelineConfig;
use crate::artifact::{Artifact, StageKind};
use crate::registry::{TaskMetadata, TaskSpec};

/// Instruction prepended to the transcript for the summarize stage.
pub const SUMMARY_PROMPT: &str = "You are summarizing a transcript of a recorded music lesson or \
practice session. Write concise notes in markdown: the main topics covered, specific techniques \
or corrections discussed, and any assignments or next steps. Do not invent content that is not \
in the transcript.\n\nTranscript:\n";

/// Instruction prepended to the summary for the title stage.
pub const TITLE_PROMPT: &str = "Write a short, descriptive title (at most eight words) for a \
recording with the following summary. Reply with the title only, without quotes or \
punctuation at the end.\n\nSummary:\n";

#[derive(Serialize)]
struct ConverseRequest<'a> {
    messages: [ConverseMessage<'a>; 1],
    #[serde(rename = "inferenceConfig")]
    inference_config: InferenceConfig,
}

#[derive(Serialize)]
struct ConverseMessage<'a> {
    role: &'static str,
    content: [ContentBlock<'a>; 1],
}

#[derive(Serialize)]
struct ContentBlock<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct InferenceConfig {
    #[serde(rename = "maxTokens")]
    max_tokens: u32,
    temperature: f64,
}

/// Builds the request for `stage` on `artifact`.
///
/// Callers check eligibility first; a missing input here is serialized as
/// an empty string rather than rejected.
pub fn build_task_spec(
    stage: StageKind,
    artifact: &Artifact,
    config: &PipelineConfig,
) -> Result<TaskSpec, serde_json::Error> {
    let metadata = TaskMetadata::for_artifact(&artifact.id);

    match stage {
        StageKind::Transcribe => {
            let mut headers = BTreeMap::new();
            if let Some(key) = &config.transcription_api_key {
                headers.insert("authorization".to_string(), format!("Bearer {}", key));
            }
            let fields = serde_json::json!({
                "model": config.transcription_model,
                "response_format": "json",
            });
            Ok(TaskSpec {
                file_path: Some(artifact.source_file_path.clone()),
                endpoint_url: config.transcription_url.clone(),
                headers,
                body: fields.to_string(),
                stage,
                metadata,
            })
        }
        StageKind::Summarize => {
            let prompt = format!(
                "{}{}",
                SUMMARY_PROMPT,
                artifact.transcript.as_deref().unwrap_or_default()
            );
            converse_spec(stage, &prompt, config.summary_max_tokens, config, metadata)
        }
        StageKind::TitleGenerate => {
            let prompt = format!(
                "{}{}",
                TITLE_PROMPT,
                artifact.summary.as_deref().unwrap_or_default()
            );
            converse_spec(stage, &prompt, config.title_max_tokens, config, metadata)
        }
    }
}

fn converse_spec(
    stage: StageKind,
    prompt: &str,
    max_tokens: u32,
    config: &PipelineConfig,
    metadata: TaskMetadata,
) -> Result<TaskSpec, serde_json::Error> {
    let body = ConverseRequest {
        messages: [ConverseMessage {
            role: "user",
            content: [ContentBlock { text: prompt }],
        }],
        inference_config: InferenceConfig {
            max_tokens,
            temperature: config.temperature,
        },
    };

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    if let Some(key) = &config.generation_api_key {
        headers.insert("authorization".to_string(), format!("Bearer {}", key));
    }

    Ok(TaskSpec {
        file_path: None,
        endpoint_url: config.generation_url.clone(),
        headers,
        body: serde_json::to_string(&body)?,
        stage,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcribe_spec_uploads_source_file() {
        let config = PipelineConfig::default();
        let artifact = Artifact::new("a1", "Lesson", "/recordings/a1.m4a");

        let spec = build_task_spec(StageKind::Transcribe, &artifact, &config).unwrap();
        assert_eq!(
            spec.file_path.as_deref(),
            Some(std::path::Path::new("/recordings/a1.m4a"))
        );
        assert_eq!(spec.endpoint_url, config.transcription_url);
        assert_eq!(spec.metadata.artifact_id.as_deref(), Some("a1"));

        let fields: serde_json::Value = serde_json::from_str(&spec.body).unwrap();
        assert_eq!(fields["model"], config.transcription_model);
    }

    #[test]
    fn test_summarize_spec_embeds_transcript() {
        let config = PipelineConfig::default().with_temperature(0.5);
        let artifact =
            Artifact::new("a1", "Lesson", "/recordings/a1.m4a").with_transcript("play it slower");

        let spec = build_task_spec(StageKind::Summarize, &artifact, &config).unwrap();
        assert!(spec.file_path.is_none());
        assert_eq!(spec.headers["content-type"], "application/json");

        let body: serde_json::Value = serde_json::from_str(&spec.body).unwrap();
        let text = body["messages"][0]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with(SUMMARY_PROMPT));
        assert!(text.ends_with("play it slower"));
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(
            body["inferenceConfig"]["maxTokens"],
            config.summary_max_tokens
        );
        assert_eq!(body["inferenceConfig"]["temperature"], 0.5);
    }

    #[test]
    fn test_title_spec_uses_summary_and_small_budget() {
        let config = PipelineConfig::default();
        let artifact = Artifact::new("a1", "Lesson", "/recordings/a1.m4a")
            .with_transcript("t")
            .with_summary("Bow distribution on long notes");

        let spec = build_task_spec(StageKind::TitleGenerate, &artifact, &config).unwrap();
        assert_eq!(spec.stage, StageKind::TitleGenerate);

        let body: serde_json::Value = serde_json::from_str(&spec.body).unwrap();
        let text = body["messages"][0]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Bow distribution on long notes"));
        assert_eq!(body["inferenceConfig"]["maxTokens"], config.title_max_tokens);
    }

    #[test]
    fn test_api_keys_become_bearer_headers() {
        let mut config = PipelineConfig::default();
        config.generation_api_key = Some("secret".to_string());
        let artifact = Artifact::new("a1", "Lesson", "/a.m4a").with_transcript("t");

        let spec = build_task_spec(StageKind::Summarize, &artifact, &config).unwrap();
        assert_eq!(spec.headers["authorization"], "Bearer secret");
    }
}
