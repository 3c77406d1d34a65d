//! Direct upload of finished artifacts to a secondary text store.
//!
//! Unlike stage work this does not go through the task registry: the call
//! is made synchronously and retried in-process with [`RetryPolicy`].

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::artifact::Artifact;
use crate::error::UploadError;
use crate::metrics::MetricsCollector;
use crate::pipeline::PipelineConfig;
use crate::utils::retry::{retry_with_backoff, RetryPolicy};

const REQUEST_TIMEOUT_SECS: u64 = 60;

const DOCUMENT_MIME_TYPE: &str = "text/markdown";

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    name: &'a str,
    content: &'a str,
    mime_type: &'a str,
}

/// Renders an artifact as a markdown document: title, then summary and
/// transcript sections when present.
pub fn compose_document(artifact: &Artifact) -> String {
    let mut doc = format!("# {}\n", artifact.title.trim());
    if let Some(summary) = artifact.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        doc.push_str("\n## Summary\n\n");
        doc.push_str(summary.trim());
        doc.push('\n');
    }
    if let Some(transcript) = artifact
        .transcript
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        doc.push_str("\n## Transcript\n\n");
        doc.push_str(transcript.trim());
        doc.push('\n');
    }
    doc
}

/// File name for an uploaded artifact, derived from its title.
pub fn document_name(artifact: &Artifact) -> String {
    let stem: String = artifact
        .title
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim();
    if stem.is_empty() {
        format!("{}.md", artifact.id)
    } else {
        format!("{}.md", stem)
    }
}

/// Uploads text documents with bounded retry.
pub struct TextUploader {
    client: Client,
    url: String,
    token: Option<String>,
    policy: RetryPolicy,
    metrics: MetricsCollector,
}

impl TextUploader {
    /// # Errors
    ///
    /// Returns `UploadError::NotConfigured` if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        policy: RetryPolicy,
    ) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| UploadError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
            policy,
            metrics: MetricsCollector::new(),
        })
    }

    /// Builds an uploader from `SCRIBE_UPLOAD_*` settings.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, UploadError> {
        let url = config
            .upload_url
            .clone()
            .ok_or_else(|| UploadError::NotConfigured("SCRIBE_UPLOAD_URL is not set".to_string()))?;
        Self::new(
            url,
            config.upload_token.clone(),
            RetryPolicy::new(config.upload_max_retries, config.upload_base_delay),
        )
    }

    /// Uploads the composed document for `artifact`. Returns the response body.
    pub async fn upload_artifact(&self, artifact: &Artifact) -> Result<String, UploadError> {
        let name = document_name(artifact);
        let content = compose_document(artifact);
        let body = self.upload(&name, &content).await?;
        info!(artifact_id = %artifact.id, name = %name, "Artifact uploaded");
        Ok(body)
    }

    /// Uploads one document, retrying transient failures.
    pub async fn upload(&self, name: &str, content: &str) -> Result<String, UploadError> {
        let request = UploadRequest {
            name,
            content,
            mime_type: DOCUMENT_MIME_TYPE,
        };

        let request = &request;
        let this = self;
        retry_with_backoff(self.policy, "upload", move |_attempt| async move {
            let result = this.send_once(request).await;
            match &result {
                Ok(_) => this.metrics.record_upload_attempt("success"),
                Err(_) => this.metrics.record_upload_attempt("failure"),
            }
            result
        })
        .await
    }

    async fn send_once(&self, request: &UploadRequest<'_>) -> Result<String, UploadError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown");
            let message = if body.trim().is_empty() {
                reason.to_string()
            } else {
                format!("{}: {}", reason, body.trim())
            };
            return Err(UploadError::Status {
                code: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(5))
    }

    #[test]
    fn test_compose_document_sections() {
        let artifact = Artifact::new("a1", "Vibrato Practice", "/tmp/a1.m4a")
            .with_transcript("slow then fast")
            .with_summary("- vibrato");
        let doc = compose_document(&artifact);
        assert!(doc.starts_with("# Vibrato Practice\n"));
        let summary_at = doc.find("## Summary").unwrap();
        let transcript_at = doc.find("## Transcript").unwrap();
        assert!(summary_at < transcript_at);
        assert!(doc.contains("slow then fast"));
    }

    #[test]
    fn test_compose_document_without_outputs() {
        let doc = compose_document(&Artifact::new("a1", "Untitled", "/tmp/a1.m4a"));
        assert_eq!(doc, "# Untitled\n");
    }

    #[test]
    fn test_document_name() {
        let artifact = Artifact::new("a1", "Scales: G/D major", "/tmp/a1.m4a");
        assert_eq!(document_name(&artifact), "Scales_ G_D major.md");
        let artifact = Artifact::new("a1", "  ", "/tmp/a1.m4a");
        assert_eq!(document_name(&artifact), "a1.md");
    }

    #[test]
    fn test_from_config_requires_url() {
        let err = TextUploader::from_config(&PipelineConfig::default()).err().unwrap();
        assert!(matches!(err, UploadError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_upload_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents"))
            .and(bearer_token("tok"))
            .and(body_partial_json(serde_json::json!({
                "name": "Lesson.md",
                "mime_type": "text/markdown"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":"doc-1"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = TextUploader::new(
            format!("{}/documents", server.uri()),
            Some("tok".to_string()),
            fast_policy(),
        )
        .unwrap();
        let body = uploader
            .upload_artifact(&Artifact::new("a1", "Lesson", "/tmp/a1.m4a"))
            .await
            .unwrap();
        assert_eq!(body, r#"{"id":"doc-1"}"#);
    }

    #[tokio::test]
    async fn test_service_unavailable_is_retried_then_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let uploader = TextUploader::new(server.uri(), None, fast_policy()).unwrap();
        let err = uploader.upload("doc.md", "text").await.unwrap_err();

        match err {
            UploadError::Status { code, message } => {
                assert_eq!(code, 503);
                assert_eq!(message, "Service Unavailable");
            }
            other => panic!("Expected Status error, got {:?}", other),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad name"))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = TextUploader::new(server.uri(), None, fast_policy()).unwrap();
        let err = uploader.upload("doc.md", "text").await.unwrap_err();
        assert!(matches!(err, UploadError::Status { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_recovers_after_one_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let uploader = TextUploader::new(server.uri(), None, fast_policy()).unwrap();
        assert_eq!(uploader.upload("doc.md", "text").await.unwrap(), "created");
    }
}
