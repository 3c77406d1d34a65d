//! Pipeline configuration.
//!
//! This module provides configuration for the stage endpoints, title
//! validation, the durable database, and the direct upload retry policy.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Phrases a model emits when it had nothing usable to title.
pub const DEFAULT_TITLE_FAILURE_PHRASES: &[&str] = &[
    "no musical content",
    "no content",
    "no transcript",
    "unable to generate",
    "cannot generate",
    "not enough information",
    "insufficient information",
];

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline service and its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Storage settings
    /// SQLite file holding artifact records and registry tasks.
    pub database_path: PathBuf,

    // Transcription settings
    /// OpenAI-compatible transcription endpoint.
    pub transcription_url: String,
    /// Transcription model name sent with the upload.
    pub transcription_model: String,
    /// Bearer token for the transcription endpoint.
    pub transcription_api_key: Option<String>,

    // Generation settings
    /// Converse-style endpoint used for summaries and titles.
    pub generation_url: String,
    /// Bearer token for the generation endpoint.
    pub generation_api_key: Option<String>,
    /// Token budget for the summary.
    pub summary_max_tokens: u32,
    /// Token budget for the title.
    pub title_max_tokens: u32,
    /// Sampling temperature for generation.
    pub temperature: f64,

    // Title validation
    /// Generated titles shorter than this are rejected.
    pub min_title_len: usize,
    /// Case-insensitive phrases that mark a generated title as unusable.
    pub title_failure_phrases: Vec<String>,

    // Direct upload settings
    /// Secondary store endpoint for finished documents.
    pub upload_url: Option<String>,
    /// Bearer token for the secondary store.
    pub upload_token: Option<String>,
    /// Retries after the first failed upload attempt.
    pub upload_max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub upload_base_delay: Duration,

    // Registry settings
    /// How often the local registry dispatcher looks for queued tasks when idle.
    pub dispatch_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./scribe-forge.db"),

            transcription_url: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            transcription_model: "whisper-1".to_string(),
            transcription_api_key: None,

            generation_url: "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-3-haiku-20240307-v1:0/converse".to_string(),
            generation_api_key: None,
            summary_max_tokens: 2048,
            title_max_tokens: 50,
            temperature: 0.3,

            min_title_len: 5,
            title_failure_phrases: DEFAULT_TITLE_FAILURE_PHRASES
                .iter()
                .map(|s| s.to_string())
                .collect(),

            upload_url: None,
            upload_token: None,
            upload_max_retries: 3,
            upload_base_delay: Duration::from_millis(1000),

            dispatch_poll_interval: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SCRIBE_DATABASE_PATH`: SQLite database file (default: ./scribe-forge.db)
    /// - `SCRIBE_TRANSCRIPTION_URL`: Transcription endpoint
    /// - `SCRIBE_TRANSCRIPTION_MODEL`: Transcription model (default: whisper-1)
    /// - `OPENAI_API_KEY`: Transcription bearer token
    /// - `SCRIBE_GENERATION_URL`: Converse endpoint for summary and title
    /// - `AWS_BEARER_TOKEN_BEDROCK`: Generation bearer token
    /// - `SCRIBE_SUMMARY_MAX_TOKENS`: Summary token budget (default: 2048)
    /// - `SCRIBE_TITLE_MAX_TOKENS`: Title token budget (default: 50)
    /// - `SCRIBE_TEMPERATURE`: Generation temperature (default: 0.3)
    /// - `SCRIBE_MIN_TITLE_LEN`: Minimum accepted title length (default: 5)
    /// - `SCRIBE_TITLE_FAILURE_PHRASES`: Comma-separated rejection phrases
    /// - `SCRIBE_UPLOAD_URL`: Secondary store endpoint
    /// - `SCRIBE_UPLOAD_TOKEN`: Secondary store bearer token
    /// - `SCRIBE_UPLOAD_MAX_RETRIES`: Upload retries (default: 3)
    /// - `SCRIBE_UPLOAD_BASE_DELAY_MS`: First retry delay (default: 1000)
    /// - `SCRIBE_DISPATCH_POLL_MS`: Dispatcher idle poll (default: 2000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage settings
        if let Ok(val) = std::env::var("SCRIBE_DATABASE_PATH") {
            config.database_path = PathBuf::from(val);
        }

        // Transcription settings
        if let Ok(val) = std::env::var("SCRIBE_TRANSCRIPTION_URL") {
            config.transcription_url = val;
        }

        if let Ok(val) = std::env::var("SCRIBE_TRANSCRIPTION_MODEL") {
            config.transcription_model = val;
        }

        config.transcription_api_key = std::env::var("OPENAI_API_KEY").ok();

        // Generation settings
        if let Ok(val) = std::env::var("SCRIBE_GENERATION_URL") {
            config.generation_url = val;
        }

        config.generation_api_key = std::env::var("AWS_BEARER_TOKEN_BEDROCK").ok();

        if let Ok(val) = std::env::var("SCRIBE_SUMMARY_MAX_TOKENS") {
            config.summary_max_tokens = parse_env_value(&val, "SCRIBE_SUMMARY_MAX_TOKENS")?;
        }

        if let Ok(val) = std::env::var("SCRIBE_TITLE_MAX_TOKENS") {
            config.title_max_tokens = parse_env_value(&val, "SCRIBE_TITLE_MAX_TOKENS")?;
        }

        if let Ok(val) = std::env::var("SCRIBE_TEMPERATURE") {
            config.temperature = parse_env_value(&val, "SCRIBE_TEMPERATURE")?;
        }

        // Title validation
        if let Ok(val) = std::env::var("SCRIBE_MIN_TITLE_LEN") {
            config.min_title_len = parse_env_value(&val, "SCRIBE_MIN_TITLE_LEN")?;
        }

        if let Ok(val) = std::env::var("SCRIBE_TITLE_FAILURE_PHRASES") {
            config.title_failure_phrases = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Direct upload settings
        config.upload_url = std::env::var("SCRIBE_UPLOAD_URL").ok();
        config.upload_token = std::env::var("SCRIBE_UPLOAD_TOKEN").ok();

        if let Ok(val) = std::env::var("SCRIBE_UPLOAD_MAX_RETRIES") {
            config.upload_max_retries = parse_env_value(&val, "SCRIBE_UPLOAD_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("SCRIBE_UPLOAD_BASE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "SCRIBE_UPLOAD_BASE_DELAY_MS")?;
            config.upload_base_delay = Duration::from_millis(ms);
        }

        // Registry settings
        if let Ok(val) = std::env::var("SCRIBE_DISPATCH_POLL_MS") {
            let ms: u64 = parse_env_value(&val, "SCRIBE_DISPATCH_POLL_MS")?;
            config.dispatch_poll_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_path cannot be empty".to_string(),
            ));
        }

        if self.transcription_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "transcription_url cannot be empty".to_string(),
            ));
        }

        if self.generation_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "generation_url cannot be empty".to_string(),
            ));
        }

        if self.summary_max_tokens == 0 || self.title_max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.min_title_len == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_title_len must be greater than 0".to_string(),
            ));
        }

        if self.upload_base_delay.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "upload_base_delay must be greater than 0".to_string(),
            ));
        }

        if self.dispatch_poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dispatch_poll_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Builder method to set the transcription endpoint.
    pub fn with_transcription_url(mut self, url: impl Into<String>) -> Self {
        self.transcription_url = url.into();
        self
    }

    /// Builder method to set the generation endpoint.
    pub fn with_generation_url(mut self, url: impl Into<String>) -> Self {
        self.generation_url = url.into();
        self
    }

    /// Builder method to set the generation temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Builder method to set the minimum title length.
    pub fn with_min_title_len(mut self, len: usize) -> Self {
        self.min_title_len = len;
        self
    }

    /// Builder method to replace the title failure phrases.
    pub fn with_title_failure_phrases(mut self, phrases: Vec<String>) -> Self {
        self.title_failure_phrases = phrases;
        self
    }

    /// Builder method to set the upload endpoint and token.
    pub fn with_upload(mut self, url: impl Into<String>, token: Option<String>) -> Self {
        self.upload_url = Some(url.into());
        self.upload_token = token;
        self
    }

    /// Builder method to set the upload retry policy.
    pub fn with_upload_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.upload_max_retries = max_retries;
        self.upload_base_delay = base_delay;
        self
    }

    /// Builder method to set the dispatcher idle poll interval.
    pub fn with_dispatch_poll_interval(mut self, interval: Duration) -> Self {
        self.dispatch_poll_interval = interval;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.database_path, PathBuf::from("./scribe-forge.db"));
        assert_eq!(config.transcription_model, "whisper-1");
        assert_eq!(config.min_title_len, 5);
        assert_eq!(config.upload_max_retries, 3);
        assert_eq!(config.upload_base_delay, Duration::from_millis(1000));
        assert!(config
            .title_failure_phrases
            .iter()
            .any(|p| p == "no musical content"));
        assert!(config.upload_url.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_database_path("/tmp/test.db")
            .with_transcription_url("http://localhost:9000/transcribe")
            .with_generation_url("http://localhost:9000/converse")
            .with_temperature(0.0)
            .with_min_title_len(8)
            .with_title_failure_phrases(vec!["nothing here".to_string()])
            .with_upload("http://localhost:9000/upload", Some("token".to_string()))
            .with_upload_retries(5, Duration::from_millis(10));

        assert_eq!(config.database_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.transcription_url, "http://localhost:9000/transcribe");
        assert_eq!(config.generation_url, "http://localhost:9000/converse");
        assert_eq!(config.min_title_len, 8);
        assert_eq!(config.title_failure_phrases, vec!["nothing here"]);
        assert_eq!(
            config.upload_url.as_deref(),
            Some("http://localhost:9000/upload")
        );
        assert_eq!(config.upload_token.as_deref(), Some("token"));
        assert_eq!(config.upload_max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_empty_database_path() {
        let result = PipelineConfig::default().with_database_path("").validate();
        assert!(result.unwrap_err().to_string().contains("database_path"));
    }

    #[test]
    fn test_validation_empty_generation_url() {
        let result = PipelineConfig::default().with_generation_url("").validate();
        assert!(result.unwrap_err().to_string().contains("generation_url"));
    }

    #[test]
    fn test_validation_invalid_temperature() {
        let result = PipelineConfig::default().with_temperature(1.5).validate();
        assert!(result.unwrap_err().to_string().contains("temperature"));
    }

    #[test]
    fn test_validation_zero_title_len() {
        let result = PipelineConfig::default().with_min_title_len(0).validate();
        assert!(result.unwrap_err().to_string().contains("min_title_len"));
    }

    #[test]
    fn test_validation_zero_upload_delay() {
        let result = PipelineConfig::default()
            .with_upload_retries(3, Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("upload_base_delay"));
    }

    #[test]
    fn test_parse_env_value() {
        let n: u32 = parse_env_value("42", "KEY").unwrap();
        assert_eq!(n, 42);
        let err = parse_env_value::<u32>("forty", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("forty"));
    }
}
