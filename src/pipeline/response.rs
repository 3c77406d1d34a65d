//! Typed parsing of terminal stage responses.
//!
//! Each stage has an explicit response schema. A response that does not
//! match it is a [`ParseError`] naming the stage and the missing path.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::artifact::StageKind;
use crate::error::{ParseError, ValidationError};

/// Transcription endpoint response.
#[derive(Debug, Deserialize)]
pub struct TranscriptionResponse {
    #[serde(default)]
    pub text: Option<String>,
}

/// Converse-style generation response: `output.message.content[*].text`.
#[derive(Debug, Deserialize)]
pub struct ConverseResponse {
    #[serde(default)]
    pub output: Option<ConverseOutput>,
}

#[derive(Debug, Deserialize)]
pub struct ConverseOutput {
    #[serde(default)]
    pub message: Option<OutputMessage>,
}

#[derive(Debug, Deserialize)]
pub struct OutputMessage {
    #[serde(default)]
    pub content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(default)]
    pub text: Option<String>,
}

impl ConverseResponse {
    /// Concatenated text of all content blocks.
    fn into_text(self, stage: StageKind) -> Result<String, ParseError> {
        let missing = |path| ParseError::MissingField { stage, path };

        let output = self.output.ok_or_else(|| missing("output"))?;
        let message = output.message.ok_or_else(|| missing("output.message"))?;
        let content = message
            .content
            .ok_or_else(|| missing("output.message.content"))?;

        let texts: Vec<String> = content.into_iter().filter_map(|block| block.text).collect();
        if texts.is_empty() {
            return Err(missing("output.message.content[].text"));
        }
        Ok(texts.join("\n"))
    }
}

/// Parsed payload of a successful stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Transcript(String),
    Summary(String),
    /// Raw generated title, not yet validated.
    Title(String),
}

/// Parses the raw body a stage task returned.
///
/// Summaries have markdown fences stripped; titles are trimmed and
/// unquoted but not validated (see [`validate_title`]).
pub fn parse_stage_response(stage: StageKind, raw: &str) -> Result<StageOutput, ParseError> {
    let invalid = |e: serde_json::Error| ParseError::InvalidJson {
        stage,
        message: e.to_string(),
    };

    match stage {
        StageKind::Transcribe => {
            let response: TranscriptionResponse = serde_json::from_str(raw).map_err(invalid)?;
            let text = response.text.ok_or(ParseError::MissingField {
                stage,
                path: "text",
            })?;
            Ok(StageOutput::Transcript(text.trim().to_string()))
        }
        StageKind::Summarize => {
            let response: ConverseResponse = serde_json::from_str(raw).map_err(invalid)?;
            let text = response.into_text(stage)?;
            Ok(StageOutput::Summary(strip_code_fences(&text)))
        }
        StageKind::TitleGenerate => {
            let response: ConverseResponse = serde_json::from_str(raw).map_err(invalid)?;
            let text = response.into_text(stage)?;
            Ok(StageOutput::Title(clean_title(&text)))
        }
    }
}

fn fence_line_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*```.*(?:\r?\n|$)").expect("Invalid regex for code fences")
    })
}

/// Removes every line that opens or closes a markdown code fence, then
/// trims the result.
///
/// The content between fences is kept. Applying this twice gives the same
/// result as applying it once.
pub fn strip_code_fences(text: &str) -> String {
    fence_line_regex().replace_all(text, "").trim().to_string()
}

fn clean_title(text: &str) -> String {
    let stripped = strip_code_fences(text);
    let first_line = stripped.lines().next().unwrap_or_default();
    first_line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim()
        .to_string()
}

/// Accepts a generated title or says why it was rejected.
///
/// Rejects titles shorter than `min_len` characters and titles containing
/// any of `failure_phrases`, both compared case-insensitively.
pub fn validate_title(
    title: &str,
    min_len: usize,
    failure_phrases: &[String],
) -> Result<String, ValidationError> {
    let title = title.trim();
    let len = title.chars().count();
    if len < min_len {
        return Err(ValidationError::TooShort { len, min: min_len });
    }

    let lowered = title.to_lowercase();
    if let Some(phrase) = failure_phrases
        .iter()
        .find(|phrase| !phrase.is_empty() && lowered.contains(&phrase.to_lowercase()))
    {
        return Err(ValidationError::FailurePhrase(phrase.clone()));
    }

    Ok(title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::DEFAULT_TITLE_FAILURE_PHRASES;

    fn converse(text: &str) -> String {
        serde_json::json!({
            "output": { "message": { "role": "assistant", "content": [{ "text": text }] } },
            "stopReason": "end_turn"
        })
        .to_string()
    }

    fn phrases() -> Vec<String> {
        DEFAULT_TITLE_FAILURE_PHRASES
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_parse_transcription() {
        let out = parse_stage_response(StageKind::Transcribe, r#"{"text":" hello "}"#).unwrap();
        assert_eq!(out, StageOutput::Transcript("hello".to_string()));
    }

    #[test]
    fn test_transcription_without_text_is_parse_error() {
        let err = parse_stage_response(StageKind::Transcribe, r#"{"words":[]}"#).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                stage: StageKind::Transcribe,
                path: "text"
            }
        );
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = parse_stage_response(StageKind::Summarize, "<html>502</html>").unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson { stage: StageKind::Summarize, .. }));
    }

    #[test]
    fn test_parse_summary_strips_fences() {
        let raw = converse("```markdown\n## Notes\n- scales\n```");
        let out = parse_stage_response(StageKind::Summarize, &raw).unwrap();
        assert_eq!(out, StageOutput::Summary("## Notes\n- scales".to_string()));
    }

    #[test]
    fn test_converse_missing_levels() {
        let cases = [
            (r#"{}"#, "output"),
            (r#"{"output":{}}"#, "output.message"),
            (r#"{"output":{"message":{}}}"#, "output.message.content"),
            (
                r#"{"output":{"message":{"content":[{"image":{}}]}}}"#,
                "output.message.content[].text",
            ),
        ];
        for (raw, expected) in cases {
            match parse_stage_response(StageKind::TitleGenerate, raw) {
                Err(ParseError::MissingField { path, .. }) => assert_eq!(path, expected),
                other => panic!("Expected MissingField({}), got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_title_is_cleaned() {
        let raw = converse("\"Long Tones and Bow Speed\"\n");
        let out = parse_stage_response(StageKind::TitleGenerate, &raw).unwrap();
        assert_eq!(out, StageOutput::Title("Long Tones and Bow Speed".to_string()));
    }

    #[test]
    fn test_strip_code_fences_is_idempotent() {
        let inputs = [
            "```\ncode\n```",
            "  plain text  ",
            "```json\n{\"a\":1}\n```\n\nafter",
            "before\n  ```rust\nfn main() {}\n  ```\n",
            "",
        ];
        for input in inputs {
            let once = strip_code_fences(input);
            assert_eq!(strip_code_fences(&once), once, "input: {:?}", input);
        }
    }

    #[test]
    fn test_strip_keeps_inline_backticks() {
        assert_eq!(strip_code_fences("use `cargo` here"), "use `cargo` here");
    }

    #[test]
    fn test_validate_title_length() {
        assert_eq!(
            validate_title("Jazz", 5, &phrases()),
            Err(ValidationError::TooShort { len: 4, min: 5 })
        );
        assert_eq!(validate_title("Scales", 5, &phrases()).unwrap(), "Scales");
    }

    #[test]
    fn test_validate_title_failure_phrase_case_insensitive() {
        let err = validate_title("No Musical Content Detected", 5, &phrases()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::FailurePhrase("no musical content".to_string())
        );
        assert!(validate_title("UNABLE TO GENERATE a title", 5, &phrases()).is_err());
    }
}
