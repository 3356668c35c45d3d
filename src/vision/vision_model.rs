//! Vision-capable language model
//!
//! Used for verbatim transcription of note images and for the text-only
//! prompts of later stages (title suggestion, context-aware correction).
//! Calls are billed, so they are made at temperature 0 with a fixed prompt.

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::capture::encode_png;
use crate::config::VisionServiceConfig;
use crate::error::{PipelineError, Result};

const SERVICE: &str = "vision model";

/// Transcription instructions sent with every note image
pub const TRANSCRIPTION_PROMPT: &str = "\
You are transcribing a photo of a single handwritten or printed note.
Transcribe the text exactly as written. Do not summarize, translate or fix spelling.
Keep the original line breaks and these markers exactly as they appear:
- titles wrapped in double hashes, e.g. ## Title ##
- bullets (-, *, •) and numbered items (1. 2. 3.)
- checkboxes: [ ] for open, [x] for done
- tags such as @urgent and ::key:value
Respond with a JSON object only:
{\"text\": \"<transcription>\", \"confidence\": \"high\" | \"medium\" | \"low\", \"illegible_regions\": [\"<short description>\", ...]}";

/// Self-reported transcription certainty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualitativeConfidence {
    High,
    Medium,
    Low,
}

impl QualitativeConfidence {
    /// Base numeric score before text-based adjustments
    pub fn base_score(&self) -> f32 {
        match self {
            Self::High => 0.9,
            Self::Medium => 0.7,
            Self::Low => 0.4,
        }
    }
}

/// A parsed transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionTranscription {
    pub text: String,
    pub confidence: QualitativeConfidence,
    #[serde(default)]
    pub illegible_regions: Vec<String>,
}

/// Vision-capable language model
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Verbatim transcription of a note image
    async fn transcribe(&self, image: &RgbImage) -> Result<VisionTranscription>;

    /// Text-only completion
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// OpenAI-compatible chat completions client
pub struct OpenAiVisionClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiVisionClient {
    /// Build from config; the API key is read from the configured environment variable
    pub fn from_config(config: &VisionServiceConfig) -> Result<Self> {
        if !config.enabled {
            return Err(PipelineError::Config("vision model is disabled".to_string()));
        }
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            PipelineError::Config(format!("environment variable {} is not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
        })
    }

    async fn chat(&self, content: serde_json::Value, json_mode: bool) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": content }],
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::service(
                SERVICE,
                format!("status {}: {}", status, text.chars().take(200).collect::<String>()),
            ));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::service(SERVICE, "response contained no message"))
    }
}

#[async_trait]
impl VisionModel for OpenAiVisionClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn transcribe(&self, image: &RgbImage) -> Result<VisionTranscription> {
        let png = encode_png(&DynamicImage::ImageRgb8(image.clone()))?;
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png)
        );
        let content = json!([
            { "type": "text", "text": TRANSCRIPTION_PROMPT },
            { "type": "image_url", "image_url": { "url": data_url, "detail": "high" } },
        ]);

        let reply = self.chat(content, true).await?;
        debug!("Vision model replied with {} chars", reply.len());
        parse_transcription(&reply)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.chat(json!(prompt), false).await
    }
}

/// Parse the model's JSON reply, tolerating code fences around it
pub fn parse_transcription(reply: &str) -> Result<VisionTranscription> {
    let payload = extract_json_object(reply)
        .ok_or_else(|| PipelineError::service(SERVICE, "reply did not contain a JSON object"))?;
    let mut transcription: VisionTranscription = serde_json::from_str(payload)?;
    transcription.text = transcription.text.trim().to_string();
    if transcription.text.is_empty() && transcription.illegible_regions.is_empty() {
        warn!("Vision model returned an empty transcription");
    }
    Ok(transcription)
}

/// Slice from the first `{` to the last `}`
pub(crate) fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

/// Slice from the first `[` to the last `]`
pub(crate) fn extract_json_array(reply: &str) -> Option<&str> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    (end > start).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_reply() {
        let t = parse_transcription(
            r###"{"text":"## Groceries ##\n- milk","confidence":"high","illegible_regions":[]}"###,
        )
        .unwrap();
        assert_eq!(t.text, "## Groceries ##\n- milk");
        assert_eq!(t.confidence, QualitativeConfidence::High);
        assert!(t.illegible_regions.is_empty());
    }

    #[test]
    fn test_parse_fenced_reply_without_regions() {
        let reply = "```json\n{\"text\": \" call Bob \", \"confidence\": \"low\"}\n```";
        let t = parse_transcription(reply).unwrap();
        assert_eq!(t.text, "call Bob");
        assert_eq!(t.confidence.base_score(), 0.4);
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_transcription("I cannot read this image.").is_err());
        assert!(parse_transcription(r#"{"text":"x","confidence":"certain"}"#).is_err());
    }

    #[test]
    fn test_extract_json_array() {
        assert_eq!(extract_json_array("here: [1, 2] done"), Some("[1, 2]"));
        assert_eq!(extract_json_array("none"), None);
    }

    #[test]
    fn test_disabled_client_is_config_error() {
        let config = VisionServiceConfig {
            enabled: false,
            ..VisionServiceConfig::default()
        };
        assert!(matches!(
            OpenAiVisionClient::from_config(&config),
            Err(PipelineError::Config(_))
        ));
    }
}
