//! Traditional OCR
//!
//! The fast, offline-capable recognizer. Talks to a local recognition
//! server (Tesseract-style word output) over HTTP.

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::BoundingBox;
use crate::capture::encode_png;
use crate::config::OcrServiceConfig;
use crate::error::{PipelineError, Result};

const SERVICE: &str = "ocr";

/// A recognized word
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrWord {
    pub text: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Location in the recognized image, when the engine reports it
    #[serde(default)]
    pub bounds: Option<BoundingBox>,
    /// Zero-based line index
    #[serde(default)]
    pub line: usize,
}

/// Result of one recognition call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub words: Vec<OcrWord>,
}

impl OcrOutput {
    /// Rebuild text from words, one output line per word line
    pub fn from_words(words: Vec<OcrWord>) -> Self {
        let mut text = String::new();
        let mut current_line = None;
        for word in &words {
            match current_line {
                Some(line) if line == word.line => text.push(' '),
                Some(_) => text.push('\n'),
                None => {}
            }
            text.push_str(&word.text);
            current_line = Some(word.line);
        }
        Self { text, words }
    }

    /// Mean word confidence, 0 for no words
    pub fn mean_confidence(&self) -> f32 {
        if self.words.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.words.iter().map(|w| w.confidence).sum();
        (sum / self.words.len() as f32).clamp(0.0, 1.0)
    }
}

/// Traditional text recognizer
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Engine name for processing details
    fn name(&self) -> &str;

    async fn recognize(&self, image: &RgbImage) -> Result<OcrOutput>;
}

/// Recognition server client
pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
    language: String,
}

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    image: String,
    language: &'a str,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    words: Vec<ResponseWord>,
}

#[derive(Deserialize)]
struct ResponseWord {
    text: String,
    confidence: f32,
    #[serde(default)]
    bbox: Option<[u32; 4]>,
    #[serde(default)]
    line: usize,
}

impl HttpOcrClient {
    pub fn from_config(config: &OcrServiceConfig) -> Result<Self> {
        if !config.enabled {
            return Err(PipelineError::Config("traditional OCR is disabled".to_string()));
        }
        if config.endpoint.trim().is_empty() {
            return Err(PipelineError::Config("services.ocr.endpoint is not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl TextRecognizer for HttpOcrClient {
    fn name(&self) -> &str {
        "http-ocr"
    }

    async fn recognize(&self, image: &RgbImage) -> Result<OcrOutput> {
        let png = encode_png(&DynamicImage::ImageRgb8(image.clone()))?;
        let request = RecognizeRequest {
            image: base64::engine::general_purpose::STANDARD.encode(png),
            language: &self.language,
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::service(
                SERVICE,
                format!("status {}: {}", status, body.chars().take(200).collect::<String>()),
            ));
        }

        let body: RecognizeResponse = response.json().await?;
        let output = parse_response(body);
        debug!(
            "OCR returned {} words (mean confidence {:.2})",
            output.words.len(),
            output.mean_confidence()
        );
        Ok(output)
    }
}

fn parse_response(body: RecognizeResponse) -> OcrOutput {
    let words: Vec<OcrWord> = body
        .words
        .into_iter()
        .filter(|w| !w.text.trim().is_empty())
        .map(|w| OcrWord {
            text: w.text,
            confidence: normalize_confidence(w.confidence),
            bounds: w.bbox.map(|[x, y, width, height]| BoundingBox::new(x, y, width, height)),
            line: w.line,
        })
        .collect();

    match body.text {
        Some(text) => OcrOutput {
            text: text.trim().to_string(),
            words,
        },
        None => OcrOutput::from_words(words),
    }
}

/// Engines report either [0, 1] or percentages; negative means "no score"
fn normalize_confidence(raw: f32) -> f32 {
    if raw < 0.0 {
        0.0
    } else if raw > 1.0 {
        (raw / 100.0).min(1.0)
    } else {
        raw
    }
}
