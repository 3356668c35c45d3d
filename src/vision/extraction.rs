//! Hybrid text extraction
//!
//! Runs the traditional recognizer and the vision model concurrently on one
//! note and merges their outputs. The strategy can skip a method when the
//! image is clean printed text or when the caller asks for a single method.
//! A method the caller requires exclusively never degrades silently: its
//! failure is an [`PipelineError::Extraction`].

use image::RgbImage;
use imageproc::contrast::otsu_level;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::merge::{merge_texts, ConflictSpan};
use super::ocr::{OcrOutput, TextRecognizer};
use super::separation::SeparatedNote;
use super::to_gray;
use super::vision_model::{QualitativeConfidence, VisionModel};
use crate::config::{ExtractionConfig, ServicesConfig};
use crate::error::{PipelineError, Result};
use crate::shared::{call_with_policy, CallPolicy};

/// Confidence for recognizer output that carries no word scores
const UNSCORED_CONFIDENCE: f32 = 0.5;

/// Fewer ink runs than this and there is nothing to judge
const MIN_STROKE_RUNS: usize = 20;

/// Which methods the caller allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMode {
    /// Traditional recognizer only
    Traditional,
    /// Vision model only
    Vision,
    /// Pick per note
    #[default]
    Auto,
}

impl fmt::Display for OcrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Traditional => "traditional",
            Self::Vision => "vision",
            Self::Auto => "auto",
        })
    }
}

impl FromStr for OcrMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "traditional" | "ocr" => Ok(Self::Traditional),
            "vision" | "llm" => Ok(Self::Vision),
            "auto" | "hybrid" => Ok(Self::Auto),
            other => Err(format!("unknown OCR mode '{other}'")),
        }
    }
}

/// Which methods actually run for a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    TraditionalOnly,
    VisionOnly,
    Hybrid,
}

impl ExtractionStrategy {
    fn wants_traditional(&self) -> bool {
        matches!(self, Self::TraditionalOnly | Self::Hybrid)
    }

    fn wants_vision(&self) -> bool {
        matches!(self, Self::VisionOnly | Self::Hybrid)
    }
}

/// Origin of an extraction result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    Traditional,
    VisionModel,
    Hybrid,
}

/// Text from one method, or the merge of both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub text: String,
    /// In [0, 1]
    pub confidence: f32,
    pub source: ExtractionSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub illegible_regions: Vec<String>,
}

/// Whether every planned method delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Complete,
    /// A method failed or nothing was read; see warnings
    Degraded,
}

/// Per-word recognizer confidence used to pick correction candidates
#[derive(Debug, Clone, Default)]
pub struct WordConfidences {
    by_word: HashMap<String, f32>,
    fallback: f32,
}

impl WordConfidences {
    pub fn new(fallback: f32) -> Self {
        Self {
            by_word: HashMap::new(),
            fallback,
        }
    }

    /// Record a word; repeated words keep their lowest score
    pub fn insert(&mut self, word: &str, confidence: f32) {
        let key = normalize_word(word);
        if key.is_empty() {
            return;
        }
        let entry = self.by_word.entry(key).or_insert(confidence);
        *entry = entry.min(confidence);
    }

    pub fn get(&self, word: &str) -> f32 {
        self.by_word
            .get(&normalize_word(word))
            .copied()
            .unwrap_or(self.fallback)
    }
}

fn normalize_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Everything text extraction produced for one note
#[derive(Debug, Clone)]
pub struct TextExtraction {
    pub merged: ExtractionResult,
    pub traditional: Option<ExtractionResult>,
    pub vision: Option<ExtractionResult>,
    pub strategy: ExtractionStrategy,
    pub differences: Vec<String>,
    pub conflicts: Vec<ConflictSpan>,
    pub word_confidences: WordConfidences,
    pub status: ExtractionStatus,
    pub warnings: Vec<String>,
    pub ocr_engine: Option<String>,
    pub vision_model: Option<String>,
}

/// Choose the methods to run for one note
pub fn select_strategy(
    mode: OcrMode,
    image_quality: f32,
    handwriting: f32,
    config: &ExtractionConfig,
) -> ExtractionStrategy {
    match mode {
        OcrMode::Traditional => ExtractionStrategy::TraditionalOnly,
        OcrMode::Vision => ExtractionStrategy::VisionOnly,
        OcrMode::Auto
            if image_quality >= config.high_quality_threshold
                && handwriting < config.handwriting_threshold =>
        {
            ExtractionStrategy::TraditionalOnly
        }
        OcrMode::Auto => ExtractionStrategy::Hybrid,
    }
}

/// Likelihood in [0, 1] that the note is handwritten
///
/// Printed glyphs have near-constant stroke widths. The coefficient of
/// variation of horizontal and vertical ink run lengths is mapped onto
/// [0, 1]; irregular runs read as handwriting.
pub fn handwriting_likelihood(image: &RgbImage) -> f32 {
    let gray = to_gray(image);
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }

    let level = otsu_level(&gray);
    let dark = gray.pixels().filter(|p| p[0] <= level).count();
    // Ink is the minority side of the split
    let ink_is_dark = dark * 2 <= (width * height) as usize;
    let is_ink = |x: u32, y: u32| (gray.get_pixel(x, y)[0] <= level) == ink_is_dark;

    let max_run = (width.min(height) / 4).max(3);
    let mut horizontal = Vec::new();
    for y in 0..height {
        let mut run = 0u32;
        for x in 0..width {
            if is_ink(x, y) {
                run += 1;
            } else if run > 0 {
                horizontal.push(run);
                run = 0;
            }
        }
        if run > 0 {
            horizontal.push(run);
        }
    }
    let mut vertical = Vec::new();
    for x in 0..width {
        let mut run = 0u32;
        for y in 0..height {
            if is_ink(x, y) {
                run += 1;
            } else if run > 0 {
                vertical.push(run);
                run = 0;
            }
        }
        if run > 0 {
            vertical.push(run);
        }
    }

    horizontal.retain(|r| *r <= max_run);
    vertical.retain(|r| *r <= max_run);
    if horizontal.len() + vertical.len() < MIN_STROKE_RUNS {
        return 0.0;
    }

    let cv = (coefficient_of_variation(&horizontal) + coefficient_of_variation(&vertical)) / 2.0;
    ((cv - 0.25) / 0.5).clamp(0.0, 1.0)
}

fn coefficient_of_variation(runs: &[u32]) -> f32 {
    if runs.is_empty() {
        return 0.0;
    }
    let n = runs.len() as f32;
    let mean = runs.iter().map(|&r| r as f32).sum::<f32>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = runs.iter().map(|&r| (r as f32 - mean).powi(2)).sum::<f32>() / n;
    variance.sqrt() / mean
}

/// Numeric confidence for a vision transcription
pub fn vision_confidence(text: &str, reported: QualitativeConfidence, config: &ExtractionConfig) -> f32 {
    if text.trim().is_empty() {
        return 0.0;
    }
    let mut score = reported.base_score();

    let words = text.split_whitespace().count();
    if words < config.short_text_words {
        score -= config.short_text_penalty;
    } else if words < config.brief_text_words {
        score -= config.brief_text_penalty;
    }

    if text.contains("##") {
        score += config.structure_bonus;
    }
    if text.lines().any(is_list_line) {
        score += config.structure_bonus;
    }
    if ["[ ]", "[x]", "[X]", "☐", "☑"].iter().any(|m| text.contains(m)) {
        score += config.structure_bonus;
    }

    score.clamp(0.0, 1.0)
}

fn is_list_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with(['•', '-', '*']) {
        return true;
    }
    trimmed
        .split_once(". ")
        .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Confidence of a merged result
pub fn hybrid_confidence(traditional: f32, vision: f32, config: &ExtractionConfig) -> f32 {
    (config.vision_weight * vision + config.traditional_weight * traditional).clamp(0.0, 1.0)
}

/// Text extraction stage
pub struct TextExtractor<'a> {
    config: &'a ExtractionConfig,
    services: &'a ServicesConfig,
    recognizer: Option<&'a dyn TextRecognizer>,
    vision: Option<&'a dyn VisionModel>,
}

impl<'a> TextExtractor<'a> {
    pub fn new(
        config: &'a ExtractionConfig,
        services: &'a ServicesConfig,
        recognizer: Option<&'a dyn TextRecognizer>,
        vision: Option<&'a dyn VisionModel>,
    ) -> Self {
        Self {
            config,
            services,
            recognizer,
            vision,
        }
    }

    /// Extract text from one note
    ///
    /// `image_quality` is the overall quality of the source photo. In `Auto`
    /// mode a failed or unavailable method degrades to the other one with a
    /// warning; in a single-method mode it is an error.
    pub async fn extract(
        &self,
        note: &SeparatedNote,
        mode: OcrMode,
        image_quality: f32,
        cancel: &CancellationToken,
    ) -> Result<TextExtraction> {
        let mut warnings = Vec::new();
        let handwriting = handwriting_likelihood(&note.image);
        let mut strategy = select_strategy(mode, image_quality, handwriting, self.config);
        debug!(
            "{}: strategy {:?} (quality {:.2}, handwriting {:.2})",
            note.note_id, strategy, image_quality, handwriting
        );

        if mode == OcrMode::Auto {
            strategy = self.fit_to_available(strategy, &mut warnings)?;
        } else {
            self.require_available(strategy)?;
        }

        let image = &note.image;
        let traditional_call = async {
            match self.recognizer {
                Some(recognizer) if strategy.wants_traditional() => {
                    Some(self.run_traditional(recognizer, image, cancel).await)
                }
                _ => None,
            }
        };
        let vision_call = async {
            match self.vision {
                Some(model) if strategy.wants_vision() => Some(self.run_vision(model, image, cancel).await),
                _ => None,
            }
        };
        let (mut traditional, mut vision) = tokio::join!(traditional_call, vision_call);

        if matches!(traditional, Some(Err(PipelineError::Cancelled)))
            || matches!(vision, Some(Err(PipelineError::Cancelled)))
        {
            return Err(PipelineError::Cancelled);
        }

        // Auto mode with a single method planned: fall back to the other one
        if mode == OcrMode::Auto {
            if strategy == ExtractionStrategy::TraditionalOnly && matches!(traditional, Some(Err(_))) {
                if let Some(model) = self.vision {
                    warnings.push(format!(
                        "traditional OCR failed ({}), falling back to the vision model",
                        error_text(&traditional)
                    ));
                    vision = Some(self.run_vision(model, image, cancel).await);
                    if matches!(vision, Some(Err(PipelineError::Cancelled))) {
                        return Err(PipelineError::Cancelled);
                    }
                }
            } else if strategy == ExtractionStrategy::VisionOnly && matches!(vision, Some(Err(_))) {
                if let Some(recognizer) = self.recognizer {
                    warnings.push(format!(
                        "vision model failed ({}), falling back to traditional OCR",
                        error_text(&vision)
                    ));
                    traditional = Some(self.run_traditional(recognizer, image, cancel).await);
                    if matches!(traditional, Some(Err(PipelineError::Cancelled))) {
                        return Err(PipelineError::Cancelled);
                    }
                }
            }
        }

        self.combine(note, mode, strategy, traditional, vision, warnings)
    }

    /// Drop methods that have no client configured
    fn fit_to_available(
        &self,
        strategy: ExtractionStrategy,
        warnings: &mut Vec<String>,
    ) -> Result<ExtractionStrategy> {
        match (self.recognizer.is_some(), self.vision.is_some()) {
            (false, false) => Err(PipelineError::Extraction(
                "no text recognizer or vision model is configured".to_string(),
            )),
            (true, false) if strategy.wants_vision() => {
                warnings.push("vision model unavailable, using traditional OCR only".to_string());
                Ok(ExtractionStrategy::TraditionalOnly)
            }
            (false, true) if strategy.wants_traditional() => {
                warnings.push("traditional OCR unavailable, using the vision model only".to_string());
                Ok(ExtractionStrategy::VisionOnly)
            }
            _ => Ok(strategy),
        }
    }

    fn require_available(&self, strategy: ExtractionStrategy) -> Result<()> {
        if strategy.wants_vision() && self.vision.is_none() {
            return Err(PipelineError::Extraction(
                "vision mode requested but no vision model is configured".to_string(),
            ));
        }
        if strategy.wants_traditional() && self.recognizer.is_none() {
            return Err(PipelineError::Extraction(
                "traditional mode requested but no OCR service is configured".to_string(),
            ));
        }
        Ok(())
    }

    fn combine(
        &self,
        note: &SeparatedNote,
        mode: OcrMode,
        strategy: ExtractionStrategy,
        traditional: Option<Result<(ExtractionResult, OcrOutput)>>,
        vision: Option<Result<ExtractionResult>>,
        mut warnings: Vec<String>,
    ) -> Result<TextExtraction> {
        let (traditional, ocr_output) = match traditional {
            Some(Ok((result, output))) => (Some(result), Some(output)),
            Some(Err(err)) => {
                if mode == OcrMode::Traditional {
                    return Err(PipelineError::Extraction(format!(
                        "traditional OCR failed in traditional mode: {err}"
                    )));
                }
                warn!("{}: traditional OCR failed: {}", note.note_id, err);
                warnings.push(format!("traditional OCR failed: {err}"));
                (None, None)
            }
            None => (None, None),
        };
        let vision = match vision {
            Some(Ok(result)) => Some(result),
            Some(Err(err)) => {
                if mode == OcrMode::Vision {
                    return Err(PipelineError::Extraction(format!(
                        "vision model failed in vision mode: {err}"
                    )));
                }
                warn!("{}: vision model failed: {}", note.note_id, err);
                warnings.push(format!("vision model failed: {err}"));
                None
            }
            None => None,
        };

        let (merged, differences, conflicts) = match (&traditional, &vision) {
            (Some(t), Some(v)) => {
                let outcome = merge_texts(&t.text, &v.text, &self.config.noise);
                let merged = ExtractionResult {
                    text: outcome.text.trim().to_string(),
                    confidence: hybrid_confidence(t.confidence, v.confidence, self.config),
                    source: ExtractionSource::Hybrid,
                    illegible_regions: v.illegible_regions.clone(),
                };
                (merged, outcome.differences(), outcome.conflicts)
            }
            (Some(t), None) => (t.clone(), Vec::new(), Vec::new()),
            (None, Some(v)) => (v.clone(), Vec::new(), Vec::new()),
            (None, None) => {
                return Err(PipelineError::Extraction(
                    "every text extraction method failed".to_string(),
                ))
            }
        };

        let mut word_confidences = WordConfidences::new(
            vision.as_ref().map_or(UNSCORED_CONFIDENCE, |v| v.confidence),
        );
        if let Some(output) = &ocr_output {
            for word in &output.words {
                word_confidences.insert(&word.text, word.confidence);
            }
        }

        if merged.text.is_empty() {
            warnings.push("no text was recognized on this note".to_string());
        }
        let status = if warnings.is_empty() {
            ExtractionStatus::Complete
        } else {
            ExtractionStatus::Degraded
        };

        info!(
            "{}: extracted {} chars via {:?} (confidence {:.2}, {} difference(s))",
            note.note_id,
            merged.text.len(),
            merged.source,
            merged.confidence,
            differences.len()
        );

        Ok(TextExtraction {
            merged,
            ocr_engine: traditional
                .as_ref()
                .and(self.recognizer.map(|r| r.name().to_string())),
            vision_model: vision
                .as_ref()
                .and(self.vision.map(|v| v.model_name().to_string())),
            traditional,
            vision,
            strategy,
            differences,
            conflicts,
            word_confidences,
            status,
            warnings,
        })
    }

    async fn run_traditional(
        &self,
        recognizer: &dyn TextRecognizer,
        image: &RgbImage,
        cancel: &CancellationToken,
    ) -> Result<(ExtractionResult, OcrOutput)> {
        let policy = CallPolicy::for_ocr(&self.services.ocr, self.services.retry_backoff_ms);
        let output = call_with_policy(&policy, cancel, || recognizer.recognize(image)).await?;
        let confidence = if output.words.is_empty() && !output.text.is_empty() {
            UNSCORED_CONFIDENCE
        } else {
            output.mean_confidence()
        };
        let result = ExtractionResult {
            text: output.text.trim().to_string(),
            confidence,
            source: ExtractionSource::Traditional,
            illegible_regions: Vec::new(),
        };
        Ok((result, output))
    }

    async fn run_vision(
        &self,
        model: &dyn VisionModel,
        image: &RgbImage,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let policy = CallPolicy::for_vision(&self.services.vision, self.services.retry_backoff_ms);
        let transcription = call_with_policy(&policy, cancel, || model.transcribe(image)).await?;
        if transcription.text.trim().is_empty() {
            return Err(PipelineError::Extraction(
                "vision model returned no text".to_string(),
            ));
        }
        Ok(ExtractionResult {
            confidence: vision_confidence(&transcription.text, transcription.confidence, self.config),
            text: transcription.text,
            source: ExtractionSource::VisionModel,
            illegible_regions: transcription.illegible_regions,
        })
    }
}

fn error_text<T>(outcome: &Option<Result<T>>) -> String {
    match outcome {
        Some(Err(err)) => err.to_string(),
        _ => "no result".to_string(),
    }
}
