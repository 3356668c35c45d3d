//! Pipeline Configuration
//!
//! Thresholds, weights, palettes and service endpoints stored in TOML format.
//! Loaded once per process and handed to every stage by reference.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

const WEIGHT_TOLERANCE: f32 = 1e-4;

/// Pipeline settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input acceptance limits
    pub validation: ValidationConfig,
    /// Denoise, contrast and deskew settings
    pub preprocess: PreprocessConfig,
    /// Note region detection
    pub separation: SeparationConfig,
    /// Colors, codes and categories
    pub metadata: MetadataConfig,
    /// Hybrid text extraction
    pub extraction: ExtractionConfig,
    /// Title, list and tag recognition
    pub structure: StructureConfig,
    /// Correction and normalization
    pub postprocess: PostProcessConfig,
    /// Composite confidence
    pub scoring: ScoringConfig,
    /// External recognition services
    pub services: ServicesConfig,
}

impl PipelineConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        let v = &self.validation;
        if v.min_dimension == 0 || v.min_dimension > v.max_dimension {
            return Err(PipelineError::Config(format!(
                "validation.min_dimension ({}) must be positive and not exceed max_dimension ({})",
                v.min_dimension, v.max_dimension
            )));
        }

        let q = &self.preprocess.quality_weights;
        check_weights(
            "preprocess.quality_weights",
            &[q.blur, q.contrast, q.brightness, q.resolution],
        )?;

        let s = &self.scoring;
        check_weights(
            "scoring",
            &[s.image_weight, s.extraction_weight, s.structure_weight],
        )?;

        let e = &self.extraction;
        check_weights(
            "extraction",
            &[e.vision_weight, e.traditional_weight],
        )?;

        let sep = &self.separation;
        if sep.min_area_ratio >= sep.max_area_ratio {
            return Err(PipelineError::Config(
                "separation.min_area_ratio must be below max_area_ratio".to_string(),
            ));
        }
        if sep.min_aspect_ratio >= sep.max_aspect_ratio {
            return Err(PipelineError::Config(
                "separation.min_aspect_ratio must be below max_aspect_ratio".to_string(),
            ));
        }
        if sep.min_corners > sep.max_corners {
            return Err(PipelineError::Config(
                "separation.min_corners must not exceed max_corners".to_string(),
            ));
        }

        if self.metadata.clusters == 0 {
            return Err(PipelineError::Config(
                "metadata.clusters must be at least 1".to_string(),
            ));
        }
        for entry in &self.metadata.palette {
            if (0..3).any(|c| entry.lower[c] > entry.upper[c]) {
                return Err(PipelineError::Config(format!(
                    "palette entry '{}' has a lower bound above its upper bound",
                    entry.name
                )));
            }
        }

        if self.services.vision.max_retries > 1 {
            return Err(PipelineError::Config(
                "services.vision.max_retries must be 0 or 1".to_string(),
            ));
        }
        if self.services.max_concurrent_notes == 0 {
            return Err(PipelineError::Config(
                "services.max_concurrent_notes must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_weights(section: &str, weights: &[f32]) -> std::result::Result<(), PipelineError> {
    if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
        return Err(PipelineError::Config(format!(
            "{section} weights must each lie in [0, 1]"
        )));
    }
    let sum: f32 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(PipelineError::Config(format!(
            "{section} weights must sum to 1.0, got {sum}"
        )));
    }
    Ok(())
}

/// Input acceptance limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Smallest accepted width and height in pixels
    pub min_dimension: u32,
    /// Largest accepted width and height in pixels
    pub max_dimension: u32,
    /// Largest accepted encoded size
    pub max_size_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_dimension: 100,
            max_dimension: 4096,
            max_size_bytes: 25 * 1024 * 1024,
        }
    }
}

/// Relative weight of each quality sub-score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub blur: f32,
    pub contrast: f32,
    pub brightness: f32,
    pub resolution: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            blur: 0.3,
            contrast: 0.3,
            brightness: 0.2,
            resolution: 0.2,
        }
    }
}

/// Preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Median filter radius used for denoising (0 disables)
    pub denoise_radius: u32,
    /// CLAHE clip limit, relative to the mean histogram bin height
    pub clahe_clip_limit: f32,
    /// CLAHE tiles per side
    pub clahe_tile_grid: u32,
    /// Skew below this many degrees is left alone
    pub deskew_min_angle: f32,
    /// Foreground points sampled for the skew estimate
    pub deskew_sample_limit: usize,
    /// Laplacian variance mapped to a blur score of 1.0
    pub blur_normalizer: f32,
    /// Intensity std-dev mapped to a contrast score of 1.0
    pub contrast_normalizer: f32,
    /// Pixel count mapped to a resolution score of 1.0
    pub resolution_normalizer: f32,
    pub quality_weights: QualityWeights,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            denoise_radius: 1,
            clahe_clip_limit: 2.0,
            clahe_tile_grid: 8,
            deskew_min_angle: 1.0,
            deskew_sample_limit: 50_000,
            blur_normalizer: 100.0,
            contrast_normalizer: 127.5,
            resolution_normalizer: 1_000_000.0,
            quality_weights: QualityWeights::default(),
        }
    }
}

/// Note region detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Images are scaled down to this long side before contour search
    pub working_max_dimension: u32,
    /// Gaussian blur applied before binarization
    pub blur_sigma: f32,
    /// Half-size of the adaptive threshold window
    pub threshold_block_radius: u32,
    /// Subtracted from the local mean to form the threshold
    pub threshold_offset: f32,
    /// Windows with a lower intensity std-dev fall back to the global level
    pub flat_region_std: f32,
    /// Largest allowed distance between a local threshold and the global level
    pub adaptive_band: f32,
    /// Morphological closing radius
    pub close_radius: u8,
    pub min_area_ratio: f32,
    pub max_area_ratio: f32,
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    /// Minimum width and height in source pixels
    pub min_side: u32,
    /// Polygon approximation tolerance as a fraction of the perimeter
    pub approx_epsilon_ratio: f64,
    pub min_corners: usize,
    pub max_corners: usize,
    /// Regions overlapping more than this IoU are split or suppressed
    pub overlap_threshold: f32,
    /// Distance-transform peaks above this fraction of the maximum seed watershed markers
    pub watershed_peak_ratio: f32,
    /// Minimum share of its minimum-area rectangle a contour must fill
    pub min_rect_fill: f32,
    /// Minimum share of its bounding box a watershed segment must fill
    pub min_segment_fill: f32,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            working_max_dimension: 1024,
            blur_sigma: 1.5,
            threshold_block_radius: 15,
            threshold_offset: 5.0,
            flat_region_std: 12.0,
            adaptive_band: 40.0,
            close_radius: 2,
            min_area_ratio: 0.01,
            max_area_ratio: 0.95,
            min_aspect_ratio: 0.3,
            max_aspect_ratio: 3.0,
            min_side: 50,
            approx_epsilon_ratio: 0.02,
            min_corners: 4,
            max_corners: 8,
            overlap_threshold: 0.1,
            watershed_peak_ratio: 0.75,
            min_rect_fill: 0.85,
            min_segment_fill: 0.6,
        }
    }
}

/// Named color with an inclusive RGB range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub name: String,
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl PaletteEntry {
    fn new(name: &str, lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self {
            name: name.to_string(),
            lower,
            upper,
        }
    }

    /// Inclusive membership on every channel
    pub fn contains(&self, rgb: [u8; 3]) -> bool {
        (0..3).all(|c| self.lower[c] <= rgb[c] && rgb[c] <= self.upper[c])
    }
}

/// Keywords in decoded code payloads that override the color category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordCategory {
    pub category: String,
    pub keywords: Vec<String>,
}

/// Visual metadata settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// k for dominant color clustering
    pub clusters: usize,
    pub kmeans_iterations: usize,
    /// Pixels sampled for clustering
    pub sample_limit: usize,
    /// Rows and columns sampled at each edge for the background color
    pub edge_width: u32,
    /// Named colors, first match wins
    pub palette: Vec<PaletteEntry>,
    /// Color name to category
    pub categories: BTreeMap<String, String>,
    pub keyword_categories: Vec<KeywordCategory>,
    /// Used when the color has no mapped category
    pub default_category: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        let categories = [
            ("yellow", "general"),
            ("pink", "urgent"),
            ("blue", "work"),
            ("green", "personal"),
            ("orange", "ideas"),
            ("white", "notes"),
            ("gray", "archive"),
        ]
        .into_iter()
        .map(|(color, category)| (color.to_string(), category.to_string()))
        .collect();

        let keyword_categories = [
            ("work", &["work", "business", "office"][..]),
            ("urgent", &["urgent", "priority", "asap"][..]),
            ("personal", &["personal", "home", "family"][..]),
            ("ideas", &["idea", "brainstorm", "creative"][..]),
        ]
        .into_iter()
        .map(|(category, words)| KeywordCategory {
            category: category.to_string(),
            keywords: words.iter().map(|w| w.to_string()).collect(),
        })
        .collect();

        Self {
            clusters: 5,
            kmeans_iterations: 20,
            sample_limit: 10_000,
            edge_width: 2,
            palette: vec![
                PaletteEntry::new("yellow", [200, 200, 0], [255, 255, 180]),
                PaletteEntry::new("pink", [255, 150, 150], [255, 220, 220]),
                PaletteEntry::new("blue", [100, 150, 200], [180, 220, 255]),
                PaletteEntry::new("green", [150, 200, 150], [200, 255, 200]),
                PaletteEntry::new("orange", [255, 150, 50], [255, 220, 150]),
                PaletteEntry::new("white", [240, 240, 240], [255, 255, 255]),
                PaletteEntry::new("gray", [150, 150, 150], [200, 200, 200]),
            ],
            categories,
            keyword_categories,
            default_category: "general".to_string(),
        }
    }
}

/// Heuristics deciding whether a traditional-only span is recognition noise
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseRules {
    /// Share of characters outside word, space and common punctuation
    pub max_unusual_char_ratio: f32,
    /// Any longer word marks the span as noise
    pub max_word_length: usize,
    /// Share of single-character words
    pub max_single_char_ratio: f32,
}

impl Default for NoiseRules {
    fn default() -> Self {
        Self {
            max_unusual_char_ratio: 0.3,
            max_word_length: 20,
            max_single_char_ratio: 0.5,
        }
    }
}

/// Hybrid text extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Notes at or above this quality skip the vision model when no handwriting is seen
    pub high_quality_threshold: f32,
    /// Handwriting likelihood at or above this forces hybrid extraction
    pub handwriting_threshold: f32,
    pub vision_weight: f32,
    pub traditional_weight: f32,
    /// Fewer words than this gets the short text penalty
    pub short_text_words: usize,
    pub short_text_penalty: f32,
    /// Fewer words than this (but not short) gets the brief text penalty
    pub brief_text_words: usize,
    pub brief_text_penalty: f32,
    /// Added per structural marker kind present in vision output
    pub structure_bonus: f32,
    pub noise: NoiseRules,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            high_quality_threshold: 0.85,
            handwriting_threshold: 0.5,
            vision_weight: 0.7,
            traditional_weight: 0.3,
            short_text_words: 3,
            short_text_penalty: 0.2,
            brief_text_words: 10,
            brief_text_penalty: 0.1,
            structure_bonus: 0.05,
            noise: NoiseRules::default(),
        }
    }
}

/// Structure recognition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Ask the language model for a title when no pattern matches
    pub llm_title_fallback: bool,
    /// Width of the edge strips inspected for hand-drawn title marks
    pub edge_mark_strip_ratio: f32,
    /// Minimum dark-pixel density inside a strip to count as a mark
    pub edge_mark_min_density: f32,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            llm_title_fallback: true,
            edge_mark_strip_ratio: 0.15,
            edge_mark_min_density: 0.02,
        }
    }
}

/// A visually confusable glyph or bigram and its replacements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionEntry {
    pub from: String,
    pub to: Vec<String>,
}

/// Correction and normalization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Words below this confidence may become correction candidates
    pub candidate_threshold: f32,
    /// Model corrections must exceed this confidence to be applied
    pub apply_threshold: f32,
    /// Confidence assumed for words no recognizer scored
    pub default_word_confidence: f32,
    /// Shorter words are never candidates
    pub min_word_length: usize,
    pub max_alternatives: usize,
    pub confusions: Vec<ConfusionEntry>,
    /// Extra words accepted by the dictionary check
    pub extra_words: Vec<String>,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        let confusions = [
            ("l", &["i", "1"][..]),
            ("i", &["l", "1"][..]),
            ("1", &["l", "i"][..]),
            ("|", &["l", "i"][..]),
            ("0", &["o"][..]),
            ("o", &["0"][..]),
            ("5", &["s"][..]),
            ("$", &["s"][..]),
            ("s", &["5"][..]),
            ("8", &["b"][..]),
            ("b", &["8"][..]),
            ("2", &["z"][..]),
            ("z", &["2"][..]),
            ("rn", &["m"][..]),
            ("m", &["rn"][..]),
            ("vv", &["w"][..]),
            ("w", &["vv"][..]),
            ("cl", &["d"][..]),
            ("d", &["cl"][..]),
            ("nn", &["m"][..]),
            ("li", &["h"][..]),
            ("e", &["c"][..]),
            ("c", &["e"][..]),
            ("u", &["v"][..]),
            ("v", &["u"][..]),
        ]
        .into_iter()
        .map(|(from, to)| ConfusionEntry {
            from: from.to_string(),
            to: to.iter().map(|s| s.to_string()).collect(),
        })
        .collect();

        Self {
            candidate_threshold: 0.8,
            apply_threshold: 0.8,
            default_word_confidence: 0.5,
            min_word_length: 3,
            max_alternatives: 5,
            confusions,
            extra_words: Vec::new(),
        }
    }
}

/// Increments that make up the structure clarity score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClarityIncrements {
    pub base: f32,
    pub title: f32,
    pub lists: f32,
    pub tags: f32,
    pub todos: f32,
}

impl Default for ClarityIncrements {
    fn default() -> Self {
        Self {
            base: 0.2,
            title: 0.3,
            lists: 0.2,
            tags: 0.15,
            todos: 0.15,
        }
    }
}

/// Composite confidence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub image_weight: f32,
    pub extraction_weight: f32,
    pub structure_weight: f32,
    pub clarity: ClarityIncrements,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            image_weight: 0.2,
            extraction_weight: 0.6,
            structure_weight: 0.2,
            clarity: ClarityIncrements::default(),
        }
    }
}

/// Vision-capable language model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionServiceConfig {
    pub enabled: bool,
    /// Chat completions URL
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    /// Billed calls are retried at most once
    pub max_retries: u32,
}

impl Default for VisionServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 2000,
            timeout_ms: 60_000,
            max_retries: 1,
        }
    }
}

/// Traditional OCR endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrServiceConfig {
    /// Traditional OCR runs only when enabled
    pub enabled: bool,
    /// Recognition server URL
    pub endpoint: String,
    pub language: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for OcrServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://127.0.0.1:8884/ocr".to_string(),
            language: "eng".to_string(),
            timeout_ms: 15_000,
            max_retries: 2,
        }
    }
}

/// External service and scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub vision: VisionServiceConfig,
    pub ocr: OcrServiceConfig,
    /// Whole-run deadline; notes unfinished by then are reported as missing
    pub run_timeout_ms: Option<u64>,
    /// Notes processed at the same time
    pub max_concurrent_notes: usize,
    /// Base delay between retries, doubled per attempt
    pub retry_backoff_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            vision: VisionServiceConfig::default(),
            ocr: OcrServiceConfig::default(),
            run_timeout_ms: Some(180_000),
            max_concurrent_notes: 4,
            retry_backoff_ms: 250,
        }
    }
}

/// Default config location (`<config_dir>/config.toml`)
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "notescan", "NoteScan")
        .context("Failed to determine config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

/// Load configuration from file and validate it
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: PipelineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &PipelineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load from an explicit path, else the default location, else built-in defaults
pub fn load_or_default(path: Option<&Path>) -> Result<PipelineConfig> {
    if let Some(path) = path {
        return load_config(path);
    }
    match default_config_path() {
        Ok(default_path) if default_path.exists() => load_config(&default_path),
        _ => Ok(PipelineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.validation.max_dimension, 4096);
        assert_eq!(config.metadata.palette.len(), 7);
        assert_eq!(config.metadata.palette[0].name, "yellow");
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = PipelineConfig::default();
        config.scoring.image_weight = 0.3;
        config.scoring.extraction_weight = 0.5;
        config.services.ocr.enabled = false;

        let file = NamedTempFile::new().unwrap();
        save_config(&config, file.path()).unwrap();

        let loaded = load_config(file.path()).unwrap();
        assert!((loaded.scoring.image_weight - 0.3).abs() < f32::EPSILON);
        assert!(!loaded.services.ocr.enabled);
        assert_eq!(loaded.services.ocr.endpoint, "http://127.0.0.1:8884/ocr");
        assert_eq!(loaded.metadata.categories.get("pink").map(String::as_str), Some("urgent"));
    }

    #[test]
    fn test_ocr_can_be_disabled_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[services.ocr]\nenabled = false").unwrap();

        let loaded = load_config(file.path()).unwrap();
        assert!(!loaded.services.ocr.enabled);
        assert!(PipelineConfig::default().services.ocr.enabled);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[separation]\nmin_side = 80").unwrap();

        let loaded = load_config(file.path()).unwrap();
        assert_eq!(loaded.separation.min_side, 80);
        assert_eq!(loaded.separation.max_corners, 8);
        assert_eq!(loaded.postprocess.apply_threshold, 0.8);
    }

    #[test]
    fn test_config_not_found() {
        let result = load_config(Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not valid toml {{{{").unwrap();

        let result = load_config(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = PipelineConfig::default();
        config.scoring.structure_weight = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scoring"));

        let mut config = PipelineConfig::default();
        config.extraction.vision_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weight_sum_tolerance() {
        let mut config = PipelineConfig::default();
        config.scoring.image_weight = 0.1;
        config.scoring.extraction_weight = 0.7;
        config.scoring.structure_weight = 0.2;
        assert!(config.validate().is_ok());

        config.scoring.structure_weight = 0.201;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vision_retries_capped() {
        let mut config = PipelineConfig::default();
        config.services.vision.max_retries = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_palette_membership_is_inclusive() {
        let config = MetadataConfig::default();
        let white = &config.palette[5];
        assert!(white.contains([240, 240, 240]));
        assert!(white.contains([255, 255, 255]));
        assert!(!white.contains([239, 240, 240]));
    }
}
