//! Pipeline
//!
//! Runs one photo through every stage and aggregates the per-note results.

pub mod fallback;
pub mod orchestrator;
pub mod output;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::capture::frame::ImageFormat;
use crate::vision::OcrMode;

pub use fallback::{Diagnostics, FallbackAction, FailurePolicy, Severity, Stage};
pub use orchestrator::{Pipeline, RunState};
pub use output::{NoteResult, NoteStatus, ProcessingOutput, RunStatus, Summary};

/// Known physical layout of the photographed page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutHint {
    /// Pre-printed 3x3 grid of note slots
    #[serde(rename = "grid_3x3")]
    Grid3x3,
}

impl fmt::Display for LayoutHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutHint::Grid3x3 => f.write_str("grid_3x3"),
        }
    }
}

impl FromStr for LayoutHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grid3x3" | "grid_3x3" | "3x3" => Ok(LayoutHint::Grid3x3),
            other => Err(format!("unknown layout {other:?}, expected grid3x3")),
        }
    }
}

/// Caller options for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub ocr_mode: OcrMode,
    /// Keep at most this many notes, in reading order
    pub max_notes: Option<usize>,
    /// Notes scoring below this overall confidence are flagged `partial`
    pub confidence_threshold: Option<f32>,
    pub layout_hint: Option<LayoutHint>,
}

/// One photo and how to process it
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    pub image: Vec<u8>,
    pub format: ImageFormat,
    pub options: ProcessingOptions,
}

impl ProcessingRequest {
    pub fn new(image: Vec<u8>, format: ImageFormat) -> Self {
        Self {
            image,
            format,
            options: ProcessingOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ProcessingOptions) -> Self {
        self.options = options;
        self
    }
}
