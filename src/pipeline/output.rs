//! Run result types
//!
//! [`ProcessingOutput`] is the only value handed back to callers. It is built
//! once at the end of a run and serialized as JSON by the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::analysis::{Correction, ConfidenceReport, Section, StructureAnalysis, Title};
use crate::capture::frame::ImageFormat;
use crate::capture::IngestedImage;
use crate::vision::extraction::ExtractionStrategy;
use crate::vision::{
    BoundingBox, DetectionMethod, ExtractionSource, QualityMetrics, RelativePosition, VisualMetadata,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Facts about the submitted image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub dimensions: Dimensions,
    pub size_bytes: usize,
    pub format: ImageFormat,
    /// SHA-256 of the encoded bytes, lowercase hex
    pub sha256: String,
    pub color_type: String,
}

impl ImageMetadata {
    pub fn from_ingested(image: &IngestedImage) -> Self {
        let (width, height) = image.raw.dimensions();
        Self {
            dimensions: Dimensions { width, height },
            size_bytes: image.raw.size_bytes(),
            format: image.raw.format(),
            sha256: image.raw.sha256_hex(),
            color_type: image.color_type(),
        }
    }
}

/// Final text of one note
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteText {
    pub raw: String,
    pub formatted: String,
    /// `None` when no method produced text
    pub extraction_method: Option<ExtractionSource>,
    pub confidence: f32,
    /// Per-method outputs kept for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traditional: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub illegible_regions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteStructure {
    pub title: Option<Title>,
    pub sections: Vec<Section>,
    pub has_title: bool,
    pub has_lists: bool,
    pub has_todos: bool,
    pub has_tags: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteTags {
    pub simple: Vec<String>,
    pub key_value: BTreeMap<String, String>,
}

/// Splits an analysis into the structure and tag views of the output
pub fn split_analysis(analysis: StructureAnalysis) -> (NoteStructure, NoteTags) {
    let structure = NoteStructure {
        title: analysis.title,
        sections: analysis.sections,
        has_title: analysis.has_title,
        has_lists: analysis.has_lists,
        has_todos: analysis.has_todos,
        has_tags: analysis.has_tags,
    };
    let tags = NoteTags {
        simple: analysis.simple_tags,
        key_value: analysis.key_value_tags,
    };
    (structure, tags)
}

impl NoteStructure {
    pub fn todo_count(&self) -> usize {
        self.sections
            .iter()
            .map(|s| match s {
                Section::TodoList { items, .. } => items.len(),
                _ => 0,
            })
            .sum()
    }
}

impl NoteTags {
    pub fn count(&self) -> usize {
        self.simple.len() + self.key_value.len()
    }
}

/// How a note was processed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingDetails {
    pub steps_applied: Vec<String>,
    pub extraction_strategy: Option<ExtractionStrategy>,
    pub ocr_engine: Option<String>,
    pub vision_model: Option<String>,
    /// Differences the hybrid merge resolved
    pub differences: Vec<String>,
    pub correction_candidates: usize,
    pub corrections_applied: usize,
    pub corrections: Vec<Correction>,
    pub processing_time_ms: u64,
}

/// Everything learned about one note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteResult {
    pub note_id: String,
    pub status: NoteStatus,
    pub bounding_box: BoundingBox,
    pub relative_position: RelativePosition,
    pub rotation_angle: f32,
    pub detection_method: DetectionMethod,
    pub detection_confidence: f32,
    pub visual_metadata: Option<VisualMetadata>,
    pub text: NoteText,
    pub structure: NoteStructure,
    pub tags: NoteTags,
    pub confidence_report: ConfidenceReport,
    pub processing_details: ProcessingDetails,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_notes: usize,
    pub total_todos: usize,
    pub total_tags: usize,
    pub total_codes: usize,
    /// Mean overall confidence of notes that produced text, 0 if none did
    pub average_confidence: f32,
    pub status: RunStatus,
}

impl Summary {
    pub fn from_notes(notes: &[NoteResult], status: RunStatus) -> Self {
        let scored: Vec<f32> = notes
            .iter()
            .filter(|n| n.status != NoteStatus::Failed)
            .map(|n| n.confidence_report.overall)
            .collect();
        let average_confidence = if scored.is_empty() {
            0.0
        } else {
            scored.iter().sum::<f32>() / scored.len() as f32
        };

        Self {
            total_notes: notes.len(),
            total_todos: notes.iter().map(|n| n.structure.todo_count()).sum(),
            total_tags: notes.iter().map(|n| n.tags.count()).sum(),
            total_codes: notes
                .iter()
                .filter_map(|n| n.visual_metadata.as_ref())
                .map(|m| m.codes.len())
                .sum(),
            average_confidence,
            status,
        }
    }
}

/// Result of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutput {
    pub run_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub processing_time_ms: u64,
    /// Absent when the image failed validation
    pub image_metadata: Option<ImageMetadata>,
    pub quality: Option<QualityMetrics>,
    pub processing_applied: Vec<String>,
    pub notes: Vec<NoteResult>,
    pub summary: Summary,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProcessingOutput {
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{structure::ListItem, TodoItem};
    use crate::config::ScoringConfig;

    fn note(status: NoteStatus, overall_inputs: (f32, f32, f32)) -> NoteResult {
        let (iq, ec, sc) = overall_inputs;
        NoteResult {
            note_id: "note_001".into(),
            status,
            bounding_box: BoundingBox::new(0, 0, 10, 10),
            relative_position: RelativePosition::Center,
            rotation_angle: 0.0,
            detection_method: DetectionMethod::Contour,
            detection_confidence: 0.9,
            visual_metadata: None,
            text: NoteText::default(),
            structure: NoteStructure::default(),
            tags: NoteTags::default(),
            confidence_report: crate::analysis::score(iq, ec, sc, &ScoringConfig::default()),
            processing_details: ProcessingDetails::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut a = note(NoteStatus::Success, (1.0, 1.0, 1.0));
        a.structure.sections = vec![
            Section::TodoList {
                line_start: 1,
                line_end: 2,
                items: vec![
                    TodoItem {
                        text: "milk".into(),
                        completed: false,
                        line: 1,
                    },
                    TodoItem {
                        text: "eggs".into(),
                        completed: true,
                        line: 2,
                    },
                ],
            },
            Section::BulletedList {
                line_start: 4,
                line_end: 4,
                items: vec![ListItem {
                    text: "bread".into(),
                    number: None,
                    line: 4,
                }],
            },
        ];
        a.tags.simple = vec!["urgent".into()];
        a.tags.key_value.insert("priority".into(), "high".into());

        let b = note(NoteStatus::Partial, (0.0, 0.0, 0.0));
        let failed = note(NoteStatus::Failed, (0.5, 0.0, 0.0));

        let summary = Summary::from_notes(&[a, b, failed], RunStatus::PartialSuccess);
        assert_eq!(summary.total_notes, 3);
        assert_eq!(summary.total_todos, 2);
        assert_eq!(summary.total_tags, 2);
        assert_eq!(summary.total_codes, 0);
        assert!((summary.average_confidence - 0.5).abs() < 1e-6);
        assert_eq!(summary.status, RunStatus::PartialSuccess);
    }

    #[test]
    fn test_empty_summary() {
        let summary = Summary::from_notes(&[], RunStatus::Failed);
        assert_eq!(summary.total_notes, 0);
        assert_eq!(summary.average_confidence, 0.0);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStatus::PartialSuccess).unwrap(),
            "\"partial_success\""
        );
        assert_eq!(serde_json::to_string(&NoteStatus::Partial).unwrap(), "\"partial\"");
    }
}
