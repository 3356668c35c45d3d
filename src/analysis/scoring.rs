//! Confidence scoring

use serde::{Deserialize, Serialize};

use super::structure::StructureAnalysis;
use crate::config::{ClarityIncrements, ScoringConfig};

/// Per-note confidence breakdown; every field is in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub image_quality: f32,
    pub extraction_confidence: f32,
    pub structure_clarity: f32,
    /// Weighted sum of the three scores above
    pub overall: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traditional_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_confidence: Option<f32>,
}

impl ConfidenceReport {
    /// Attach the per-method extraction confidences
    pub fn with_methods(mut self, traditional: Option<f32>, vision: Option<f32>) -> Self {
        self.traditional_confidence = traditional.map(clamp_unit);
        self.vision_confidence = vision.map(clamp_unit);
        self
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Base score plus an increment for each kind of structure found, capped at 1
pub fn structure_clarity(analysis: &StructureAnalysis, increments: &ClarityIncrements) -> f32 {
    let mut score = increments.base;
    if analysis.has_title {
        score += increments.title;
    }
    if analysis.has_lists {
        score += increments.lists;
    }
    if analysis.has_tags {
        score += increments.tags;
    }
    if analysis.has_todos {
        score += increments.todos;
    }
    clamp_unit(score)
}

/// Composite confidence for one note
pub fn score(
    image_quality: f32,
    extraction_confidence: f32,
    structure_clarity: f32,
    config: &ScoringConfig,
) -> ConfidenceReport {
    let image_quality = clamp_unit(image_quality);
    let extraction_confidence = clamp_unit(extraction_confidence);
    let structure_clarity = clamp_unit(structure_clarity);
    let overall = clamp_unit(
        config.image_weight * image_quality
            + config.extraction_weight * extraction_confidence
            + config.structure_weight * structure_clarity,
    );
    ConfidenceReport {
        image_quality,
        extraction_confidence,
        structure_clarity,
        overall,
        traditional_confidence: None,
        vision_confidence: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_is_weighted_sum() {
        let config = ScoringConfig::default();
        let report = score(0.5, 0.8, 0.4, &config);
        let expected = 0.2 * 0.5 + 0.6 * 0.8 + 0.2 * 0.4;
        assert!((report.overall - expected).abs() < 1e-6);
    }

    #[test]
    fn test_inputs_are_clamped() {
        let config = ScoringConfig::default();
        let report = score(1.7, -0.3, f32::NAN, &config);
        assert_eq!(report.image_quality, 1.0);
        assert_eq!(report.extraction_confidence, 0.0);
        assert_eq!(report.structure_clarity, 0.0);
        assert!((0.0..=1.0).contains(&report.overall));
        assert!((report.overall - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_structure_clarity_increments() {
        let inc = ClarityIncrements::default();
        let mut analysis = StructureAnalysis::default();
        assert!((structure_clarity(&analysis, &inc) - 0.2).abs() < 1e-6);

        analysis.has_title = true;
        analysis.has_lists = true;
        assert!((structure_clarity(&analysis, &inc) - 0.7).abs() < 1e-6);

        analysis.has_tags = true;
        analysis.has_todos = true;
        assert!((structure_clarity(&analysis, &inc) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clarity_is_capped() {
        let inc = ClarityIncrements {
            base: 0.5,
            title: 0.5,
            lists: 0.5,
            tags: 0.5,
            todos: 0.5,
        };
        let analysis = StructureAnalysis {
            has_title: true,
            has_lists: true,
            ..StructureAnalysis::default()
        };
        assert_eq!(structure_clarity(&analysis, &inc), 1.0);
    }
}
