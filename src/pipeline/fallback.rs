//! Stage failure table
//!
//! Every stage that can fail has a variant here, and [`Stage::policy`] maps
//! it to what the orchestrator does about it. Adding a stage without a
//! policy does not compile.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

use crate::error::PipelineError;

/// A pipeline stage that can report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Preprocessing,
    Separation,
    MetadataExtraction,
    TextExtraction,
    StructureRecognition,
    PostProcessing,
}

/// Recovery applied when a stage fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Stop the run; the output carries the error and no notes
    AbortRun,
    /// Treat the whole image as one note
    ProcessAsSingleNote,
    /// Emit the note with its failure instead of text
    SurfacePartialNote,
    /// Leave the stage's contribution out and continue
    SkipWithWarning,
    /// Keep the normalized but uncorrected text
    ReturnUncorrected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Ends the run
    Critical,
    /// Downgrades the run or note to partial success
    Recoverable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub action: FallbackAction,
    pub severity: Severity,
}

impl Stage {
    pub const fn policy(self) -> FailurePolicy {
        use FallbackAction::*;
        use Severity::*;

        let (action, severity) = match self {
            Stage::Validation => (AbortRun, Critical),
            // Only reachable if the blocking task dies
            Stage::Preprocessing => (AbortRun, Critical),
            Stage::Separation => (ProcessAsSingleNote, Recoverable),
            Stage::MetadataExtraction => (SkipWithWarning, Recoverable),
            Stage::TextExtraction => (SurfacePartialNote, Recoverable),
            Stage::StructureRecognition => (SkipWithWarning, Recoverable),
            Stage::PostProcessing => (ReturnUncorrected, Recoverable),
        };
        FailurePolicy { action, severity }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Preprocessing => "preprocessing",
            Stage::Separation => "separation",
            Stage::MetadataExtraction => "metadata extraction",
            Stage::TextExtraction => "text extraction",
            Stage::StructureRecognition => "structure recognition",
            Stage::PostProcessing => "post-processing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warnings and errors collected by a run or a single note
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Set once a critical failure was recorded
    pub aborted: bool,
    /// Set once a recoverable failure was recorded
    pub degraded: bool,
}

impl Diagnostics {
    /// Record a stage failure under its policy and return the action to take
    pub fn record(&mut self, stage: Stage, err: &PipelineError) -> FallbackAction {
        let policy = stage.policy();
        let message = format!("{stage}: {err}");
        match policy.severity {
            Severity::Critical => {
                error!("{} failed, aborting run: {}", stage, err);
                self.errors.push(message);
                self.aborted = true;
            }
            Severity::Recoverable => {
                warn!("{} failed, fallback {:?}: {}", stage, policy.action, err);
                self.warnings.push(message);
                self.degraded = true;
            }
        }
        policy.action
    }

    /// Non-failure warning, e.g. a low confidence note
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Stage; 7] = [
        Stage::Validation,
        Stage::Preprocessing,
        Stage::Separation,
        Stage::MetadataExtraction,
        Stage::TextExtraction,
        Stage::StructureRecognition,
        Stage::PostProcessing,
    ];

    #[test]
    fn test_only_input_stages_are_critical() {
        for stage in ALL {
            let critical = stage.policy().severity == Severity::Critical;
            assert_eq!(
                critical,
                matches!(stage, Stage::Validation | Stage::Preprocessing),
                "{stage}"
            );
        }
    }

    #[test]
    fn test_fallback_actions() {
        assert_eq!(
            Stage::Separation.policy().action,
            FallbackAction::ProcessAsSingleNote
        );
        assert_eq!(
            Stage::TextExtraction.policy().action,
            FallbackAction::SurfacePartialNote
        );
        assert_eq!(
            Stage::MetadataExtraction.policy().action,
            FallbackAction::SkipWithWarning
        );
        assert_eq!(
            Stage::PostProcessing.policy().action,
            FallbackAction::ReturnUncorrected
        );
    }

    #[test]
    fn test_record_routes_by_severity() {
        let mut diag = Diagnostics::default();
        let action = diag.record(
            Stage::MetadataExtraction,
            &PipelineError::Metadata("no pixels".into()),
        );
        assert_eq!(action, FallbackAction::SkipWithWarning);
        assert!(diag.degraded);
        assert!(!diag.aborted);
        assert_eq!(
            diag.warnings,
            vec!["metadata extraction: metadata extraction failed: no pixels"]
        );
        assert!(diag.errors.is_empty());

        let action = diag.record(
            Stage::Validation,
            &PipelineError::Validation(crate::error::ValidationError::Empty),
        );
        assert_eq!(action, FallbackAction::AbortRun);
        assert!(diag.aborted);
        assert_eq!(diag.errors.len(), 1);
    }
}
