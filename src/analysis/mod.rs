//! Text Analysis
//!
//! Text-side stages: structure recognition, correction and normalization,
//! and confidence scoring.

pub mod patterns;
pub mod postprocess;
pub mod scoring;
pub mod structure;

pub use patterns::{LineKind, PatternTables, TitleFormat};
pub use postprocess::{Correction, PostProcessResult, PostProcessor, TextNormalizer};
pub use scoring::{score, structure_clarity, ConfidenceReport};
pub use structure::{Section, StructureAnalysis, StructureRecognizer, Title, TodoItem};
