//! Error taxonomy for the digitization pipeline
//!
//! `ValidationError` covers bad input and is always fatal for a run.
//! `PipelineError` covers everything a stage can report; the orchestrator
//! resolves most of them through its fallback table instead of propagating.

use thiserror::Error;

use crate::capture::frame::ImageFormat;

/// Input rejected before any stage runs
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("image is empty")]
    Empty,

    #[error("image is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("declared format {declared} does not match detected format {detected}")]
    FormatMismatch {
        declared: ImageFormat,
        detected: ImageFormat,
    },

    #[error("image is {width}x{height}, allowed range is {min}x{min} to {max}x{max}")]
    Dimensions {
        width: u32,
        height: u32,
        min: u32,
        max: u32,
    },

    #[error("image data is corrupt: {0}")]
    Corrupt(String),
}

/// Failure raised by a pipeline stage or one of its external services
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("note separation failed: {0}")]
    Separation(String),

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("metadata extraction failed: {0}")]
    Metadata(String),

    #[error("text correction failed: {0}")]
    Correction(String),

    #[error("{service} call failed: {message}")]
    Service {
        service: &'static str,
        message: String,
    },

    #[error("{service} call timed out after {timeout_ms} ms")]
    Timeout {
        service: &'static str,
        timeout_ms: u64,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Build a service error from anything displayable
    pub fn service(service: &'static str, message: impl Into<String>) -> Self {
        Self::Service {
            service,
            message: message.into(),
        }
    }

    /// Whether retrying the same call could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Service { .. } | Self::Timeout { .. } => true,
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_converts_into_pipeline_error() {
        let err: PipelineError = ValidationError::Empty.into();
        assert!(matches!(err, PipelineError::Validation(ValidationError::Empty)));
        assert_eq!(err.to_string(), "validation failed: image is empty");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::service("ocr", "503").is_retryable());
        assert!(PipelineError::Timeout {
            service: "vision",
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(!PipelineError::Config("bad".into()).is_retryable());
    }
}
