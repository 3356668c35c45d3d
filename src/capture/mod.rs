//! Image Intake
//!
//! Accepts the caller's encoded photo, checks it against the configured
//! limits and decodes it once. Everything downstream works on the decoded
//! bitmap; the encoded bytes are kept only for the output digest.

pub mod frame;

use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

use crate::config::ValidationConfig;
use crate::error::{PipelineError, Result as PipelineResult, ValidationError};
use frame::{ImageFormat, RawImage};

/// A validated photo with its decoded bitmap
#[derive(Debug, Clone)]
pub struct IngestedImage {
    pub raw: RawImage,
    pub decoded: DynamicImage,
}

impl IngestedImage {
    /// Pixel layout of the decoded image, e.g. `Rgb8`
    pub fn color_type(&self) -> String {
        format!("{:?}", self.decoded.color())
    }
}

/// Validate and decode an encoded photo
pub fn ingest(
    bytes: Vec<u8>,
    declared: ImageFormat,
    limits: &ValidationConfig,
) -> Result<IngestedImage, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    if bytes.len() > limits.max_size_bytes {
        return Err(ValidationError::TooLarge {
            size: bytes.len(),
            limit: limits.max_size_bytes,
        });
    }

    let sniffed = image::guess_format(&bytes)
        .map_err(|e| ValidationError::Corrupt(format!("unrecognized encoding: {e}")))?;
    let detected = ImageFormat::from_detected(sniffed)
        .ok_or_else(|| ValidationError::UnsupportedFormat(format!("{sniffed:?}")))?;
    if detected != declared {
        return Err(ValidationError::FormatMismatch { declared, detected });
    }

    // Header-only read so oversized images are rejected before a full decode
    let (width, height) = ImageReader::with_format(Cursor::new(&bytes), detected.to_image_format())
        .into_dimensions()
        .map_err(|e| ValidationError::Corrupt(e.to_string()))?;
    check_dimensions(width, height, limits)?;

    let decoded = image::load_from_memory_with_format(&bytes, detected.to_image_format())
        .map_err(|e| ValidationError::Corrupt(e.to_string()))?;

    debug!(
        "Ingested {} image {}x{} ({} bytes, {:?})",
        detected,
        width,
        height,
        bytes.len(),
        decoded.color()
    );

    Ok(IngestedImage {
        raw: RawImage::new(bytes, detected, width, height),
        decoded,
    })
}

fn check_dimensions(width: u32, height: u32, limits: &ValidationConfig) -> Result<(), ValidationError> {
    let min = limits.min_dimension;
    let max = limits.max_dimension;
    if width < min || height < min || width > max || height > max {
        return Err(ValidationError::Dimensions {
            width,
            height,
            min,
            max,
        });
    }
    Ok(())
}

/// Read an image file, taking the format from the extension or, failing
/// that, from the leading bytes
pub async fn read_image_file(path: &Path) -> PipelineResult<(Vec<u8>, ImageFormat)> {
    let bytes = tokio::fs::read(path).await?;
    let from_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ImageFormat::from_extension);
    let format = match from_extension {
        Some(format) => format,
        None => image::guess_format(&bytes)
            .ok()
            .and_then(ImageFormat::from_detected)
            .ok_or_else(|| {
                PipelineError::Validation(ValidationError::UnsupportedFormat(path.display().to_string()))
            })?,
    };
    Ok((bytes, format))
}

/// Encode a bitmap to PNG bytes
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}
