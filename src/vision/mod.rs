//! Vision Layer
//!
//! Image-side stages of the pipeline: preprocessing, note separation,
//! visual metadata and text extraction. Supports two text recognizers:
//! - a traditional OCR service (fast, offline-capable)
//! - a vision-capable language model (accurate on handwriting)

pub mod extraction;
pub mod merge;
pub mod metadata;
pub mod ocr;
pub mod preprocess;
pub mod separation;
pub mod vision_model;

use image::{GrayImage, RgbImage};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

pub use extraction::{ExtractionResult, ExtractionSource, OcrMode, TextExtraction, TextExtractor};
pub use merge::{merge_texts, ConflictSpan, MergeOutcome};
pub use metadata::{CodeDecoder, MetadataExtractor, QrCodeDecoder, VisualMetadata};
pub use ocr::{HttpOcrClient, OcrOutput, OcrWord, TextRecognizer};
pub use preprocess::{PreprocessedImage, Preprocessor, QualityMetrics};
pub use separation::{DetectionMethod, SeparatedNote, Separator};
pub use vision_model::{OpenAiVisionClient, VisionModel, VisionTranscription};

/// Axis-aligned rectangle in source-image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0;
        }
        (right - left) as u64 * (bottom - top) as u64
    }

    /// Intersection over union, 0 for disjoint boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter as f32 / union as f32
    }

    /// Smallest box containing both
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        BoundingBox::new(left, top, right - left, bottom - top)
    }

    /// Scale every coordinate, clamped to the given image size
    pub fn scaled(&self, factor: f32, max_width: u32, max_height: u32) -> BoundingBox {
        let x = ((self.x as f32 * factor).round() as u32).min(max_width.saturating_sub(1));
        let y = ((self.y as f32 * factor).round() as u32).min(max_height.saturating_sub(1));
        let width = ((self.width as f32 * factor).round() as u32)
            .max(1)
            .min(max_width - x);
        let height = ((self.height as f32 * factor).round() as u32)
            .max(1)
            .min(max_height - y);
        BoundingBox::new(x, y, width, height)
    }

    /// Offset by another box's origin
    pub fn translated(&self, dx: u32, dy: u32) -> BoundingBox {
        BoundingBox::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

/// Bounding box of a point set (inclusive pixel coordinates)
pub fn points_to_bounds(points: &[Point<i32>]) -> Option<BoundingBox> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    Some(BoundingBox::new(
        min_x.max(0) as u32,
        min_y.max(0) as u32,
        (max_x - min_x + 1).max(1) as u32,
        (max_y - min_y + 1).max(1) as u32,
    ))
}

/// Cell of a 3x3 grid over the source image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativePosition {
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    Center,
    MiddleRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl RelativePosition {
    const GRID: [[RelativePosition; 3]; 3] = [
        [Self::TopLeft, Self::TopCenter, Self::TopRight],
        [Self::MiddleLeft, Self::Center, Self::MiddleRight],
        [Self::BottomLeft, Self::BottomCenter, Self::BottomRight],
    ];

    /// Label for a point inside an image of the given size
    pub fn from_point(x: f32, y: f32, width: u32, height: u32) -> Self {
        let cell = |v: f32, extent: u32| -> usize {
            if extent == 0 {
                return 1;
            }
            ((v / extent as f32 * 3.0).floor().max(0.0) as usize).min(2)
        };
        Self::GRID[cell(y, height)][cell(x, width)]
    }

    /// 1-based row-major index, 1 = top-left, 9 = bottom-right
    pub fn grid_index(&self) -> usize {
        Self::GRID
            .iter()
            .flatten()
            .position(|p| p == self)
            .map_or(5, |i| i + 1)
    }
}

/// Copy a region out of an RGB image; the box is clamped to the image
pub fn crop_rgb(image: &RgbImage, bounds: &BoundingBox) -> RgbImage {
    let x = bounds.x.min(image.width().saturating_sub(1));
    let y = bounds.y.min(image.height().saturating_sub(1));
    let width = bounds.width.min(image.width() - x).max(1);
    let height = bounds.height.min(image.height() - y).max(1);
    image::imageops::crop_imm(image, x, y, width, height).to_image()
}

/// Luma conversion used across the vision stages
pub fn to_gray(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}
