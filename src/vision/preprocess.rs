//! Photo preprocessing
//!
//! Denoising, local contrast enhancement (CLAHE) and skew correction, plus
//! the quality metrics that later drive extraction strategy selection.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::filter::{laplacian_filter, median_filter};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::geometry::min_area_rect;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PreprocessConfig;

/// Normalized image quality sub-scores, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Sharpness from Laplacian variance
    pub blur_score: f32,
    /// Intensity standard deviation
    pub contrast_score: f32,
    /// Closeness of mean intensity to mid-gray
    pub brightness_score: f32,
    /// Pixel count adequacy
    pub resolution_score: f32,
    /// Weighted combination of the above
    pub overall: f32,
}

impl QualityMetrics {
    /// Score a grayscale image
    pub fn assess(gray: &GrayImage, config: &PreprocessConfig) -> Self {
        let (mean, std) = intensity_stats(gray);
        let lap_var = laplacian_variance(gray);
        let pixels = gray.width() as f32 * gray.height() as f32;

        let blur_score = (lap_var / config.blur_normalizer).clamp(0.0, 1.0);
        let contrast_score = (std / config.contrast_normalizer).clamp(0.0, 1.0);
        let brightness_score = (1.0 - (mean - 127.5).abs() / 127.5).clamp(0.0, 1.0);
        let resolution_score = (pixels / config.resolution_normalizer).clamp(0.0, 1.0);

        let w = &config.quality_weights;
        let overall = (blur_score * w.blur
            + contrast_score * w.contrast
            + brightness_score * w.brightness
            + resolution_score * w.resolution)
            .clamp(0.0, 1.0);

        Self {
            blur_score,
            contrast_score,
            brightness_score,
            resolution_score,
            overall,
        }
    }
}

/// Output of the preprocessing stage
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    /// Deskewed color image, used for crops handed to recognizers
    pub color: RgbImage,
    /// Denoised, contrast-enhanced and deskewed luma image
    pub gray: GrayImage,
    /// Skew that was corrected, in degrees
    pub rotation_angle: f32,
    /// Names of the steps actually performed
    pub steps_applied: Vec<String>,
}

impl PreprocessedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.gray.dimensions()
    }
}

/// Preprocessing stage
pub struct Preprocessor<'a> {
    config: &'a PreprocessConfig,
}

impl<'a> Preprocessor<'a> {
    pub fn new(config: &'a PreprocessConfig) -> Self {
        Self { config }
    }

    /// Prepare a decoded photo. Infallible for any decodable image.
    pub fn prepare(&self, image: &DynamicImage) -> (PreprocessedImage, QualityMetrics) {
        let color = image.to_rgb8();
        let original_gray = image.to_luma8();
        let quality = QualityMetrics::assess(&original_gray, self.config);

        let mut steps = Vec::new();

        let denoised = if self.config.denoise_radius > 0 {
            steps.push("denoise".to_string());
            median_filter(&original_gray, self.config.denoise_radius, self.config.denoise_radius)
        } else {
            original_gray
        };

        let enhanced = if self.config.clahe_tile_grid > 0 && self.config.clahe_clip_limit > 0.0 {
            steps.push("contrast_enhancement".to_string());
            clahe(&denoised, self.config.clahe_clip_limit, self.config.clahe_tile_grid)
        } else {
            denoised
        };

        let angle = estimate_skew(&enhanced, self.config.deskew_sample_limit);
        let (gray, color, rotation_angle) = if angle.abs() >= self.config.deskew_min_angle {
            steps.push("deskew".to_string());
            let theta = (-angle).to_radians();
            let (mean, _) = intensity_stats(&enhanced);
            let fill = mean.round() as u8;
            let gray = rotate_about_center(&enhanced, theta, Interpolation::Bilinear, Luma([fill]));
            let color = rotate_about_center(&color, theta, Interpolation::Bilinear, mean_color(&color));
            (gray, color, angle)
        } else {
            (enhanced, color, 0.0)
        };

        debug!(
            "Preprocessed {}x{}: steps={:?}, skew={:.2}°, quality={:.3}",
            gray.width(),
            gray.height(),
            steps,
            angle,
            quality.overall
        );

        (
            PreprocessedImage {
                color,
                gray,
                rotation_angle,
                steps_applied: steps,
            },
            quality,
        )
    }
}

/// Mean and standard deviation of pixel intensities
pub fn intensity_stats(gray: &GrayImage) -> (f32, f32) {
    let n = (gray.width() as u64 * gray.height() as u64) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let (sum, sum_sq) = gray.pixels().fold((0f64, 0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    let var = (sum_sq / n - mean * mean).max(0.0);
    (mean as f32, var.sqrt() as f32)
}

/// Variance of the Laplacian response, a standard focus measure
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let lap = laplacian_filter(gray);
    let n = (lap.width() as u64 * lap.height() as u64) as f64;
    if n == 0.0 {
        return 0.0;
    }
    let (sum, sum_sq) = lap.pixels().fold((0f64, 0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

fn mean_color(image: &RgbImage) -> Rgb<u8> {
    let n = (image.width() as u64 * image.height() as u64).max(1);
    let mut sums = [0u64; 3];
    for p in image.pixels() {
        for c in 0..3 {
            sums[c] += p.0[c] as u64;
        }
    }
    Rgb([
        (sums[0] / n) as u8,
        (sums[1] / n) as u8,
        (sums[2] / n) as u8,
    ])
}

/// Contrast-limited adaptive histogram equalization
///
/// The image is split into `grid`x`grid` tiles; each tile gets a clipped
/// equalization curve and pixels blend the curves of the four nearest
/// tile centers.
pub fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }
    let grid = grid.max(1);
    let tile_w = width.div_ceil(grid).max(1);
    let tile_h = height.div_ceil(grid).max(1);
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1;
                }
            }
            let count = (x1 - x0) * (y1 - y0);
            let limit = (clip_limit * count as f32 / 256.0).max(1.0) as u32;

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let bonus = excess / 256;
            let mut remainder = excess % 256;
            for bin in hist.iter_mut() {
                *bin += bonus;
                if remainder > 0 {
                    *bin += 1;
                    remainder -= 1;
                }
            }

            let lut = &mut luts[(ty * tiles_x + tx) as usize];
            let mut cdf = 0u32;
            for (value, bin) in hist.iter().enumerate() {
                cdf += bin;
                lut[value] = (cdf as f32 * 255.0 / count as f32).round().min(255.0) as u8;
            }
        }
    }

    let lookup = |tx: u32, ty: u32, v: usize| luts[(ty * tiles_x + tx) as usize][v] as f32;
    let neighbors = |pos: u32, tile: u32, tiles: u32| -> (u32, u32, f32) {
        let f = (pos as f32 + 0.5) / tile as f32 - 0.5;
        let lo = f.floor().clamp(0.0, (tiles - 1) as f32) as u32;
        let hi = (lo + 1).min(tiles - 1);
        let weight = (f - lo as f32).clamp(0.0, 1.0);
        (lo, hi, weight)
    };

    ImageBuffer::from_fn(width, height, |x, y| {
        let v = gray.get_pixel(x, y).0[0] as usize;
        let (x0, x1, ax) = neighbors(x, tile_w, tiles_x);
        let (y0, y1, ay) = neighbors(y, tile_h, tiles_y);
        let top = lookup(x0, y0, v) * (1.0 - ax) + lookup(x1, y0, v) * ax;
        let bottom = lookup(x0, y1, v) * (1.0 - ax) + lookup(x1, y1, v) * ax;
        Luma([(top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8])
    })
}

/// Estimate skew in degrees from the minimum-area rectangle around the
/// foreground (the minority side of an Otsu split, pixels at or below the
/// level being dark). Result lies in (-45, 45].
pub fn estimate_skew(gray: &GrayImage, sample_limit: usize) -> f32 {
    let level = otsu_level(gray);
    let total = gray.width() as usize * gray.height() as usize;
    let dark = gray.pixels().filter(|p| p.0[0] <= level).count();
    let dark_is_foreground = dark * 2 <= total;
    let foreground = if dark_is_foreground { dark } else { total - dark };
    if foreground < 3 {
        return 0.0;
    }

    let step = (foreground / sample_limit.max(1)).max(1);
    let points: Vec<Point<i32>> = gray
        .enumerate_pixels()
        .filter(|(_, _, p)| (p.0[0] <= level) == dark_is_foreground)
        .step_by(step)
        .map(|(x, y, _)| Point::new(x as i32, y as i32))
        .collect();
    if points.len() < 3 {
        return 0.0;
    }

    rect_angle(&min_area_rect(&points))
}

/// Angle of a rectangle's first edge folded into (-45, 45]
pub(crate) fn rect_angle(rect: &[Point<i32>; 4]) -> f32 {
    let dx = (rect[1].x - rect[0].x) as f32;
    let dy = (rect[1].y - rect[0].y) as f32;
    if dx == 0.0 && dy == 0.0 {
        return 0.0;
    }
    let mut angle = dy.atan2(dx).to_degrees();
    while angle > 45.0 {
        angle -= 90.0;
    }
    while angle <= -45.0 {
        angle += 90.0;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_uniform_image() {
        let gray = GrayImage::from_pixel(1000, 1000, Luma([128]));
        let q = QualityMetrics::assess(&gray, &PreprocessConfig::default());
        assert_eq!(q.blur_score, 0.0);
        assert_eq!(q.contrast_score, 0.0);
        assert!(q.brightness_score > 0.99);
        assert_eq!(q.resolution_score, 1.0);
        // 0.2 * brightness + 0.2 * resolution
        assert!((q.overall - (0.2 * q.brightness_score + 0.2)).abs() < 1e-5);
    }

    #[test]
    fn test_quality_sharp_checkerboard() {
        let gray = GrayImage::from_fn(200, 200, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        let q = QualityMetrics::assess(&gray, &PreprocessConfig::default());
        assert_eq!(q.blur_score, 1.0);
        assert!(q.contrast_score > 0.99);
        assert!((q.resolution_score - 0.04).abs() < 1e-6);
        assert!((0.0..=1.0).contains(&q.overall));
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let gray = GrayImage::from_fn(128, 128, |x, _| Luma([100 + (x / 8) as u8]));
        let (_, before) = intensity_stats(&gray);
        let out = clahe(&gray, 2.0, 8);
        let (_, after) = intensity_stats(&out);
        assert_eq!(out.dimensions(), gray.dimensions());
        assert!(after > before);
    }

    fn slanted_band(x: u32, y: u32) -> bool {
        let center = 100.0 + x as f32 * 0.2;
        (50..350).contains(&x) && (y as f32 - center).abs() < 10.0
    }

    #[test]
    fn test_estimate_skew_of_slanted_band() {
        let gray = GrayImage::from_fn(400, 300, |x, y| {
            if slanted_band(x, y) {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        let angle = estimate_skew(&gray, 50_000);
        let expected = 0.2f32.atan().to_degrees();
        assert!((angle - expected).abs() < 1.5, "angle {angle}");
    }

    #[test]
    fn test_rect_angle_folding() {
        let square = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(rect_angle(&square), 0.0);
        let vertical_first = [
            Point::new(0, 0),
            Point::new(0, 10),
            Point::new(10, 10),
            Point::new(10, 0),
        ];
        assert_eq!(rect_angle(&vertical_first), 0.0);
    }

    #[test]
    fn test_prepare_straight_image() {
        let img = RgbImage::from_fn(300, 200, |x, y| {
            if (100..200).contains(&x) && (80..120).contains(&y) {
                Rgb([20, 20, 20])
            } else {
                Rgb([240, 230, 120])
            }
        });
        let config = PreprocessConfig::default();
        let (pre, quality) = Preprocessor::new(&config).prepare(&DynamicImage::ImageRgb8(img));
        assert_eq!(pre.dimensions(), (300, 200));
        assert_eq!(pre.rotation_angle, 0.0);
        assert_eq!(pre.steps_applied, vec!["denoise", "contrast_enhancement"]);
        assert!((0.0..=1.0).contains(&quality.overall));
    }

    #[test]
    fn test_prepare_deskews_rotated_note() {
        let img = RgbImage::from_fn(400, 300, |x, y| {
            if slanted_band(x, y) {
                Rgb([30, 30, 30])
            } else {
                Rgb([250, 240, 140])
            }
        });
        let config = PreprocessConfig::default();
        let (pre, _) = Preprocessor::new(&config).prepare(&DynamicImage::ImageRgb8(img));
        assert!(pre.steps_applied.iter().any(|s| s == "deskew"), "{:?}", pre.steps_applied);
        let expected = 0.2f32.atan().to_degrees();
        assert!((pre.rotation_angle - expected).abs() < 1.5, "angle {}", pre.rotation_angle);
        assert_eq!(pre.dimensions(), (400, 300));
        assert!(estimate_skew(&pre.gray, 50_000).abs() < 1.5);
    }
}
