//! Note separation
//!
//! Finds the individual notes in a photo. Outer contours of the binarized
//! image are filtered down to roughly rectangular, plausibly sized regions.
//! Blobs formed by touching or overlapping notes are split with a
//! distance-transform watershed.

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::{euclidean_squared_distance_transform, Norm};
use imageproc::filter::gaussian_blur_f32;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use imageproc::geometry::{approximate_polygon_dp, arc_length, min_area_rect};
use imageproc::morphology::close;
use imageproc::point::Point;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, info};

use super::preprocess::{rect_angle, PreprocessedImage};
use super::{crop_rgb, points_to_bounds, BoundingBox, RelativePosition};
use crate::config::SeparationConfig;
use crate::error::{PipelineError, Result};

/// How a note region was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Contour,
    Watershed,
    Grid,
    FullImage,
}

/// One physically distinct note. Never mutated after separation.
#[derive(Debug, Clone)]
pub struct SeparatedNote {
    /// Stable identifier, e.g. `note_003`
    pub note_id: String,
    /// Region in source-image pixels
    pub bounding_box: BoundingBox,
    /// Degrees, includes the global deskew
    pub rotation_angle: f32,
    pub relative_position: RelativePosition,
    pub detection_method: DetectionMethod,
    pub detection_confidence: f32,
    /// Owned crop of the deskewed color image
    pub image: RgbImage,
}

/// Region found on the working-scale mask
#[derive(Debug, Clone)]
struct Candidate {
    bounds: BoundingBox,
    angle: f32,
    confidence: f32,
    method: DetectionMethod,
}

/// Note separation stage
pub struct Separator<'a> {
    config: &'a SeparationConfig,
}

impl<'a> Separator<'a> {
    pub fn new(config: &'a SeparationConfig) -> Self {
        Self { config }
    }

    /// Detect note regions in reading order. An empty list means no region
    /// passed the filters; the caller decides the fallback.
    pub fn separate(&self, pre: &PreprocessedImage) -> Result<Vec<SeparatedNote>> {
        let (width, height) = pre.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::Separation("image has no pixels".to_string()));
        }

        let scale = (self.config.working_max_dimension as f32 / width.max(height) as f32).min(1.0);
        let working = if scale < 1.0 {
            let w = ((width as f32 * scale).round() as u32).max(1);
            let h = ((height as f32 * scale).round() as u32).max(1);
            imageops::resize(&pre.gray, w, h, FilterType::Triangle)
        } else {
            pre.gray.clone()
        };

        let mask = self.binarize(&working);
        let candidates = self.find_candidates(&mask);
        let candidates = self.resolve_overlaps(&mask, candidates);

        let inverse = 1.0 / scale;
        let min_side = self.config.min_side;
        let mut regions: Vec<Candidate> = candidates
            .into_iter()
            .map(|c| Candidate {
                bounds: c.bounds.scaled(inverse, width, height),
                ..c
            })
            .filter(|c| c.bounds.width >= min_side && c.bounds.height >= min_side)
            .collect();

        sort_reading_order(&mut regions);
        info!("Separated {} note region(s)", regions.len());

        Ok(regions
            .into_iter()
            .enumerate()
            .map(|(i, c)| build_note(pre, i, c))
            .collect())
    }

    /// Split the image into a uniform grid (pre-printed layouts)
    pub fn grid(&self, pre: &PreprocessedImage, rows: u32, cols: u32) -> Vec<SeparatedNote> {
        let (width, height) = pre.dimensions();
        let rows = rows.max(1);
        let cols = cols.max(1);
        let cell_w = width / cols;
        let cell_h = height / rows;

        (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .enumerate()
            .map(|(i, (r, c))| {
                let w = if c == cols - 1 { width - c * cell_w } else { cell_w };
                let h = if r == rows - 1 { height - r * cell_h } else { cell_h };
                let candidate = Candidate {
                    bounds: BoundingBox::new(c * cell_w, r * cell_h, w.max(1), h.max(1)),
                    angle: 0.0,
                    confidence: 0.7,
                    method: DetectionMethod::Grid,
                };
                build_note(pre, i, candidate)
            })
            .collect()
    }

    /// Treat the whole image as a single note
    pub fn whole_image(&self, pre: &PreprocessedImage) -> SeparatedNote {
        let (width, height) = pre.dimensions();
        let candidate = Candidate {
            bounds: BoundingBox::new(0, 0, width.max(1), height.max(1)),
            angle: 0.0,
            confidence: 0.5,
            method: DetectionMethod::FullImage,
        };
        build_note(pre, 0, candidate)
    }

    /// Foreground mask of note pixels
    ///
    /// Each pixel is compared against its local mean where the neighborhood
    /// has texture, and against the global Otsu level where it is flat. The
    /// local threshold is kept within `adaptive_band` of the global level.
    /// If the result claims most of the image border, the polarity is flipped
    /// so that the surrounding surface is background.
    pub fn binarize(&self, gray: &GrayImage) -> GrayImage {
        let cfg = self.config;
        let blurred = if cfg.blur_sigma > 0.0 {
            gaussian_blur_f32(gray, cfg.blur_sigma)
        } else {
            gray.clone()
        };

        let global = otsu_level(&blurred) as f32;
        let windows = WindowStats::new(&blurred);
        let (width, height) = blurred.dimensions();

        let mut mask = GrayImage::from_fn(width, height, |x, y| {
            let v = blurred.get_pixel(x, y).0[0] as f32;
            let (mean, std) = windows.around(x, y, cfg.threshold_block_radius);
            let threshold = if std < cfg.flat_region_std {
                global
            } else {
                (mean - cfg.threshold_offset).clamp(global - cfg.adaptive_band, global + cfg.adaptive_band)
            };
            Luma([if v > threshold { 255 } else { 0 }])
        });

        if border_foreground_ratio(&mask) > 0.5 {
            for p in mask.pixels_mut() {
                p.0[0] = 255 - p.0[0];
            }
        }

        if cfg.close_radius > 0 {
            close(&mask, Norm::LInf, cfg.close_radius)
        } else {
            mask
        }
    }

    fn find_candidates(&self, mask: &GrayImage) -> Vec<Candidate> {
        let cfg = self.config;
        let image_area = mask.width() as f64 * mask.height() as f64;
        let mut candidates = Vec::new();

        let contours = find_contours::<i32>(mask);
        for contour in contours
            .iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        {
            if contour.points.len() < 3 {
                continue;
            }
            let area = polygon_area(&contour.points);
            let area_ratio = area / image_area;
            if area_ratio <= cfg.min_area_ratio as f64 || area_ratio >= cfg.max_area_ratio as f64 {
                continue;
            }
            let Some(bounds) = points_to_bounds(&contour.points) else {
                continue;
            };

            let aspect = bounds.width as f32 / bounds.height as f32;
            let epsilon = cfg.approx_epsilon_ratio * arc_length(&contour.points, true);
            let mut approx = approximate_polygon_dp(&contour.points, epsilon, true);
            if approx.len() > 1 && approx.first() == approx.last() {
                approx.pop();
            }
            let corners = approx.len();

            let rect = min_area_rect(&contour.points);
            let rect_area = quad_area(&rect);
            let rect_fill = if rect_area > 0.0 { (area / rect_area) as f32 } else { 1.0 };

            let rectangular = (cfg.min_corners..=cfg.max_corners).contains(&corners)
                && aspect > cfg.min_aspect_ratio
                && aspect < cfg.max_aspect_ratio
                && rect_fill >= cfg.min_rect_fill;

            if rectangular {
                candidates.push(Candidate {
                    bounds,
                    angle: rect_angle(&rect),
                    confidence: contour_confidence(area_ratio as f32, aspect, corners),
                    method: DetectionMethod::Contour,
                });
            } else {
                debug!(
                    "Contour at {:?} not rectangular (corners={}, aspect={:.2}, fill={:.2}), trying watershed",
                    bounds, corners, aspect, rect_fill
                );
                candidates.extend(self.watershed_split(mask, &bounds));
            }
        }

        candidates
    }

    /// Split overlapping clusters, then drop anything still overlapping
    /// beyond the threshold (higher confidence wins).
    fn resolve_overlaps(&self, mask: &GrayImage, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let threshold = self.config.overlap_threshold;
        let n = candidates.len();

        // Union-find over pairwise overlaps
        let mut parent: Vec<usize> = (0..n).collect();
        fn root(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        for i in 0..n {
            for j in (i + 1)..n {
                if candidates[i].bounds.iou(&candidates[j].bounds) > threshold {
                    let (a, b) = (root(&mut parent, i), root(&mut parent, j));
                    parent[a] = b;
                }
            }
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_of_root = std::collections::HashMap::new();
        for i in 0..n {
            let r = root(&mut parent, i);
            let slot = *group_of_root.entry(r).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(i);
        }

        let mut resolved = Vec::new();
        for group in groups {
            if group.len() == 1 {
                resolved.push(candidates[group[0]].clone());
                continue;
            }
            let union = group
                .iter()
                .map(|&i| candidates[i].bounds)
                .reduce(|a, b| a.union(&b));
            let split = union.map(|u| self.watershed_split(mask, &u)).unwrap_or_default();
            if split.len() >= 2 {
                debug!("Watershed split {} overlapping regions into {}", group.len(), split.len());
                resolved.extend(split);
            } else if let Some(best) = group
                .iter()
                .map(|&i| &candidates[i])
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            {
                resolved.push(best.clone());
            }
        }

        resolved.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut kept: Vec<Candidate> = Vec::new();
        for candidate in resolved {
            if kept.iter().all(|k| k.bounds.iou(&candidate.bounds) <= threshold) {
                kept.push(candidate);
            }
        }
        kept
    }

    /// Marker-based watershed over the distance transform of one blob
    fn watershed_split(&self, mask: &GrayImage, bounds: &BoundingBox) -> Vec<Candidate> {
        let cfg = self.config;
        let image_area = mask.width() as f64 * mask.height() as f64;
        let sub = imageops::crop_imm(mask, bounds.x, bounds.y, bounds.width, bounds.height).to_image();
        let (w, h) = sub.dimensions();
        if w < 3 || h < 3 {
            return Vec::new();
        }

        let dist = distance_to_background(&sub);
        let max_dist = dist.iter().copied().fold(0.0f32, f32::max);
        if max_dist < 2.0 {
            return Vec::new();
        }

        let peak_level = cfg.watershed_peak_ratio * max_dist;
        let peaks = GrayImage::from_fn(w, h, |x, y| {
            Luma([if dist[(y * w + x) as usize] >= peak_level { 255 } else { 0 }])
        });
        let markers = connected_components(&peaks, Connectivity::Eight, Luma([0u8]));
        let label_count = markers.pixels().map(|p| p.0[0]).max().unwrap_or(0);
        if label_count < 2 {
            return Vec::new();
        }

        let labels = flood_from_markers(&sub, &dist, &markers);

        // Per-label extent and pixel count
        let mut stats = vec![(u32::MAX, u32::MAX, 0u32, 0u32, 0u64); label_count as usize + 1];
        for y in 0..h {
            for x in 0..w {
                let label = labels[(y * w + x) as usize] as usize;
                if label == 0 {
                    continue;
                }
                let s = &mut stats[label];
                s.0 = s.0.min(x);
                s.1 = s.1.min(y);
                s.2 = s.2.max(x);
                s.3 = s.3.max(y);
                s.4 += 1;
            }
        }

        stats
            .into_iter()
            .skip(1)
            .filter(|s| s.4 > 0)
            .filter_map(|(x0, y0, x1, y1, count)| {
                let seg = BoundingBox::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1);
                let area_ratio = count as f64 / image_area;
                let aspect = seg.width as f32 / seg.height as f32;
                let fill = count as f32 / seg.area() as f32;
                let plausible = area_ratio > cfg.min_area_ratio as f64
                    && area_ratio < cfg.max_area_ratio as f64
                    && aspect > cfg.min_aspect_ratio
                    && aspect < cfg.max_aspect_ratio
                    && fill >= cfg.min_segment_fill;
                plausible.then(|| Candidate {
                    bounds: seg.translated(bounds.x, bounds.y),
                    angle: 0.0,
                    confidence: contour_confidence(area_ratio as f32, aspect, 4) * fill.min(1.0),
                    method: DetectionMethod::Watershed,
                })
            })
            .collect()
    }
}

fn build_note(pre: &PreprocessedImage, index: usize, candidate: Candidate) -> SeparatedNote {
    let (width, height) = pre.dimensions();
    let (cx, cy) = candidate.bounds.center();
    SeparatedNote {
        note_id: format!("note_{:03}", index + 1),
        bounding_box: candidate.bounds,
        rotation_angle: pre.rotation_angle + candidate.angle,
        relative_position: RelativePosition::from_point(cx, cy, width, height),
        detection_method: candidate.method,
        detection_confidence: candidate.confidence.clamp(0.0, 1.0),
        image: crop_rgb(&pre.color, &candidate.bounds),
    }
}

/// Rows top to bottom, then left to right inside a row
fn sort_reading_order(regions: &mut Vec<Candidate>) {
    if regions.is_empty() {
        return;
    }
    let mut heights: Vec<u32> = regions.iter().map(|c| c.bounds.height).collect();
    heights.sort_unstable();
    let row_tolerance = heights[heights.len() / 2] as f32 / 2.0;

    regions.sort_by(|a, b| a.bounds.center().1.total_cmp(&b.bounds.center().1));
    let mut rows: Vec<Vec<Candidate>> = Vec::new();
    let mut row_start = f32::NEG_INFINITY;
    for candidate in regions.drain(..) {
        let cy = candidate.bounds.center().1;
        match rows.last_mut() {
            Some(row) if cy - row_start <= row_tolerance => row.push(candidate),
            _ => {
                row_start = cy;
                rows.push(vec![candidate]);
            }
        }
    }
    for mut row in rows {
        row.sort_by(|a, b| a.bounds.center().0.total_cmp(&b.bounds.center().0));
        regions.extend(row);
    }
}

/// Detection confidence from area share, aspect ratio and corner count
fn contour_confidence(area_ratio: f32, aspect: f32, corners: usize) -> f32 {
    let area_score = if (0.01..=0.1).contains(&area_ratio) {
        1.0
    } else if (0.005..=0.2).contains(&area_ratio) {
        0.7
    } else {
        0.3
    };
    let aspect_score = if (0.8..=1.2).contains(&aspect) {
        1.0
    } else if (0.6..=1.5).contains(&aspect) {
        0.8
    } else {
        0.5
    };
    let shape_score = match corners {
        4 => 1.0,
        5 | 6 => 0.8,
        _ => 0.6,
    };
    area_score * 0.4 + aspect_score * 0.3 + shape_score * 0.3
}

/// Shoelace area of a closed polygon
fn polygon_area(points: &[Point<i32>]) -> f64 {
    let n = points.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let p = points[i];
            let q = points[(i + 1) % n];
            p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64
        })
        .sum();
    (twice as f64 / 2.0).abs()
}

fn quad_area(rect: &[Point<i32>; 4]) -> f64 {
    let side = |a: Point<i32>, b: Point<i32>| {
        let dx = (b.x - a.x) as f64;
        let dy = (b.y - a.y) as f64;
        (dx * dx + dy * dy).sqrt()
    };
    side(rect[0], rect[1]) * side(rect[1], rect[2])
}

fn border_foreground_ratio(mask: &GrayImage) -> f32 {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let mut total = 0u32;
    let mut fg = 0u32;
    let mut visit = |x: u32, y: u32| {
        total += 1;
        if mask.get_pixel(x, y).0[0] > 0 {
            fg += 1;
        }
    };
    for x in 0..w {
        visit(x, 0);
        visit(x, h - 1);
    }
    for y in 1..h.saturating_sub(1) {
        visit(0, y);
        visit(w - 1, y);
    }
    fg as f32 / total.max(1) as f32
}

/// Summed-area tables for O(1) window mean and variance
struct WindowStats {
    width: u32,
    height: u32,
    sum: ImageBuffer<Luma<u64>, Vec<u64>>,
    sum_sq: ImageBuffer<Luma<u64>, Vec<u64>>,
}

impl WindowStats {
    fn new(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            sum: integral_image::<_, u64>(gray),
            sum_sq: integral_squared_image::<_, u64>(gray),
        }
    }

    fn around(&self, x: u32, y: u32, radius: u32) -> (f32, f32) {
        let left = x.saturating_sub(radius);
        let top = y.saturating_sub(radius);
        let right = (x + radius).min(self.width - 1);
        let bottom = (y + radius).min(self.height - 1);
        let count = (right - left + 1) as f64 * (bottom - top + 1) as f64;

        let sum = sum_image_pixels(&self.sum, left, top, right, bottom)[0] as f64;
        let sum_sq = sum_image_pixels(&self.sum_sq, left, top, right, bottom)[0] as f64;
        let mean = sum / count;
        let var = (sum_sq / count - mean * mean).max(0.0);
        (mean as f32, var.sqrt() as f32)
    }
}

/// Euclidean distance from each foreground pixel to the nearest background
/// pixel; everything outside the image counts as background.
fn distance_to_background(mask: &GrayImage) -> Vec<f32> {
    let (w, h) = mask.dimensions();
    // Background becomes the non-zero seed set, with a one pixel border
    let seeds = GrayImage::from_fn(w + 2, h + 2, |x, y| {
        let inside = (1..=w).contains(&x) && (1..=h).contains(&y);
        if inside && mask.get_pixel(x - 1, y - 1).0[0] > 0 {
            Luma([0])
        } else {
            Luma([255])
        }
    });
    let squared = euclidean_squared_distance_transform(&seeds);
    (0..h)
        .flat_map(|y| (0..w).map(move |x| (x, y)))
        .map(|(x, y)| squared.get_pixel(x + 1, y + 1).0[0].sqrt() as f32)
        .collect()
}

/// Grow marker labels over the foreground, highest distance first
fn flood_from_markers(
    mask: &GrayImage,
    dist: &[f32],
    markers: &image::ImageBuffer<Luma<u32>, Vec<u32>>,
) -> Vec<u32> {
    let (w, h) = mask.dimensions();
    let mut labels: Vec<u32> = markers.pixels().map(|p| p.0[0]).collect();
    let is_fg = |i: usize| mask.as_raw()[i] > 0;
    let key = |i: usize| (dist[i] * 16.0) as u32;

    // (priority, insertion order, pixel, label)
    let mut heap: BinaryHeap<(u32, Reverse<u64>, usize, u32)> = BinaryHeap::new();
    let mut seq = 0u64;

    let neighbors = |i: usize| {
        let x = (i as u32) % w;
        let y = (i as u32) / w;
        let mut out = [None; 4];
        if x > 0 {
            out[0] = Some(i - 1);
        }
        if x + 1 < w {
            out[1] = Some(i + 1);
        }
        if y > 0 {
            out[2] = Some(i - w as usize);
        }
        if y + 1 < h {
            out[3] = Some(i + w as usize);
        }
        out
    };

    for i in 0..labels.len() {
        if labels[i] == 0 {
            continue;
        }
        for n in neighbors(i).into_iter().flatten() {
            if labels[n] == 0 && is_fg(n) {
                heap.push((key(n), Reverse(seq), n, labels[i]));
                seq += 1;
            }
        }
    }

    while let Some((_, _, i, label)) = heap.pop() {
        if labels[i] != 0 {
            continue;
        }
        labels[i] = label;
        for n in neighbors(i).into_iter().flatten() {
            if labels[n] == 0 && is_fg(n) {
                heap.push((key(n), Reverse(seq), n, label));
                seq += 1;
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const BACKGROUND: Rgb<u8> = Rgb([45, 45, 50]);

    fn prepared(color: RgbImage) -> PreprocessedImage {
        let gray = crate::vision::to_gray(&color);
        PreprocessedImage {
            color,
            gray,
            rotation_angle: 0.0,
            steps_applied: Vec::new(),
        }
    }

    fn paint_note(img: &mut RgbImage, x: u32, y: u32, size: u32, color: Rgb<u8>) {
        for py in y..y + size {
            for px in x..x + size {
                img.put_pixel(px, py, color);
            }
        }
        // A few lines of dark "handwriting"
        for line in 0..3 {
            let ly = y + size / 4 + line * size / 5;
            for px in x + size / 6..x + size * 5 / 6 {
                for t in 0..3 {
                    img.put_pixel(px, ly + t, Rgb([30, 30, 30]));
                }
            }
        }
    }

    fn grid_image() -> RgbImage {
        let colors = [
            Rgb([250, 235, 110]),
            Rgb([250, 180, 200]),
            Rgb([140, 190, 240]),
            Rgb([170, 230, 170]),
            Rgb([250, 180, 90]),
            Rgb([245, 245, 245]),
            Rgb([190, 190, 190]),
            Rgb([200, 170, 230]),
            Rgb([250, 250, 180]),
        ];
        let mut img = RgbImage::from_pixel(900, 900, BACKGROUND);
        for (i, color) in colors.iter().enumerate() {
            let (row, col) = (i as u32 / 3, i as u32 % 3);
            paint_note(&mut img, 30 + col * 290, 30 + row * 290, 240, *color);
        }
        img
    }

    #[test]
    fn test_grid_of_nine_notes() {
        let config = SeparationConfig::default();
        let notes = Separator::new(&config).separate(&prepared(grid_image())).unwrap();

        assert_eq!(notes.len(), 9);
        let ids: Vec<&str> = notes.iter().map(|n| n.note_id.as_str()).collect();
        assert_eq!(ids[0], "note_001");
        assert_eq!(ids[8], "note_009");
        assert_eq!(notes[0].relative_position, RelativePosition::TopLeft);
        assert_eq!(notes[4].relative_position, RelativePosition::Center);
        assert_eq!(notes[8].relative_position, RelativePosition::BottomRight);

        for (i, a) in notes.iter().enumerate() {
            assert_eq!(a.detection_method, DetectionMethod::Contour);
            assert!(a.bounding_box.width >= 230 && a.bounding_box.width <= 250);
            assert_eq!(a.image.dimensions(), (a.bounding_box.width, a.bounding_box.height));
            for b in notes.iter().skip(i + 1) {
                assert!(a.bounding_box.iou(&b.bounding_box) <= config.overlap_threshold);
            }
        }
    }

    #[test]
    fn test_single_dominant_note() {
        let mut img = RgbImage::from_pixel(400, 300, BACKGROUND);
        for y in 6..294 {
            for x in 8..392 {
                img.put_pixel(x, y, Rgb([250, 235, 110]));
            }
        }
        let config = SeparationConfig::default();
        let notes = Separator::new(&config).separate(&prepared(img)).unwrap();

        assert_eq!(notes.len(), 1);
        let coverage = notes[0].bounding_box.area() as f32 / (400.0 * 300.0);
        assert!(coverage >= 0.9, "coverage {coverage}");
    }

    #[test]
    fn test_blank_image_has_no_regions() {
        let img = RgbImage::from_pixel(300, 300, Rgb([250, 235, 110]));
        let config = SeparationConfig::default();
        let separator = Separator::new(&config);
        let pre = prepared(img);
        assert!(separator.separate(&pre).unwrap().is_empty());

        let whole = separator.whole_image(&pre);
        assert_eq!(whole.note_id, "note_001");
        assert_eq!(whole.bounding_box, BoundingBox::new(0, 0, 300, 300));
        assert_eq!(whole.detection_method, DetectionMethod::FullImage);
    }

    #[test]
    fn test_uniform_grid_covers_image() {
        let pre = prepared(RgbImage::from_pixel(301, 300, BACKGROUND));
        let config = SeparationConfig::default();
        let cells = Separator::new(&config).grid(&pre, 3, 3);
        assert_eq!(cells.len(), 9);
        let total: u64 = cells.iter().map(|c| c.bounding_box.area()).sum();
        assert_eq!(total, 301 * 300);
        assert_eq!(cells[8].relative_position, RelativePosition::BottomRight);
        assert_eq!(cells[8].note_id, "note_009");
    }

    #[test]
    fn test_watershed_splits_overlapping_squares() {
        // Two squares overlapping on a diagonal form one non-rectangular blob
        let mut mask = GrayImage::new(400, 400);
        for y in 40..200 {
            for x in 40..200 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        for y in 120..280 {
            for x in 120..280 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let config = SeparationConfig::default();
        let separator = Separator::new(&config);
        let pieces = separator.watershed_split(&mask, &BoundingBox::new(40, 40, 240, 240));
        assert_eq!(pieces.len(), 2);
        assert!(pieces.iter().all(|p| p.method == DetectionMethod::Watershed));
    }

    #[test]
    fn test_contour_confidence_bounds() {
        assert!((contour_confidence(0.05, 1.0, 4) - 1.0).abs() < 1e-6);
        let low = contour_confidence(0.9, 2.5, 8);
        assert!((low - (0.3 * 0.4 + 0.5 * 0.3 + 0.6 * 0.3)).abs() < 1e-6);
    }

    #[test]
    fn test_distance_transform_peak_at_center() {
        let mask = GrayImage::from_pixel(21, 21, Luma([255]));
        let d = distance_to_background(&mask);
        let center = d[10 * 21 + 10];
        assert!((center - 11.0).abs() < 1e-4);
        assert!((d[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_distance_transform_respects_holes() {
        let mut mask = GrayImage::from_pixel(21, 21, Luma([255]));
        mask.put_pixel(10, 10, Luma([0]));
        let d = distance_to_background(&mask);
        assert_eq!(d[10 * 21 + 10], 0.0);
        assert!((d[10 * 21 + 13] - 3.0).abs() < 1e-4);
        assert!((d[13 * 21 + 14] - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_window_stats_clip_at_borders() {
        let gray = GrayImage::from_fn(10, 10, |x, _| Luma([if x < 5 { 0 } else { 200 }]));
        let windows = WindowStats::new(&gray);
        assert_eq!(windows.around(1, 1, 1), (0.0, 0.0));
        let (mean, std) = windows.around(9, 9, 1);
        assert_eq!(mean, 200.0);
        assert_eq!(std, 0.0);
        let (mean, std) = windows.around(5, 5, 1);
        assert!((mean - 400.0 / 3.0).abs() < 1e-3);
        assert!(std > 90.0);
    }
}
