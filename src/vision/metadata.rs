//! Visual metadata for a separated note
//!
//! Dominant and background colors mapped onto a named palette, QR codes
//! decoded at four rotations, and the note type, size and category guesses
//! derived from them. Failures here never block text extraction.

use image::imageops::{rotate180, rotate270, rotate90};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::separation::SeparatedNote;
use super::{to_gray, BoundingBox};
use crate::config::MetadataConfig;
use crate::error::{PipelineError, Result};

/// A palette-mapped color
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedColor {
    pub rgb: [u8; 3],
    /// `#rrggbb`
    pub hex: String,
    /// Palette name or `unknown`
    pub name: String,
}

/// A decoded machine-readable code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedCode {
    pub payload: String,
    pub symbology: String,
    /// Location in source-image pixels
    pub position: BoundingBox,
    /// Rotation (degrees) at which the code was read
    pub rotation: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    StickyNote,
    Paper,
    Unknown,
}

/// Everything the metadata stage learns about one note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualMetadata {
    pub dominant_color: NamedColor,
    pub background_color: NamedColor,
    pub codes: Vec<DecodedCode>,
    pub estimated_note_type: NoteType,
    pub physical_size_estimate: String,
    pub suggested_category: String,
}

/// Code found by a decoder, in the coordinates of the image it was given
#[derive(Debug, Clone)]
pub struct RawCode {
    pub payload: String,
    pub bounds: BoundingBox,
}

/// Pluggable code reader
pub trait CodeDecoder: Send + Sync {
    fn symbology(&self) -> &str;
    fn decode(&self, image: &GrayImage) -> Vec<RawCode>;
}

/// QR code reader backed by `rqrr`
#[derive(Debug, Default, Clone, Copy)]
pub struct QrCodeDecoder;

impl CodeDecoder for QrCodeDecoder {
    fn symbology(&self) -> &str {
        "QR-Code"
    }

    fn decode(&self, image: &GrayImage) -> Vec<RawCode> {
        let (w, h) = image.dimensions();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(w as usize, h as usize, |x, y| {
            image.get_pixel(x as u32, y as u32).0[0]
        });

        prepared
            .detect_grids()
            .into_iter()
            .filter_map(|grid| {
                let xs = grid.bounds.iter().map(|p| p.x.max(0) as u32);
                let ys = grid.bounds.iter().map(|p| p.y.max(0) as u32);
                let (min_x, max_x) = (xs.clone().min()?, xs.max()?);
                let (min_y, max_y) = (ys.clone().min()?, ys.max()?);
                match grid.decode() {
                    Ok((_, payload)) => Some(RawCode {
                        payload,
                        bounds: BoundingBox::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1),
                    }),
                    Err(e) => {
                        debug!("QR grid found but not decodable: {}", e);
                        None
                    }
                }
            })
            .collect()
    }
}

/// Metadata extraction stage
pub struct MetadataExtractor<'a> {
    config: &'a MetadataConfig,
    decoder: &'a dyn CodeDecoder,
}

impl<'a> MetadataExtractor<'a> {
    pub fn new(config: &'a MetadataConfig, decoder: &'a dyn CodeDecoder) -> Self {
        Self { config, decoder }
    }

    pub fn extract(&self, note: &SeparatedNote) -> Result<VisualMetadata> {
        let image = &note.image;
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::Metadata(format!("{} has an empty sub-image", note.note_id)));
        }

        let dominant = dominant_color(
            image,
            self.config.clusters,
            self.config.kmeans_iterations,
            self.config.sample_limit,
        );
        let background = edge_median_color(image, self.config.edge_width);
        let dominant_color = self.named(dominant);
        let background_color = self.named(background);

        let codes = self.decode_codes(note);

        let paper_name = if background_color.name != "unknown" {
            background_color.name.as_str()
        } else {
            dominant_color.name.as_str()
        };
        let estimated_note_type = note_type_for(paper_name);
        let physical_size_estimate = size_estimate(&note.bounding_box).to_string();
        let suggested_category = self.category(paper_name, &codes);

        debug!(
            "{}: dominant={} background={} codes={} category={}",
            note.note_id,
            dominant_color.name,
            background_color.name,
            codes.len(),
            suggested_category
        );

        Ok(VisualMetadata {
            dominant_color,
            background_color,
            codes,
            estimated_note_type,
            physical_size_estimate,
            suggested_category,
        })
    }

    fn named(&self, rgb: [u8; 3]) -> NamedColor {
        NamedColor {
            rgb,
            hex: format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2]),
            name: palette_name(&self.config.palette, rgb).to_string(),
        }
    }

    /// Try all four orientations, keep the first sighting of each payload
    fn decode_codes(&self, note: &SeparatedNote) -> Vec<DecodedCode> {
        let gray = to_gray(&note.image);
        let (w, h) = gray.dimensions();
        let origin = &note.bounding_box;

        let orientations: [(u16, GrayImage); 4] = [
            (0, gray.clone()),
            (90, rotate90(&gray)),
            (180, rotate180(&gray)),
            (270, rotate270(&gray)),
        ];

        let mut codes: Vec<DecodedCode> = Vec::new();
        for (rotation, rotated) in orientations.iter() {
            for raw in self.decoder.decode(rotated) {
                if codes.iter().any(|c| c.payload == raw.payload) {
                    continue;
                }
                let local = unrotate(&raw.bounds, *rotation, w, h);
                codes.push(DecodedCode {
                    payload: raw.payload,
                    symbology: self.decoder.symbology().to_string(),
                    position: local.translated(origin.x, origin.y),
                    rotation: *rotation,
                });
            }
        }
        codes
    }

    fn category(&self, color_name: &str, codes: &[DecodedCode]) -> String {
        for code in codes {
            let payload = code.payload.to_lowercase();
            for rule in &self.config.keyword_categories {
                if rule.keywords.iter().any(|k| payload.contains(&k.to_lowercase())) {
                    return rule.category.clone();
                }
            }
        }
        self.config
            .categories
            .get(color_name)
            .cloned()
            .unwrap_or_else(|| self.config.default_category.clone())
    }
}

/// First palette entry containing the color, else `unknown`
pub fn palette_name(palette: &[crate::config::PaletteEntry], rgb: [u8; 3]) -> &str {
    palette
        .iter()
        .find(|entry| entry.contains(rgb))
        .map_or("unknown", |entry| entry.name.as_str())
}

fn note_type_for(color_name: &str) -> NoteType {
    match color_name {
        "yellow" | "pink" | "blue" | "green" | "orange" => NoteType::StickyNote,
        "white" => NoteType::Paper,
        _ => NoteType::Unknown,
    }
}

fn size_estimate(bounds: &BoundingBox) -> &'static str {
    let long = bounds.width.max(bounds.height) as f32;
    let short = bounds.width.min(bounds.height) as f32;
    if long == 0.0 {
        return "unknown";
    }
    let ratio = short / long;
    if ratio >= 0.8 {
        "3x3_inches"
    } else if ratio >= 0.55 {
        "3x5_inches"
    } else {
        "unknown"
    }
}

/// Map a box found in a rotated copy back to the unrotated `w`x`h` image
fn unrotate(b: &BoundingBox, rotation: u16, w: u32, h: u32) -> BoundingBox {
    match rotation {
        90 => BoundingBox::new(b.y, h.saturating_sub(b.x + b.width), b.height, b.width),
        180 => BoundingBox::new(
            w.saturating_sub(b.x + b.width),
            h.saturating_sub(b.y + b.height),
            b.width,
            b.height,
        ),
        270 => BoundingBox::new(w.saturating_sub(b.y + b.height), b.x, b.height, b.width),
        _ => *b,
    }
}

/// Center of the largest k-means cluster over a pixel sample
pub fn dominant_color(image: &RgbImage, k: usize, iterations: usize, sample_limit: usize) -> [u8; 3] {
    let total = image.width() as usize * image.height() as usize;
    let step = (total / sample_limit.max(1)).max(1);
    let samples: Vec<[f32; 3]> = image
        .pixels()
        .step_by(step)
        .map(|p| [p.0[0] as f32, p.0[1] as f32, p.0[2] as f32])
        .collect();
    if samples.is_empty() {
        return [0, 0, 0];
    }
    let k = k.clamp(1, samples.len());

    // Deterministic seeding at luminance quantiles
    let mut by_luma = samples.clone();
    by_luma.sort_by(|a, b| luma(a).total_cmp(&luma(b)));
    let mut centers: Vec<[f32; 3]> = (0..k)
        .map(|i| by_luma[((2 * i + 1) * by_luma.len()) / (2 * k)])
        .collect();

    let mut assignment = vec![usize::MAX; samples.len()];
    for _ in 0..iterations.max(1) {
        let mut changed = false;
        for (i, s) in samples.iter().enumerate() {
            let nearest = nearest_center(&centers, s);
            if assignment[i] != nearest {
                assignment[i] = nearest;
                changed = true;
            }
        }

        let mut sums = vec![[0f64; 3]; k];
        let mut counts = vec![0usize; k];
        for (s, &c) in samples.iter().zip(&assignment) {
            counts[c] += 1;
            for ch in 0..3 {
                sums[c][ch] += s[ch] as f64;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for ch in 0..3 {
                    centers[c][ch] = (sums[c][ch] / counts[c] as f64) as f32;
                }
            }
        }

        if !changed {
            break;
        }
    }

    let mut counts = vec![0usize; k];
    for &c in &assignment {
        counts[c] += 1;
    }
    let largest = counts
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)
        .map_or(0, |(i, _)| i);
    let c = centers[largest];
    [
        c[0].round().clamp(0.0, 255.0) as u8,
        c[1].round().clamp(0.0, 255.0) as u8,
        c[2].round().clamp(0.0, 255.0) as u8,
    ]
}

fn luma(c: &[f32; 3]) -> f32 {
    0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2]
}

fn nearest_center(centers: &[[f32; 3]], s: &[f32; 3]) -> usize {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let d: f32 = (0..3).map(|ch| (c[ch] - s[ch]).powi(2)).sum();
            (i, d)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(i, _)| i)
}

/// Per-channel median of the pixels within `edge` of the border
pub fn edge_median_color(image: &RgbImage, edge: u32) -> [u8; 3] {
    let (w, h) = image.dimensions();
    let edge = edge.max(1);
    let mut channels: [Vec<u8>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for (x, y, p) in image.enumerate_pixels() {
        let on_edge = x < edge || y < edge || x + edge >= w || y + edge >= h;
        if on_edge {
            for c in 0..3 {
                channels[c].push(p.0[c]);
            }
        }
    }
    let mut out = [0u8; 3];
    for c in 0..3 {
        let values = &mut channels[c];
        if values.is_empty() {
            continue;
        }
        values.sort_unstable();
        out[c] = values[values.len() / 2];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::separation::DetectionMethod;
    use crate::vision::RelativePosition;
    use image::Rgb;

    struct FakeDecoder {
        payload: &'static str,
        /// Only "sees" the code at this rotation
        visible_at: Option<(u32, u32)>,
    }

    impl CodeDecoder for FakeDecoder {
        fn symbology(&self) -> &str {
            "QR-Code"
        }

        fn decode(&self, image: &GrayImage) -> Vec<RawCode> {
            match self.visible_at {
                Some(dims) if image.dimensions() != dims => Vec::new(),
                _ => vec![RawCode {
                    payload: self.payload.to_string(),
                    bounds: BoundingBox::new(0, 0, 10, 20),
                }],
            }
        }
    }

    fn note_with(image: RgbImage) -> SeparatedNote {
        let (w, h) = image.dimensions();
        SeparatedNote {
            note_id: "note_001".to_string(),
            bounding_box: BoundingBox::new(100, 50, w, h),
            rotation_angle: 0.0,
            relative_position: RelativePosition::Center,
            detection_method: DetectionMethod::Contour,
            detection_confidence: 1.0,
            image,
        }
    }

    fn yellow_note() -> RgbImage {
        RgbImage::from_fn(120, 120, |x, y| {
            if (40..80).contains(&x) && (50..60).contains(&y) {
                Rgb([20, 20, 20])
            } else {
                Rgb([250, 240, 120])
            }
        })
    }

    #[test]
    fn test_dominant_and_background_colors() {
        let config = MetadataConfig::default();
        let decoder = QrCodeDecoder;
        let meta = MetadataExtractor::new(&config, &decoder)
            .extract(&note_with(yellow_note()))
            .unwrap();

        assert_eq!(meta.dominant_color.rgb, [250, 240, 120]);
        assert_eq!(meta.dominant_color.hex, "#faf078");
        assert_eq!(meta.dominant_color.name, "yellow");
        assert_eq!(meta.background_color.name, "yellow");
        assert_eq!(meta.estimated_note_type, NoteType::StickyNote);
        assert_eq!(meta.physical_size_estimate, "3x3_inches");
        assert_eq!(meta.suggested_category, "general");
        assert!(meta.codes.is_empty());
    }

    #[test]
    fn test_palette_defaults_to_unknown() {
        let config = MetadataConfig::default();
        assert_eq!(palette_name(&config.palette, [10, 10, 10]), "unknown");
        assert_eq!(palette_name(&config.palette, [250, 250, 250]), "white");
        assert_eq!(palette_name(&config.palette, [175, 175, 175]), "gray");
    }

    #[test]
    fn test_codes_deduplicated_across_rotations() {
        let config = MetadataConfig::default();
        let decoder = FakeDecoder {
            payload: "project:alpha",
            visible_at: None,
        };
        let meta = MetadataExtractor::new(&config, &decoder)
            .extract(&note_with(yellow_note()))
            .unwrap();
        assert_eq!(meta.codes.len(), 1);
        assert_eq!(meta.codes[0].rotation, 0);
        assert_eq!(meta.codes[0].position, BoundingBox::new(100, 50, 10, 20));
    }

    #[test]
    fn test_code_payload_overrides_category() {
        let config = MetadataConfig::default();
        let decoder = FakeDecoder {
            payload: "OFFICE-42",
            visible_at: None,
        };
        let meta = MetadataExtractor::new(&config, &decoder)
            .extract(&note_with(yellow_note()))
            .unwrap();
        assert_eq!(meta.suggested_category, "work");
    }

    #[test]
    fn test_code_seen_only_when_rotated() {
        let config = MetadataConfig::default();
        // 160x90 note; rotated by 90 degrees the decoder sees 90x160
        let image = RgbImage::from_pixel(160, 90, Rgb([250, 180, 200]));
        let decoder = FakeDecoder {
            payload: "urgent task",
            visible_at: Some((90, 160)),
        };
        let meta = MetadataExtractor::new(&config, &decoder)
            .extract(&note_with(image))
            .unwrap();
        assert_eq!(meta.codes.len(), 1);
        assert_eq!(meta.codes[0].rotation, 90);
        // (0,0,10,20) in the rotated copy maps to x=0, y=90-10, 20x10 before rotation
        assert_eq!(meta.codes[0].position, BoundingBox::new(100, 50 + 80, 20, 10));
        assert_eq!(meta.suggested_category, "urgent");
        assert_eq!(meta.physical_size_estimate, "3x5_inches");
    }

    #[test]
    fn test_unrotate_round_trips_corners() {
        let b = BoundingBox::new(5, 10, 20, 30);
        assert_eq!(unrotate(&b, 0, 100, 80), b);
        assert_eq!(unrotate(&b, 180, 100, 80), BoundingBox::new(75, 40, 20, 30));
        assert_eq!(unrotate(&b, 270, 100, 80), BoundingBox::new(60, 5, 30, 20));
    }

    #[test]
    fn test_edge_median_ignores_center() {
        let img = RgbImage::from_fn(50, 50, |x, y| {
            if (10..40).contains(&x) && (10..40).contains(&y) {
                Rgb([0, 0, 0])
            } else {
                Rgb([140, 190, 240])
            }
        });
        assert_eq!(edge_median_color(&img, 2), [140, 190, 240]);
    }

    #[test]
    fn test_kmeans_picks_majority_color() {
        let img = RgbImage::from_fn(100, 100, |x, _| {
            if x < 30 {
                Rgb([20, 20, 20])
            } else {
                Rgb([170, 230, 170])
            }
        });
        assert_eq!(dominant_color(&img, 5, 20, 10_000), [170, 230, 170]);
    }
}
