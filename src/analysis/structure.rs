//! Structure recognition
//!
//! Turns note text into a title, ordered sections and tags. Analysis is a
//! pure function of the text (plus the note bitmap for title-mark
//! confirmation) and is recomputed from scratch whenever the text changes.

use image::RgbImage;
use imageproc::contrast::otsu_level;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::patterns::{LineKind, PatternTables, TitleFormat};
use crate::config::StructureConfig;
use crate::error::Result;
use crate::shared::{call_with_policy, CallPolicy};
use crate::vision::separation::SeparatedNote;
use crate::vision::{to_gray, VisionModel};

/// Detected title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Title {
    pub text: String,
    pub detection_method: TitleFormat,
    /// 1-based line number
    pub position: usize,
    pub confidence: f32,
    /// Hand-drawn delimiter marks were seen at the note edges
    #[serde(default)]
    pub visually_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub completed: bool,
    pub line: usize,
}

/// A run of lines of one kind; line numbers are 1-based and inclusive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Section {
    BulletedList {
        line_start: usize,
        line_end: usize,
        items: Vec<ListItem>,
    },
    NumberedList {
        line_start: usize,
        line_end: usize,
        items: Vec<ListItem>,
    },
    TodoList {
        line_start: usize,
        line_end: usize,
        items: Vec<TodoItem>,
    },
    Paragraph {
        line_start: usize,
        line_end: usize,
        content: String,
    },
}

impl Section {
    pub fn lines(&self) -> (usize, usize) {
        match self {
            Self::BulletedList { line_start, line_end, .. }
            | Self::NumberedList { line_start, line_end, .. }
            | Self::TodoList { line_start, line_end, .. }
            | Self::Paragraph { line_start, line_end, .. } => (*line_start, *line_end),
        }
    }
}

/// Recognized structure of one note
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureAnalysis {
    pub title: Option<Title>,
    pub sections: Vec<Section>,
    pub simple_tags: Vec<String>,
    /// Last value wins on duplicate keys
    pub key_value_tags: BTreeMap<String, String>,
    pub has_title: bool,
    pub has_lists: bool,
    pub has_todos: bool,
    pub has_tags: bool,
}

impl StructureAnalysis {
    pub fn todos(&self) -> impl Iterator<Item = &TodoItem> {
        self.sections.iter().flat_map(|s| match s {
            Section::TodoList { items, .. } => items.as_slice(),
            _ => &[],
        })
    }

    pub fn todo_count(&self) -> usize {
        self.todos().count()
    }

    pub fn tag_count(&self) -> usize {
        self.simple_tags.len() + self.key_value_tags.len()
    }
}

/// Structure recognition stage
pub struct StructureRecognizer<'a> {
    config: &'a StructureConfig,
    patterns: &'a PatternTables,
}

impl<'a> StructureRecognizer<'a> {
    pub fn new(config: &'a StructureConfig, patterns: &'a PatternTables) -> Self {
        Self { config, patterns }
    }

    /// Analyze note text. Deterministic for a given text and bitmap.
    pub fn analyze(&self, text: &str, note: &SeparatedNote) -> StructureAnalysis {
        let lines: Vec<&str> = text.lines().collect();
        let kinds: Vec<LineKind> = lines.iter().map(|l| self.patterns.classify(l)).collect();

        let mut title = self.find_title(&lines, &kinds);
        if let Some(title) = title.as_mut() {
            if matches!(
                title.detection_method,
                TitleFormat::DoubleHash | TitleFormat::SingleHash | TitleFormat::Equals
            ) {
                title.visually_confirmed =
                    edge_marks_present(&note.image, title.position - 1, lines.len(), self.config);
            }
        }

        let sections = build_sections(&lines, &kinds, title.as_ref().map(|t| t.position));
        let (has_lists, has_todos) = section_flags(&sections);

        let simple_tags = self.patterns.simple_tags(text);
        let key_value_tags: BTreeMap<String, String> = self
            .patterns
            .key_value_tags(text)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let analysis = StructureAnalysis {
            has_title: title.is_some(),
            has_tags: !simple_tags.is_empty() || !key_value_tags.is_empty(),
            title,
            sections,
            simple_tags,
            key_value_tags,
            has_lists,
            has_todos,
        };
        debug!(
            "{}: {} section(s), title {:?}, {} tag(s)",
            note.note_id,
            analysis.sections.len(),
            analysis.title.as_ref().map(|t| t.detection_method),
            analysis.tag_count()
        );
        analysis
    }

    /// Install a title found outside the text patterns; its line leaves
    /// the sections the same way a patterned title does
    pub fn apply_title(&self, analysis: &mut StructureAnalysis, text: &str, title: Title) {
        let lines: Vec<&str> = text.lines().collect();
        let kinds: Vec<LineKind> = lines.iter().map(|l| self.patterns.classify(l)).collect();
        analysis.sections = build_sections(&lines, &kinds, Some(title.position));
        (analysis.has_lists, analysis.has_todos) = section_flags(&analysis.sections);
        analysis.title = Some(title);
        analysis.has_title = true;
    }

    /// Whether the model should be asked for a title
    pub fn wants_title_hint(&self, analysis: &StructureAnalysis, text: &str) -> bool {
        self.config.llm_title_fallback
            && analysis.title.is_none()
            && text.lines().filter(|l| !l.trim().is_empty()).count() >= 2
    }

    /// Ask the language model which line is the title
    ///
    /// The reply must repeat one of the note's lines verbatim; anything else
    /// is treated as "no title".
    pub async fn suggest_title(
        &self,
        model: &dyn VisionModel,
        text: &str,
        policy: &CallPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<Title>> {
        let prompt = format!(
            "The following lines were transcribed from a handwritten note.\n\
             Reply with the single line that works best as the note's title, copied exactly, \
             or NONE if no line is title-like.\n\n{text}"
        );
        let reply = call_with_policy(policy, cancel, || model.complete(&prompt)).await?;
        Ok(title_from_reply(text, &reply))
    }

    fn find_title(&self, lines: &[&str], kinds: &[LineKind]) -> Option<Title> {
        for (i, line) in lines.iter().enumerate() {
            if let Some((format, text)) = self.patterns.match_title(line) {
                if !text.is_empty() {
                    return Some(Title {
                        text,
                        detection_method: format,
                        position: i + 1,
                        confidence: 1.0,
                        visually_confirmed: false,
                    });
                }
            }
        }
        heuristic_title(lines, kinds)
    }
}

/// Underlined, all-caps, bracketed, then first-line titles, within the first three lines
fn heuristic_title(lines: &[&str], kinds: &[LineKind]) -> Option<Title> {
    let non_empty = kinds.iter().filter(|k| **k != LineKind::Blank).count();

    for (i, (line, kind)) in lines.iter().zip(kinds).enumerate().take(3) {
        if *kind == LineKind::Blank || kind.is_list() {
            continue;
        }
        let line = line.trim();
        if line.starts_with("::") || line.starts_with('@') {
            continue;
        }
        let title = |text: &str, method: TitleFormat, confidence: f32| {
            Some(Title {
                text: text.trim().to_string(),
                detection_method: method,
                position: i + 1,
                confidence,
                visually_confirmed: false,
            })
        };

        if line.len() > 2 && line.starts_with('_') && line.ends_with('_') {
            return title(line.trim_matches('_'), TitleFormat::Underlined, 0.8);
        }
        let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
        if letters.len() > 3 && letters.iter().all(|c| c.is_uppercase()) {
            return title(&title_case(line), TitleFormat::AllCaps, 0.7);
        }
        if line.len() > 2
            && ((line.starts_with('[') && line.ends_with(']'))
                || (line.starts_with('(') && line.ends_with(')')))
        {
            return title(&line[1..line.len() - 1], TitleFormat::Bracketed, 0.6);
        }
        if non_empty >= 2 && line.chars().count() > 3 {
            return title(line, TitleFormat::FirstLine, 0.5);
        }
    }
    None
}

fn title_case(line: &str) -> String {
    line.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn title_from_reply(text: &str, reply: &str) -> Option<Title> {
    let wanted = reply.trim().trim_matches('"').trim();
    if wanted.is_empty() || wanted.eq_ignore_ascii_case("none") {
        return None;
    }
    text.lines()
        .position(|l| l.trim() == wanted)
        .map(|i| Title {
            text: wanted.to_string(),
            detection_method: TitleFormat::LanguageModel,
            position: i + 1,
            confidence: 0.6,
            visually_confirmed: false,
        })
}

fn section_flags(sections: &[Section]) -> (bool, bool) {
    let has_lists = sections
        .iter()
        .any(|s| matches!(s, Section::BulletedList { .. } | Section::NumberedList { .. }));
    let has_todos = sections.iter().any(|s| matches!(s, Section::TodoList { .. }));
    (has_lists, has_todos)
}

/// Group classified lines into sections in document order
fn build_sections(lines: &[&str], kinds: &[LineKind], title_line: Option<usize>) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut expected_number: Option<u32> = None;
    // Whether the last section may still grow with the next line
    let mut open = false;

    for (i, (line, kind)) in lines.iter().zip(kinds).enumerate() {
        let line_no = i + 1;
        if title_line == Some(line_no) || *kind == LineKind::Blank {
            open = false;
            expected_number = None;
            continue;
        }

        let last = if open { sections.last_mut() } else { None };
        match (kind, last) {
            (LineKind::Bullet { text }, Some(Section::BulletedList { items, line_end, .. })) => {
                items.push(ListItem {
                    text: text.clone(),
                    number: None,
                    line: line_no,
                });
                *line_end = line_no;
            }
            (LineKind::Numbered { number, text }, Some(Section::NumberedList { items, line_end, .. }))
                if expected_number == Some(*number) =>
            {
                items.push(ListItem {
                    text: text.clone(),
                    number: Some(*number),
                    line: line_no,
                });
                *line_end = line_no;
                expected_number = Some(number + 1);
            }
            (LineKind::Todo { text, completed }, Some(Section::TodoList { items, line_end, .. })) => {
                items.push(TodoItem {
                    text: text.clone(),
                    completed: *completed,
                    line: line_no,
                });
                *line_end = line_no;
            }
            (LineKind::Text, Some(Section::Paragraph { content, line_end, .. })) => {
                content.push('\n');
                content.push_str(line.trim());
                *line_end = line_no;
            }
            (kind, _) => {
                expected_number = None;
                sections.push(match kind {
                    LineKind::Bullet { text } => Section::BulletedList {
                        line_start: line_no,
                        line_end: line_no,
                        items: vec![ListItem {
                            text: text.clone(),
                            number: None,
                            line: line_no,
                        }],
                    },
                    LineKind::Numbered { number, text } => {
                        expected_number = Some(number + 1);
                        Section::NumberedList {
                            line_start: line_no,
                            line_end: line_no,
                            items: vec![ListItem {
                                text: text.clone(),
                                number: Some(*number),
                                line: line_no,
                            }],
                        }
                    }
                    LineKind::Todo { text, completed } => Section::TodoList {
                        line_start: line_no,
                        line_end: line_no,
                        items: vec![TodoItem {
                            text: text.clone(),
                            completed: *completed,
                            line: line_no,
                        }],
                    },
                    LineKind::Text | LineKind::Blank => Section::Paragraph {
                        line_start: line_no,
                        line_end: line_no,
                        content: line.trim().to_string(),
                    },
                });
            }
        }
        open = true;
    }
    sections
}

/// Ink on both the left and right edge strips at the title's height
fn edge_marks_present(image: &RgbImage, line_index: usize, line_count: usize, config: &StructureConfig) -> bool {
    let (width, height) = image.dimensions();
    if width < 10 || height < 10 || line_count == 0 {
        return false;
    }
    let gray = to_gray(image);
    let level = otsu_level(&gray);

    let band_h = (height as f32 / line_count as f32).max(1.0);
    let y0 = ((line_index as f32 * band_h) as u32).min(height - 1);
    let y1 = (((line_index + 1) as f32 * band_h).ceil() as u32).clamp(y0 + 1, height);
    let strip = ((width as f32 * config.edge_mark_strip_ratio) as u32).clamp(1, width / 2);

    let density = |x0: u32, x1: u32| -> f32 {
        let mut ink = 0u32;
        for y in y0..y1 {
            for x in x0..x1 {
                if gray.get_pixel(x, y)[0] <= level {
                    ink += 1;
                }
            }
        }
        ink as f32 / ((x1 - x0) * (y1 - y0)).max(1) as f32
    };

    // A blank note has no ink split at all
    if gray.pixels().all(|p| p[0] == gray.get_pixel(0, 0)[0]) {
        return false;
    }
    density(0, strip) >= config.edge_mark_min_density
        && density(width - strip, width) >= config.edge_mark_min_density
}
