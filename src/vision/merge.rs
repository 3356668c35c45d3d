//! Cross-method text merge
//!
//! Aligns the traditional OCR text with the vision model text using a
//! token-level longest common subsequence and resolves every disagreement:
//! conflicts take the vision model's span, vision-only spans are kept, and
//! traditional-only spans are kept unless they look like recognition noise.
//! Pure and deterministic; no service is involved.

use serde::{Deserialize, Serialize};

use crate::config::NoiseRules;

/// Above this many DP cells the alignment falls back to whole lines
const MAX_TOKEN_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Both methods produced different text here
    Conflict,
    /// Only the traditional recognizer produced this text
    TraditionalOnly,
    /// Only the vision model produced this text
    VisionOnly,
}

/// One place where the two texts disagree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSpan {
    pub kind: SpanKind,
    pub traditional: String,
    pub vision: String,
    /// Text that went into the merged output for this span
    pub kept: String,
}

impl ConflictSpan {
    /// Human-readable audit line
    pub fn describe(&self) -> String {
        match self.kind {
            SpanKind::Conflict => format!(
                "replaced {:?} with {:?}",
                self.traditional.trim(),
                self.vision.trim()
            ),
            SpanKind::TraditionalOnly if self.kept.is_empty() => {
                format!("dropped traditional-only noise {:?}", self.traditional.trim())
            }
            SpanKind::TraditionalOnly => format!("kept traditional-only {:?}", self.traditional.trim()),
            SpanKind::VisionOnly => format!("added vision-only {:?}", self.vision.trim()),
        }
    }
}

/// Merged text plus every disagreement that shaped it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub text: String,
    pub conflicts: Vec<ConflictSpan>,
}

impl MergeOutcome {
    pub fn differences(&self) -> Vec<String> {
        self.conflicts.iter().map(ConflictSpan::describe).collect()
    }
}

enum Op {
    Equal(usize),
    Delete(usize),
    Insert(usize),
}

/// Merge two independent transcriptions of the same note
pub fn merge_texts(traditional: &str, vision: &str, noise: &NoiseRules) -> MergeOutcome {
    let (a, b) = {
        let a = tokenize(traditional);
        let b = tokenize(vision);
        if a.len().saturating_mul(b.len()) > MAX_TOKEN_CELLS {
            (tokenize_lines(traditional), tokenize_lines(vision))
        } else {
            (a, b)
        }
    };

    let ops = align(&a, &b);

    let mut text = String::with_capacity(vision.len().max(traditional.len()));
    let mut conflicts = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    let mut k = 0;
    while k < ops.len() {
        match ops[k] {
            Op::Equal(ai) => {
                text.push_str(a[ai]);
                i += 1;
                j += 1;
                k += 1;
            }
            _ => {
                // Gather the run of edits between two equal tokens
                let (start_i, start_j) = (i, j);
                while k < ops.len() {
                    match ops[k] {
                        Op::Delete(_) => i += 1,
                        Op::Insert(_) => j += 1,
                        Op::Equal(_) => break,
                    }
                    k += 1;
                }
                let trad_span: String = a[start_i..i].concat();
                let vision_span: String = b[start_j..j].concat();
                resolve(&trad_span, &vision_span, noise, &mut text, &mut conflicts);
            }
        }
    }

    MergeOutcome { text, conflicts }
}

fn resolve(
    trad_span: &str,
    vision_span: &str,
    noise: &NoiseRules,
    text: &mut String,
    conflicts: &mut Vec<ConflictSpan>,
) {
    let whitespace_only = trad_span.trim().is_empty() && vision_span.trim().is_empty();

    let (kind, kept) = match (trad_span.is_empty(), vision_span.is_empty()) {
        (false, false) => (SpanKind::Conflict, vision_span.to_string()),
        (true, false) => (SpanKind::VisionOnly, vision_span.to_string()),
        (false, true) => {
            let kept = if looks_like_noise(trad_span, noise) {
                String::new()
            } else {
                trad_span.to_string()
            };
            (SpanKind::TraditionalOnly, kept)
        }
        (true, true) => return,
    };

    text.push_str(&kept);
    if !whitespace_only {
        conflicts.push(ConflictSpan {
            kind,
            traditional: trad_span.to_string(),
            vision: vision_span.to_string(),
            kept,
        });
    }
}

/// Edit script from a suffix-LCS table
fn align(a: &[&str], b: &[&str]) -> Vec<Op> {
    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if a[i] == b[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            ops.push(Op::Equal(i));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            ops.push(Op::Delete(i));
            i += 1;
        } else {
            ops.push(Op::Insert(j));
            j += 1;
        }
    }
    ops.extend((i..n).map(Op::Delete));
    ops.extend((j..m).map(Op::Insert));
    ops
}

/// Alternating runs of whitespace and non-whitespace
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space: Option<bool> = None;
    for (idx, ch) in text.char_indices() {
        let space = ch.is_whitespace();
        match in_space {
            Some(prev) if prev != space => {
                tokens.push(&text[start..idx]);
                start = idx;
            }
            _ => {}
        }
        in_space = Some(space);
    }
    if start < text.len() {
        tokens.push(&text[start..]);
    }
    tokens
}

fn tokenize_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Heuristic noise check for spans only the traditional recognizer saw
pub fn looks_like_noise(span: &str, rules: &NoiseRules) -> bool {
    let trimmed = span.trim();
    if trimmed.is_empty() {
        return true;
    }

    let total = trimmed.chars().count();
    let unusual = trimmed
        .chars()
        .filter(|c| {
            !(c.is_alphanumeric() || *c == '_' || c.is_whitespace() || ".,!?:;-()[]{}\"'/\\".contains(*c))
        })
        .count();
    if unusual as f32 / total as f32 > rules.max_unusual_char_ratio {
        return true;
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.iter().any(|w| w.chars().count() > rules.max_word_length) {
        return true;
    }
    let single = words.iter().filter(|w| w.chars().count() == 1).count();
    single as f32 / words.len() as f32 > rules.max_single_char_ratio
}
