//! Line and tag pattern tables
//!
//! Every pattern the structure recognizer and the formatter use lives in
//! the tables below. Tables are ordered: the first matching row wins.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// How a title was recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleFormat {
    DoubleHash,
    SingleHash,
    Equals,
    MarkdownHeading,
    Underlined,
    AllCaps,
    Bracketed,
    FirstLine,
    LanguageModel,
}

/// Delimiter patterns; group 1 is the title text
const TITLE_PATTERNS: &[(TitleFormat, &str)] = &[
    (TitleFormat::DoubleHash, r"^\s*##\s*(\S.*?)\s*##"),
    (TitleFormat::SingleHash, r"^\s*#\s*(\S.*?)\s*#(?:\s|$)"),
    (TitleFormat::Equals, r"^\s*=+\s*(\S.*?)\s*=+\s*$"),
    (TitleFormat::MarkdownHeading, r"^\s*#{1,3}\s+(\S.*?)\s*$"),
];

/// Group 1 is the item text
const BULLET_PATTERNS: &[&str] = &[
    r"^\s*[•●◦▪▫■]\s*(\S.*)$",
    r"^\s*[-*+]\s+(\S.*)$",
    r"^\s*>\s+(\S.*)$",
];

/// Group 1 is the number, group 2 the item text
const NUMBERED_PATTERNS: &[&str] = &[
    r"^\s*(\d{1,3})[.)]\s+(\S.*)$",
    r"^\s*\((\d{1,3})\)\s+(\S.*)$",
    r"^\s*(\d{1,3})\s*[-–—]\s*(\S.*)$",
];

/// Group 1 is the task text; the flag marks a completed box
const TODO_PATTERNS: &[(&str, bool)] = &[
    (r"^\s*(?:[-*]\s+)?\[\s?\]\s*(\S.*)$", false),
    (r"^\s*(?:[-*]\s+)?\[\?\]\s*(\S.*)$", false),
    (r"^\s*(?:[-*]\s+)?\[[xX✓✔]\]\s*(\S.*)$", true),
    (r"^\s*[☐□]\s*(\S.*)$", false),
    (r"^\s*[☑☒✅]\s*(\S.*)$", true),
    (r"^\s*○\s+(\S.*)$", false),
    (r"^\s*◉\s+(\S.*)$", true),
];

/// `@word`, not preceded by a word character (skips e-mail addresses)
const SIMPLE_TAG_PATTERN: &str = r"(?:^|[^\w@])@(\w+)";

/// `::key:value`
const KEY_VALUE_TAG_PATTERN: &str = r"::([A-Za-z0-9_]+):([^\s:]+)";

/// What a single line is
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Todo { text: String, completed: bool },
    Numbered { number: u32, text: String },
    Bullet { text: String },
    Blank,
    Text,
}

impl LineKind {
    pub fn is_list(&self) -> bool {
        matches!(self, Self::Todo { .. } | Self::Numbered { .. } | Self::Bullet { .. })
    }
}

struct TodoPattern {
    regex: Regex,
    completed: bool,
}

/// Compiled pattern tables
pub struct PatternTables {
    titles: Vec<(TitleFormat, Regex)>,
    bullets: Vec<Regex>,
    numbered: Vec<Regex>,
    todos: Vec<TodoPattern>,
    simple_tag: Regex,
    key_value_tag: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PipelineError::Config(format!("bad pattern {pattern:?}: {e}")))
}

impl PatternTables {
    pub fn compile() -> Result<Self> {
        Ok(Self {
            titles: TITLE_PATTERNS
                .iter()
                .map(|(format, p)| Ok((*format, compile(p)?)))
                .collect::<Result<_>>()?,
            bullets: BULLET_PATTERNS.iter().map(|p| compile(p)).collect::<Result<_>>()?,
            numbered: NUMBERED_PATTERNS.iter().map(|p| compile(p)).collect::<Result<_>>()?,
            todos: TODO_PATTERNS
                .iter()
                .map(|(p, completed)| {
                    Ok(TodoPattern {
                        regex: compile(p)?,
                        completed: *completed,
                    })
                })
                .collect::<Result<_>>()?,
            simple_tag: compile(SIMPLE_TAG_PATTERN)?,
            key_value_tag: compile(KEY_VALUE_TAG_PATTERN)?,
        })
    }

    /// Delimited title on this line, if any
    pub fn match_title(&self, line: &str) -> Option<(TitleFormat, String)> {
        self.titles.iter().find_map(|(format, regex)| {
            regex
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| (*format, m.as_str().trim().to_string()))
        })
    }

    /// Classify one line; to-dos win over numbered items, which win over bullets
    pub fn classify(&self, line: &str) -> LineKind {
        if line.trim().is_empty() {
            return LineKind::Blank;
        }

        for todo in &self.todos {
            if let Some(text) = todo.regex.captures(line).and_then(|c| c.get(1)) {
                return LineKind::Todo {
                    text: text.as_str().trim().to_string(),
                    completed: todo.completed,
                };
            }
        }

        for regex in &self.numbered {
            if let Some(caps) = regex.captures(line) {
                let number = caps.get(1).and_then(|m| m.as_str().parse().ok());
                if let (Some(number), Some(text)) = (number, caps.get(2)) {
                    return LineKind::Numbered {
                        number,
                        text: text.as_str().trim().to_string(),
                    };
                }
            }
        }

        for regex in &self.bullets {
            if let Some(text) = regex.captures(line).and_then(|c| c.get(1)) {
                return LineKind::Bullet {
                    text: text.as_str().trim().to_string(),
                };
            }
        }

        LineKind::Text
    }

    /// `@tag` names in order of appearance, duplicates removed
    pub fn simple_tags(&self, text: &str) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for caps in self.simple_tag.captures_iter(text) {
            if let Some(name) = caps.get(1) {
                let name = name.as_str().to_string();
                if !tags.contains(&name) {
                    tags.push(name);
                }
            }
        }
        tags
    }

    /// `::key:value` pairs in order of appearance
    pub fn key_value_tags<'t>(&self, text: &'t str) -> Vec<(&'t str, &'t str)> {
        self.key_value_tag
            .captures_iter(text)
            .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> PatternTables {
        PatternTables::compile().unwrap()
    }

    #[test]
    fn test_title_table_order() {
        let t = tables();
        assert_eq!(
            t.match_title("## Groceries ##"),
            Some((TitleFormat::DoubleHash, "Groceries".to_string()))
        );
        assert_eq!(
            t.match_title("# Plan #"),
            Some((TitleFormat::SingleHash, "Plan".to_string()))
        );
        assert_eq!(
            t.match_title("=== Week 3 ==="),
            Some((TitleFormat::Equals, "Week 3".to_string()))
        );
        assert_eq!(
            t.match_title("## Ideas"),
            Some((TitleFormat::MarkdownHeading, "Ideas".to_string()))
        );
        assert_eq!(t.match_title("#urgent call"), None);
        assert_eq!(t.match_title("Buy milk"), None);
    }

    #[test]
    fn test_checkbox_lines() {
        let t = tables();
        assert_eq!(
            t.classify("[ ] Buy milk"),
            LineKind::Todo {
                text: "Buy milk".to_string(),
                completed: false
            }
        );
        assert_eq!(
            t.classify("[x] Buy milk"),
            LineKind::Todo {
                text: "Buy milk".to_string(),
                completed: true
            }
        );
        assert_eq!(
            t.classify("- [X] ship it"),
            LineKind::Todo {
                text: "ship it".to_string(),
                completed: true
            }
        );
        assert!(matches!(t.classify("☐ water plants"), LineKind::Todo { completed: false, .. }));
        assert!(matches!(t.classify("☑ water plants"), LineKind::Todo { completed: true, .. }));
        assert!(matches!(t.classify("[?] maybe"), LineKind::Todo { completed: false, .. }));
    }

    #[test]
    fn test_list_lines() {
        let t = tables();
        assert_eq!(
            t.classify("  - eggs"),
            LineKind::Bullet {
                text: "eggs".to_string()
            }
        );
        assert_eq!(
            t.classify("• bread"),
            LineKind::Bullet {
                text: "bread".to_string()
            }
        );
        assert_eq!(
            t.classify("2) call Bob"),
            LineKind::Numbered {
                number: 2,
                text: "call Bob".to_string()
            }
        );
        assert_eq!(
            t.classify("(3) review"),
            LineKind::Numbered {
                number: 3,
                text: "review".to_string()
            }
        );
        assert_eq!(t.classify("   "), LineKind::Blank);
        assert_eq!(t.classify("plain words"), LineKind::Text);
        assert_eq!(t.classify("-5 degrees"), LineKind::Text);
    }

    #[test]
    fn test_tags() {
        let t = tables();
        let text = "@urgent ::priority:high mail bob@example.com @urgent\n::owner:ana ::priority:low";
        assert_eq!(t.simple_tags(text), vec!["urgent"]);
        assert_eq!(
            t.key_value_tags(text),
            vec![("priority", "high"), ("owner", "ana"), ("priority", "low")]
        );
    }
}
