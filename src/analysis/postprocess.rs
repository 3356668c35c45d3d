//! Text correction and normalization
//!
//! Finds words that are probably misread (low recognizer confidence, not in
//! the dictionary, and one confusable glyph away from a dictionary word),
//! asks the language model to resolve them in context, then normalizes and
//! formats the text. Normalization always runs, even when correction fails.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::patterns::{LineKind, PatternTables};
use crate::config::PostProcessConfig;
use crate::error::{PipelineError, Result};
use crate::shared::{call_with_policy, CallPolicy};
use crate::vision::extraction::WordConfidences;
use crate::vision::vision_model::extract_json_array;
use crate::vision::VisionModel;

/// Built-in dictionary: frequent English words plus everyday note vocabulary
const COMMON_WORDS: &str = "\
the be to of and a in that have i it for not on with he as you do at this but his by from they we \
say her she or an will my one all would there their what so up out if about who get which go me \
when make can like time no just him know take people into year your good some could them see other \
than then now look only come its over think also back after use two how our work first well way \
even new want because any these give day most us is was are been has had were said each many more \
call find long down did made may part am off before next last week today tomorrow tonight morning \
afternoon evening monday tuesday wednesday thursday friday saturday sunday january february march \
april june july august september october november december buy milk eggs bread butter cheese coffee \
tea water fruit apples bananas rice pasta meat chicken fish soup sugar salt flour oil vegetables \
groceries shopping list store pick drop send email mail reply meeting meet team project plan review \
notes note idea ideas todo task tasks done finish start check update fix test ship deploy release \
report draft write read book order pay bill bills rent bank doctor dentist appointment kids school \
home office car gas clean laundry dishes cook dinner lunch breakfast gym run walk phone number \
address birthday gift party trip flight hotel ticket pack bring remember remind ask tell talk \
follow important urgent priority high low medium later soon asap deadline due client customer \
budget invoice sales marketing design code bug feature issue ticket sprint goal goals agenda \
minutes summary question questions answer answers help need needs must should would could might \
thing things stuff more less much very really all every none both few several also still again \
here where why what who whom whose which while until since about above below between through \
during without within along across behind beyond around against among upon into onto";

/// A word that may have been misread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionCandidate {
    pub word: String,
    /// Word index in the text
    pub position: usize,
    pub confidence: f32,
    pub alternatives: Vec<String>,
}

/// A correction proposed by the language model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub original: String,
    pub corrected: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub applied: bool,
}

/// Output of post-processing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessResult {
    /// Corrected and normalized text
    pub text: String,
    /// Display rendition of `text`
    pub formatted: String,
    pub candidates: Vec<CorrectionCandidate>,
    pub corrections: Vec<Correction>,
    pub warnings: Vec<String>,
    /// Set when the correction pass failed and `text` is uncorrected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_error: Option<String>,
}

impl PostProcessResult {
    pub fn applied_count(&self) -> usize {
        self.corrections.iter().filter(|c| c.applied).count()
    }
}

/// Word list used for the membership check
#[derive(Debug, Clone)]
pub struct Dictionary {
    words: HashSet<String>,
}

impl Dictionary {
    pub fn new(extra_words: &[String]) -> Self {
        let mut words: HashSet<String> = COMMON_WORDS.split_whitespace().map(str::to_string).collect();
        words.extend(extra_words.iter().map(|w| w.to_lowercase()));
        Self { words }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(&word.to_lowercase())
    }
}

/// Deterministic whitespace, punctuation and quote cleanup
pub struct TextNormalizer {
    dehyphenate: Regex,
    spaces: Regex,
    space_before_punct: Regex,
    missing_space_after_punct: Regex,
    blank_lines: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PipelineError::Config(format!("bad pattern {pattern:?}: {e}")))
}

impl TextNormalizer {
    pub fn compile() -> Result<Self> {
        Ok(Self {
            dehyphenate: compile(r"(\w)-[ \t]*\r?\n[ \t]*(\w)")?,
            spaces: compile(r"[ \t]+")?,
            // Colons are left alone so `::key:value` tags survive
            space_before_punct: compile(r"[ \t]+([.,!?;])")?,
            missing_space_after_punct: compile(r"([,;!?])(\p{L})")?,
            blank_lines: compile(r"\n{3,}")?,
        })
    }

    pub fn normalize(&self, text: &str) -> String {
        let text = text
            .replace(['\u{201C}', '\u{201D}', '\u{201E}'], "\"")
            .replace(['\u{2018}', '\u{2019}'], "'")
            .replace("\r\n", "\n");
        let text = self.dehyphenate.replace_all(&text, "${1}${2}");
        let text = self.spaces.replace_all(&text, " ");
        let text = self.space_before_punct.replace_all(&text, "${1}");
        let text = self.missing_space_after_punct.replace_all(&text, "${1} ${2}");
        let text: String = text.lines().map(str::trim).collect::<Vec<_>>().join("\n");
        let text = self.blank_lines.replace_all(&text, "\n\n");
        text.trim().to_string()
    }
}

/// Display rendition: bullets become `•`, checkboxes become `☐`/`☑`
pub fn format_markdown(text: &str, patterns: &PatternTables) -> String {
    text.lines()
        .map(|line| match patterns.classify(line) {
            LineKind::Todo { text, completed } => {
                format!("{} {}", if completed { '☑' } else { '☐' }, text)
            }
            LineKind::Bullet { text } => format!("• {text}"),
            _ => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Deserialize)]
struct CorrectionReply {
    #[serde(default)]
    original: String,
    #[serde(default)]
    corrected: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reason: String,
}

/// Post-processing stage
pub struct PostProcessor<'a> {
    config: &'a PostProcessConfig,
    patterns: &'a PatternTables,
    normalizer: &'a TextNormalizer,
    dictionary: Dictionary,
}

impl<'a> PostProcessor<'a> {
    pub fn new(config: &'a PostProcessConfig, patterns: &'a PatternTables, normalizer: &'a TextNormalizer) -> Self {
        Self {
            config,
            patterns,
            normalizer,
            dictionary: Dictionary::new(&config.extra_words),
        }
    }

    /// Words below the confidence threshold, outside the dictionary, with at
    /// least one dictionary word among their confusable spellings
    pub fn find_candidates(&self, text: &str, confidences: Option<&WordConfidences>) -> Vec<CorrectionCandidate> {
        text.split_whitespace()
            .enumerate()
            .filter_map(|(position, raw)| {
                if raw.starts_with('@') || raw.starts_with("::") {
                    return None;
                }
                let clean: String = raw
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase();
                if clean.chars().count() < self.config.min_word_length
                    || clean.chars().all(|c| c.is_ascii_digit())
                    || self.dictionary.contains(&clean)
                {
                    return None;
                }
                let confidence = confidences.map_or(self.config.default_word_confidence, |c| c.get(raw));
                if confidence >= self.config.candidate_threshold {
                    return None;
                }
                let alternatives = self.alternatives(&clean);
                (!alternatives.is_empty()).then(|| CorrectionCandidate {
                    word: raw
                        .trim_matches(|c: char| !c.is_alphanumeric())
                        .to_string(),
                    position,
                    confidence,
                    alternatives,
                })
            })
            .collect()
    }

    /// Dictionary words reachable by one glyph or bigram substitution,
    /// closest spelling first
    pub fn alternatives(&self, word: &str) -> Vec<String> {
        let mut found = BTreeSet::new();
        for entry in &self.config.confusions {
            let from = entry.from.as_str();
            if from.is_empty() {
                continue;
            }
            for (idx, _) in word.match_indices(from) {
                for to in &entry.to {
                    let candidate = format!("{}{}{}", &word[..idx], to, &word[idx + from.len()..]);
                    if candidate != word && self.dictionary.contains(&candidate) {
                        found.insert(candidate);
                    }
                }
            }
        }

        let mut ranked: Vec<String> = found.into_iter().collect();
        ranked.sort_by(|a, b| {
            strsim::normalized_levenshtein(word, b)
                .partial_cmp(&strsim::normalized_levenshtein(word, a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(self.config.max_alternatives);
        ranked
    }

    /// Correct and normalize `text`
    ///
    /// The model is only consulted when candidates exist. A failed
    /// correction pass is reported in `correction_error` and the
    /// uncorrected text is normalized instead.
    pub async fn process(
        &self,
        text: &str,
        confidences: Option<&WordConfidences>,
        model: Option<&dyn VisionModel>,
        policy: &CallPolicy,
        cancel: &CancellationToken,
    ) -> PostProcessResult {
        let candidates = self.find_candidates(text, confidences);
        let mut warnings = Vec::new();
        let mut correction_error = None;
        let mut corrections = Vec::new();
        let mut corrected = text.to_string();

        if !candidates.is_empty() {
            debug!("{} correction candidate(s)", candidates.len());
            match model {
                Some(model) => match self.request_corrections(model, text, &candidates, policy, cancel).await {
                    Ok(proposed) => {
                        corrections = proposed;
                        corrected = apply_corrections(text, &mut corrections, self.config.apply_threshold);
                    }
                    Err(err) => {
                        warn!("Correction pass failed: {}", err);
                        correction_error = Some(match err {
                            PipelineError::Correction(message) => message,
                            other => other.to_string(),
                        });
                    }
                },
                None => warnings.push(format!(
                    "{} correction candidate(s) left unresolved: no language model configured",
                    candidates.len()
                )),
            }
        }

        let normalized = self.normalizer.normalize(&corrected);
        let formatted = format_markdown(&normalized, self.patterns);
        let result = PostProcessResult {
            text: normalized,
            formatted,
            candidates,
            corrections,
            warnings,
            correction_error,
        };
        if result.applied_count() > 0 {
            info!("Applied {} correction(s)", result.applied_count());
        }
        result
    }

    async fn request_corrections(
        &self,
        model: &dyn VisionModel,
        text: &str,
        candidates: &[CorrectionCandidate],
        policy: &CallPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Correction>> {
        let prompt = correction_prompt(text, candidates);
        let reply = call_with_policy(policy, cancel, || model.complete(&prompt)).await?;
        parse_corrections(&reply)
    }
}

fn correction_prompt(text: &str, candidates: &[CorrectionCandidate]) -> String {
    let listed: Vec<String> = candidates
        .iter()
        .map(|c| {
            format!(
                "- \"{}\" (confidence {:.2}, possible readings: {})",
                c.word,
                c.confidence,
                c.alternatives.join(", ")
            )
        })
        .collect();
    format!(
        "You are correcting recognition errors in text transcribed from a handwritten note.\n\n\
         Text:\n{text}\n\n\
         Possibly misread words:\n{}\n\n\
         For every listed word decide whether it is an error and what the intended word is, \
         using the surrounding text. Only correct when you are confident.\n\
         Reply with a JSON array only:\n\
         [{{\"original\": \"word\", \"corrected\": \"word\", \"confidence\": 0.95, \"reason\": \"short justification\"}}]",
        listed.join("\n")
    )
}

/// Parse the model's JSON array of corrections
pub fn parse_corrections(reply: &str) -> Result<Vec<Correction>> {
    let payload = extract_json_array(reply)
        .ok_or_else(|| PipelineError::Correction("reply did not contain a JSON array".to_string()))?;
    let parsed: Vec<CorrectionReply> = serde_json::from_str(payload)?;
    Ok(parsed
        .into_iter()
        .filter(|r| !r.original.trim().is_empty())
        .map(|r| Correction {
            original: r.original.trim().to_string(),
            corrected: r.corrected.trim().to_string(),
            confidence: r.confidence.clamp(0.0, 1.0),
            reason: r.reason,
            applied: false,
        })
        .collect())
}

/// Replace the first whole-word occurrence of each confident correction
pub fn apply_corrections(text: &str, corrections: &mut [Correction], threshold: f32) -> String {
    let mut out = text.to_string();
    for correction in corrections.iter_mut() {
        if correction.confidence <= threshold || correction.original == correction.corrected {
            continue;
        }
        if let Some(idx) = find_word(&out, &correction.original) {
            out.replace_range(idx..idx + correction.original.len(), &correction.corrected);
            correction.applied = true;
        }
    }
    out
}

fn find_word(haystack: &str, word: &str) -> Option<usize> {
    haystack.match_indices(word).map(|(i, _)| i).find(|&i| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + word.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::vision_model::VisionTranscription;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::time::Duration;

    struct ScriptedModel {
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn transcribe(&self, _image: &RgbImage) -> Result<VisionTranscription> {
            Err(PipelineError::Config("not used".into()))
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.reply
                .map(str::to_string)
                .ok_or_else(|| PipelineError::Config("model offline".into()))
        }
    }

    fn policy() -> CallPolicy {
        CallPolicy {
            service: "test",
            timeout: Duration::from_secs(1),
            max_retries: 0,
            backoff: Duration::from_millis(1),
        }
    }

    struct Fixture {
        config: PostProcessConfig,
        patterns: PatternTables,
        normalizer: TextNormalizer,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: PostProcessConfig::default(),
                patterns: PatternTables::compile().unwrap(),
                normalizer: TextNormalizer::compile().unwrap(),
            }
        }

        fn processor(&self) -> PostProcessor<'_> {
            PostProcessor::new(&self.config, &self.patterns, &self.normalizer)
        }
    }

    fn low_confidence(words: &[(&str, f32)]) -> WordConfidences {
        let mut c = WordConfidences::new(0.95);
        for (w, conf) in words {
            c.insert(w, *conf);
        }
        c
    }

    #[test]
    fn test_candidates_need_low_confidence_and_alternatives() {
        let f = Fixture::new();
        let p = f.processor();
        let conf = low_confidence(&[("rnilk", 0.4), ("zebra", 0.3)]);
        let candidates = p.find_candidates("Buy rnilk, zebra and eggs", Some(&conf));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].word, "rnilk");
        assert_eq!(candidates[0].position, 1);
        assert_eq!(candidates[0].alternatives, vec!["milk"]);

        // Confident words are left alone
        let sure = low_confidence(&[("rnilk", 0.95)]);
        assert!(p.find_candidates("Buy rnilk", Some(&sure)).is_empty());
    }

    #[test]
    fn test_bigram_and_glyph_alternatives() {
        let f = Fixture::new();
        let p = f.processor();
        assert_eq!(p.alternatives("c0ffee"), vec!["coffee"]);
        assert_eq!(p.alternatives("clone"), vec!["done"]);
        assert!(p.alternatives("xyzzy").is_empty());
    }

    #[test]
    fn test_apply_first_occurrence_above_threshold() {
        let mut corrections = vec![
            Correction {
                original: "rnilk".into(),
                corrected: "milk".into(),
                confidence: 0.95,
                reason: "context".into(),
                applied: false,
            },
            Correction {
                original: "tea".into(),
                corrected: "ten".into(),
                confidence: 0.8,
                reason: "unsure".into(),
                applied: false,
            },
        ];
        let out = apply_corrections("rnilk tea rnilk steam", &mut corrections, 0.8);
        assert_eq!(out, "milk tea rnilk steam");
        assert!(corrections[0].applied);
        assert!(!corrections[1].applied);
    }

    #[test]
    fn test_normalization() {
        let n = TextNormalizer::compile().unwrap();
        assert_eq!(n.normalize("  Buy   milk ,eggs\tand bread .  "), "Buy milk, eggs and bread.");
        assert_eq!(n.normalize("impor-\ntant meeting"), "important meeting");
        assert_eq!(n.normalize("\u{201C}quoted\u{201D} \u{2018}x\u{2019}"), "\"quoted\" 'x'");
        assert_eq!(n.normalize("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(n.normalize("@urgent ::priority:high"), "@urgent ::priority:high");
        assert_eq!(n.normalize("- milk\n- eggs"), "- milk\n- eggs");
    }

    #[test]
    fn test_format_markdown() {
        let patterns = PatternTables::compile().unwrap();
        let text = "## Plan ##\n- milk\n* eggs\n[ ] call Bob\n[x] pay rent\n1. first";
        assert_eq!(
            format_markdown(text, &patterns),
            "## Plan ##\n• milk\n• eggs\n☐ call Bob\n☑ pay rent\n1. first"
        );
    }

    #[test]
    fn test_parse_corrections() {
        let reply = "Sure:\n[{\"original\": \"rnilk\", \"corrected\": \"milk\", \"confidence\": 0.97, \"reason\": \"shopping list\"}, {\"original\": \"\"}]";
        let parsed = parse_corrections(reply).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].corrected, "milk");
        assert!(parse_corrections("no json here").is_err());
    }

    #[tokio::test]
    async fn test_process_applies_model_corrections() {
        let f = Fixture::new();
        let p = f.processor();
        let model = ScriptedModel {
            reply: Some(r#"[{"original":"rnilk","corrected":"milk","confidence":0.95,"reason":"list of groceries"}]"#),
        };
        let conf = low_confidence(&[("rnilk", 0.4)]);
        let result = p
            .process("- rnilk\n- eggs", Some(&conf), Some(&model), &policy(), &CancellationToken::new())
            .await;
        assert_eq!(result.text, "- milk\n- eggs");
        assert_eq!(result.formatted, "• milk\n• eggs");
        assert_eq!(result.applied_count(), 1);
        assert!(result.warnings.is_empty());
        assert_eq!(result.correction_error, None);
    }

    #[tokio::test]
    async fn test_correction_failure_still_normalizes() {
        let f = Fixture::new();
        let p = f.processor();
        let model = ScriptedModel { reply: None };
        let conf = low_confidence(&[("rnilk", 0.4)]);
        let result = p
            .process("buy   rnilk", Some(&conf), Some(&model), &policy(), &CancellationToken::new())
            .await;
        assert_eq!(result.text, "buy rnilk");
        assert!(result.correction_error.is_some());
        assert!(result.warnings.is_empty());
        assert!(result.corrections.is_empty());
    }

    #[tokio::test]
    async fn test_no_candidates_skips_model() {
        let f = Fixture::new();
        let p = f.processor();
        let model = ScriptedModel { reply: None };
        let result = p
            .process("call the dentist", None, Some(&model), &policy(), &CancellationToken::new())
            .await;
        assert!(result.warnings.is_empty());
        assert_eq!(result.text, "call the dentist");
    }
}
