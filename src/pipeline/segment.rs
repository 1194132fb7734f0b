//! Segmentation: split normalized text into synthesis-sized sub-units.
//!
//! Paragraphs are separated by blank lines; sentences end at terminal
//! punctuation (optionally followed by closing quotes or brackets). Whole
//! sentences are packed into a sub-unit up to `max_chars`. A sentence longer
//! than `max_chars` is split at whitespace, and only its final piece counts as
//! a sentence end.
//!
//! Boundary flags drive pause insertion in the assembly step:
//!
//! | flag               | set when                                        |
//! |--------------------|-------------------------------------------------|
//! | `is_sentence_end`  | the sub-unit ends on a complete sentence        |
//! | `is_paragraph_end` | the sub-unit is the last one of its paragraph   |
//! | `is_unit_end`      | the sub-unit is the last one of the unit        |

use crate::unit::SubUnit;
use once_cell::sync::Lazy;
use regex::Regex;

/// Sentence = run of non-terminal chars + terminal punctuation + closers,
/// or a trailing run without terminal punctuation.
static RE_SENTENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[^.!?]*[.!?]+["'\x{201D}\x{2019})\]]*|[^.!?]+$"#).unwrap()
});

/// The segmentation collaborator.
pub trait Segmenter: Send + Sync {
    fn name(&self) -> &str;

    /// Split `text` of unit `unit_index` into ordered sub-units.
    fn segment(&self, unit_index: usize, text: &str) -> Result<Vec<SubUnit>, String>;
}

/// Rule-based sentence packer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceSegmenter {
    max_chars: usize,
}

impl SentenceSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Sentences of one paragraph, already hard-split to `max_chars`.
    /// Each piece carries whether it ends a sentence.
    fn pieces(&self, paragraph: &str) -> Vec<(String, bool)> {
        let mut pieces = Vec::new();
        for m in RE_SENTENCE.find_iter(paragraph) {
            let sentence = m.as_str().trim();
            if sentence.is_empty() {
                continue;
            }
            if char_len(sentence) <= self.max_chars {
                pieces.push((sentence.to_string(), true));
                continue;
            }
            let parts = split_at_whitespace(sentence, self.max_chars);
            let last = parts.len().saturating_sub(1);
            for (i, part) in parts.into_iter().enumerate() {
                pieces.push((part, i == last));
            }
        }
        pieces
    }
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_CHARS)
    }
}

impl Segmenter for SentenceSegmenter {
    fn name(&self) -> &str {
        "sentences"
    }

    fn segment(&self, unit_index: usize, text: &str) -> Result<Vec<SubUnit>, String> {
        let text = text.replace("\r\n", "\n");
        let paragraphs: Vec<String> = text
            .split("\n\n")
            .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|p| !p.is_empty())
            .collect();

        let mut out: Vec<SubUnit> = Vec::new();
        let mut push = |text: String, paragraph_index: usize, sentence_end: bool, para_end: bool| {
            let index = out.len();
            out.push(SubUnit {
                unit_index,
                index,
                text,
                paragraph_index,
                is_sentence_end: sentence_end,
                is_paragraph_end: para_end,
                is_unit_end: false,
            });
        };

        for (p, paragraph) in paragraphs.iter().enumerate() {
            let mut current = String::new();
            let mut current_ends_sentence = true;

            for (piece, ends_sentence) in self.pieces(paragraph) {
                if !current.is_empty()
                    && char_len(&current) + 1 + char_len(&piece) > self.max_chars
                {
                    push(std::mem::take(&mut current), p, current_ends_sentence, false);
                }
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(&piece);
                current_ends_sentence = ends_sentence;
            }

            if !current.is_empty() {
                push(current, p, current_ends_sentence, true);
            }
        }

        if let Some(last) = out.last_mut() {
            last.is_unit_end = true;
        }
        Ok(out)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Pack whitespace-separated words into pieces of at most `max_chars`.
/// A single word longer than `max_chars` becomes its own piece.
fn split_at_whitespace(sentence: &str, max_chars: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if !current.is_empty() && char_len(&current) + 1 + char_len(word) > max_chars {
            parts.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
