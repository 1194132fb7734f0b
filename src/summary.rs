//! Executive summary placed in front of the first unit.
//!
//! The summary is generated from the structured units (LLM first, extractive
//! fallback) and then handed to [`crate::reindex::Reindexer`] as an
//! [`InsertedUnit`] carrying [`SUMMARY_SENTINEL`], so later runs recognise it
//! and do not insert it again.

use crate::output::UsageTotals;
use crate::prompts::SUMMARY_SYSTEM_PROMPT;
use crate::reindex::InsertedUnit;
use crate::unit::{Section, Unit};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SUMMARY_TITLE: &str = "Executive Summary";
pub const SUMMARY_SENTINEL: &str = "executive-summary";

/// Document text sent to the LLM is cut at this many characters.
const MAX_DOCUMENT_CHARS: usize = 100_000;
const TRUNCATION_NOTE: &str = "\n\n[Remaining text omitted for length...]";

/// Extractive fallback: paragraphs must be longer than this to count.
const MIN_PARAGRAPH_CHARS: usize = 30;
const MAX_EXTRACTED_PARAGRAPHS: usize = 5;

/// How the summary text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    Llm,
    Extractive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    pub source: SummarySource,
    pub usage: UsageTotals,
}

impl InsertedUnit {
    /// The executive summary unit. Its text is already narration-ready.
    pub fn summary(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            title: SUMMARY_TITLE.to_string(),
            sections: vec![Section::body(text.clone())],
            sentinel: SUMMARY_SENTINEL.to_string(),
            normalized_text: Some(text),
        }
    }
}

/// Summarise `units` with `provider`, or extractively when there is none or
/// the call fails. The text may be empty when nothing could be extracted.
pub async fn generate_summary(units: &[Unit], provider: Option<&Arc<dyn LLMProvider>>) -> Summary {
    let mut usage = UsageTotals::default();

    if let Some(provider) = provider {
        let messages = vec![
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(document_text(units)),
        ];
        let options = CompletionOptions {
            temperature: Some(0.3),
            ..Default::default()
        };

        match provider.chat(&messages, Some(&options)).await {
            Ok(response) => {
                usage.record_call(response.prompt_tokens, response.completion_tokens);
                let text = response.content.trim().to_string();
                if !text.is_empty() {
                    info!("Executive summary generated ({} chars)", text.len());
                    return Summary {
                        text,
                        source: SummarySource::Llm,
                        usage,
                    };
                }
                warn!("Summary model returned no text; using extractive summary");
            }
            Err(e) => warn!("Summary generation failed — {}; using extractive summary", e),
        }
        usage.fallbacks += 1;
    } else {
        debug!("No LLM provider; using extractive summary");
    }

    Summary {
        text: extractive_summary(units),
        source: SummarySource::Extractive,
        usage,
    }
}

/// All units as one Markdown document, truncated for the model's context.
pub fn document_text(units: &[Unit]) -> String {
    let full = units
        .iter()
        .map(|u| format!("## {}\n\n{}", u.title, u.to_markdown()))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    match full.char_indices().nth(MAX_DOCUMENT_CHARS) {
        Some((cut, _)) => format!("{}{}", &full[..cut], TRUNCATION_NOTE),
        None => full,
    }
}

/// First substantial paragraph of up to five units.
pub fn extractive_summary(units: &[Unit]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for unit in units {
        let md = unit.to_markdown();
        let Some(first) = md.trim().split("\n\n").next().map(str::trim) else {
            continue;
        };
        if first.chars().count() > MIN_PARAGRAPH_CHARS {
            parts.push(first.to_string());
        }
        if parts.len() >= MAX_EXTRACTED_PARAGRAPHS {
            break;
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(i: usize, body: &str) -> Unit {
        Unit::new(i, format!("Part {i}"), vec![Section::body(body), Section::body("Second paragraph.")])
    }

    #[test]
    fn summary_unit_is_marked_and_pre_normalized() {
        let s = InsertedUnit::summary("This document studies things.");
        assert_eq!(s.title, SUMMARY_TITLE);
        assert_eq!(s.sentinel, SUMMARY_SENTINEL);
        assert_eq!(s.normalized_text.as_deref(), Some("This document studies things."));
        assert_eq!(s.sections.len(), 1);
    }

    #[test]
    fn extractive_takes_first_long_paragraph_per_unit() {
        let units = vec![
            unit(0, "Short."),
            unit(1, "This opening paragraph is comfortably over thirty characters."),
        ];
        assert_eq!(
            extractive_summary(&units),
            "This opening paragraph is comfortably over thirty characters."
        );
    }

    #[test]
    fn extractive_stops_at_five() {
        let units: Vec<Unit> = (0..8)
            .map(|i| unit(i, &format!("Paragraph number {i} has enough characters to count.")))
            .collect();
        assert_eq!(extractive_summary(&units).split("\n\n").count(), 5);
    }

    #[test]
    fn extractive_can_be_empty() {
        assert_eq!(extractive_summary(&[unit(0, "Tiny.")]), "");
    }

    #[test]
    fn document_text_is_truncated() {
        let long = "x".repeat(MAX_DOCUMENT_CHARS + 500);
        let text = document_text(&[unit(0, &long)]);
        assert!(text.ends_with(TRUNCATION_NOTE));
        assert_eq!(
            text.chars().count(),
            MAX_DOCUMENT_CHARS + TRUNCATION_NOTE.chars().count()
        );
    }

    #[tokio::test]
    async fn no_provider_falls_back_to_extract() {
        let units = vec![unit(0, "An introduction that is long enough to be extracted.")];
        let summary = generate_summary(&units, None).await;
        assert_eq!(summary.source, SummarySource::Extractive);
        assert!(summary.text.starts_with("An introduction"));
        assert_eq!(summary.usage, UsageTotals::default());
    }
}
