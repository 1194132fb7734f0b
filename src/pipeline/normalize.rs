//! Normalization: turn a unit's Markdown into narration-ready text.
//!
//! The stage runs an explicit [`FallbackChain`]: the primary normalizer
//! (an LLM by default) and, if it fails, a deterministic fallback (regex
//! rules). The chain returns a tagged [`NormalizeOutcome`] so the caller
//! sees which path produced the text, instead of a fallback hidden behind
//! error interception.
//!
//! ## Retry Strategy
//!
//! The LLM call retries with exponential backoff
//! (`retry_backoff_ms * 2^attempt`) before the chain gives up on it.

use crate::config::NormalizeConfig;
use crate::error::AudiobookError;
use crate::prompts::NORMALIZE_SYSTEM_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Default model when a provider is named without one.
const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Text produced by a normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    /// LLM calls made (0 for rule-based normalizers).
    pub llm_calls: u32,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl Normalized {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            llm_calls: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// A normalizer failure; isolated to the unit being normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{normalizer}: {detail}")]
pub struct NormalizeError {
    pub normalizer: String,
    pub detail: String,
}

/// The normalization collaborator.
#[async_trait]
pub trait Normalizer: Send + Sync {
    fn name(&self) -> &str;

    async fn normalize(&self, text: &str) -> Result<Normalized, NormalizeError>;
}

/// Tagged result of a [`FallbackChain`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// The primary normalizer succeeded.
    Primary(Normalized),
    /// The primary failed; the fallback produced the text.
    Fallback {
        normalized: Normalized,
        primary_error: NormalizeError,
    },
    /// Both failed (or the primary failed with no fallback configured).
    Failed {
        primary_error: NormalizeError,
        fallback_error: Option<NormalizeError>,
    },
}

/// Ordered primary → fallback normalization.
#[derive(Clone)]
pub struct FallbackChain {
    primary: Arc<dyn Normalizer>,
    fallback: Option<Arc<dyn Normalizer>>,
}

impl FallbackChain {
    pub fn new(primary: Arc<dyn Normalizer>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Normalizer>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Chain of the regex rules alone.
    pub fn rules_only() -> Self {
        Self::new(Arc::new(RegexNormalizer))
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub async fn run(&self, text: &str) -> NormalizeOutcome {
        let primary_error = match self.primary.normalize(text).await {
            Ok(normalized) => return NormalizeOutcome::Primary(normalized),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return NormalizeOutcome::Failed {
                primary_error,
                fallback_error: None,
            };
        };

        warn!("{}; falling back to {}", primary_error, fallback.name());
        match fallback.normalize(text).await {
            Ok(normalized) => NormalizeOutcome::Fallback {
                normalized,
                primary_error,
            },
            Err(fallback_error) => NormalizeOutcome::Failed {
                primary_error,
                fallback_error: Some(fallback_error),
            },
        }
    }
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|n| n.name().to_string()))
            .finish()
    }
}

/// Build the configured chain: LLM with regex fallback, or regex only.
///
/// When the LLM is enabled but no provider can be resolved, the chain
/// degrades to regex only and logs why.
pub fn build_chain(config: &NormalizeConfig) -> FallbackChain {
    if !config.use_llm {
        return FallbackChain::rules_only();
    }
    match resolve_provider(config) {
        Ok(provider) => FallbackChain::new(Arc::new(LlmNormalizer::new(provider, config)))
            .with_fallback(Arc::new(RegexNormalizer)),
        Err(e) => {
            warn!("LLM normalization unavailable, using rules only: {}", e);
            FallbackChain::rules_only()
        }
    }
}

// ── LLM normalizer ───────────────────────────────────────────────────────

/// Normalizes text with one chat completion per unit.
pub struct LlmNormalizer {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl LlmNormalizer {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &NormalizeConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }
}

#[async_trait]
impl Normalizer for LlmNormalizer {
    fn name(&self) -> &str {
        "llm"
    }

    async fn normalize(&self, text: &str) -> Result<Normalized, NormalizeError> {
        let messages = vec![
            ChatMessage::system(NORMALIZE_SYSTEM_PROMPT),
            ChatMessage::user(text),
        ];
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let mut last_err: Option<String> = None;
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        let mut calls = 0;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "LLM normalization: retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            calls += 1;
            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    input_tokens += response.prompt_tokens;
                    output_tokens += response.completion_tokens;
                    debug!(
                        "LLM normalization: {} input tokens, {} output tokens",
                        response.prompt_tokens, response.completion_tokens
                    );
                    // An empty completion keeps the input rather than erasing the unit.
                    let cleaned = if response.content.trim().is_empty() {
                        text.to_string()
                    } else {
                        response.content
                    };
                    return Ok(Normalized {
                        text: cleaned,
                        llm_calls: calls,
                        input_tokens,
                        output_tokens,
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    warn!("LLM normalization attempt {} failed — {}", attempt + 1, msg);
                    last_err = Some(msg);
                }
            }
        }

        Err(NormalizeError {
            normalizer: self.name().to_string(),
            detail: format!(
                "failed after {} retries: {}",
                self.max_retries,
                last_err.unwrap_or_else(|| "unknown error".to_string())
            ),
        })
    }
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. pre-built `config.provider`
/// 2. `config.provider_name` (+ `config.model`)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. [`ProviderFactory::from_env`] auto-detection
pub fn resolve_provider(config: &NormalizeConfig) -> Result<Arc<dyn LLMProvider>, AudiobookError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| AudiobookError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or disable LLM normalization.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, AudiobookError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        AudiobookError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

// ── Regex normalizer ─────────────────────────────────────────────────────

/// Deterministic rules used when no LLM is available or the LLM failed.
///
/// Applied in order: citations, page numbers, hyphenation, figure and table
/// markers, heading markers, abbreviations, footnote markers, URLs, then
/// blank-line collapse.
static FALLBACK_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\([\w\s]+et\s+al\.,?\s*\d{4}\w?(?:;\s*[\w\s]+et\s+al\.,?\s*\d{4}\w?)*\)",
            "",
        ),
        (r"\[[\d,;\s\-]+\]", ""),
        (r"\[\w+(?:\s+et\s+al\.?)?,?\s*\d{4}\w?\]", ""),
        (r"(?m)^[ \t]*-?[ \t]*\d+[ \t]*-?[ \t]*$", ""),
        (r"(\w+)-[ \t]*\n\s*(\w+)", "${1}${2}"),
        (r"(?i)\*?\[figure\][^\n]*", ""),
        (r"(?s)<!--\s*table\s*-->.*?<!--\s*/table\s*-->", ""),
        (r"(?m)^#{1,6}\s+", ""),
        (r"\bFig\.\s*", "Figure "),
        (r"\bEq\.\s*", "Equation "),
        (r"\bvs\.\s", "versus "),
        (r"\be\.g\.\s", "for example "),
        (r"\bi\.e\.\s", "that is "),
        (r"\bet\s+al\.\s", "and colleagues "),
        (r"\betc\.\s", "et cetera "),
        (r"\bapprox\.\s", "approximately "),
        (r"(?m)^>\s*\[footnote\]\s*", ""),
        (r"https?://\S+", ""),
        (r"\n{3,}", "\n\n"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
    .collect()
});

/// Rule-based normalizer; never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexNormalizer;

impl RegexNormalizer {
    pub fn clean(text: &str) -> String {
        let mut s = text.replace("\r\n", "\n");
        for (re, replacement) in FALLBACK_RULES.iter() {
            s = re.replace_all(&s, *replacement).into_owned();
        }
        s.trim().to_string()
    }
}

#[async_trait]
impl Normalizer for RegexNormalizer {
    fn name(&self) -> &str {
        "rules"
    }

    async fn normalize(&self, text: &str) -> Result<Normalized, NormalizeError> {
        Ok(Normalized::plain(Self::clean(text)))
    }
}
