//! Configuration types for a pipeline run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Collaborator settings live in two nested
//! structs: [`NormalizeConfig`] for the LLM text normalizer and
//! [`SynthesisConfig`] for the speech backend.

use crate::checkpoint::DEFAULT_FINGERPRINT_PREFIX;
use crate::error::AudiobookError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default characters per sub-unit for local synthesis backends.
pub const DEFAULT_MAX_CHARS: usize = 400;

/// Default sub-unit synthesis calls in flight per unit.
pub const DEFAULT_SYNTHESIS_WORKERS: usize = 4;

/// Configuration for a pipeline run.
///
/// # Example
/// ```rust
/// use edgequake_audiobook::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .output_dir("out/my-book")
///     .unit_concurrency(3)
///     .synthesis_workers(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.unit_concurrency, 3);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of every persisted artifact and the checkpoint. Default: `output`.
    pub output_dir: PathBuf,

    /// Units processed at the same time. Default: 2.
    ///
    /// Two is enough to overlap one unit's normalization (network-bound)
    /// with another unit's synthesis (resource-bound). Synthesis itself is
    /// always single-flight regardless of this value.
    pub unit_concurrency: usize,

    /// Sub-unit synthesis calls dispatched at once within a unit. Default: 4.
    ///
    /// `0` or `1` processes sub-units strictly in order on the calling task.
    /// Parallel dispatch only overlaps backend calls when the backend is
    /// itself reentrant (e.g. a remote HTTP service). Left at the default,
    /// it follows the backend's hint (see
    /// [`crate::engine::SpeechEngine::preferred_workers`]), or the CPU count
    /// capped at the default for backends without one.
    pub synthesis_workers: usize,

    /// Bytes of the source hashed into the run fingerprint. Default: 1 MiB.
    pub fingerprint_prefix_bytes: usize,

    /// Maximum characters per sub-unit. Default: 400.
    ///
    /// Left at the default, it is raised to the backend's own limit when the
    /// backend reports one (see [`crate::engine::SpeechEngine::max_input_chars`]).
    pub max_chars: usize,

    /// Produce empty narration for references/bibliography units. Default: true.
    pub skip_references: bool,

    /// Text normalization collaborator settings.
    pub normalize: NormalizeConfig,

    /// Speech backend settings.
    pub synthesis: SynthesisConfig,

    /// Optional per-unit progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            unit_concurrency: 2,
            synthesis_workers: DEFAULT_SYNTHESIS_WORKERS,
            fingerprint_prefix_bytes: DEFAULT_FINGERPRINT_PREFIX,
            max_chars: DEFAULT_MAX_CHARS,
            skip_references: true,
            normalize: NormalizeConfig::default(),
            synthesis: SynthesisConfig::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("output_dir", &self.output_dir)
            .field("unit_concurrency", &self.unit_concurrency)
            .field("synthesis_workers", &self.synthesis_workers)
            .field("fingerprint_prefix_bytes", &self.fingerprint_prefix_bytes)
            .field("max_chars", &self.max_chars)
            .field("skip_references", &self.skip_references)
            .field("normalize", &self.normalize)
            .field("synthesis", &self.synthesis)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Sub-unit size for a backend with the given preferred limit.
    pub fn effective_max_chars(&self, backend_limit: Option<usize>) -> usize {
        match backend_limit {
            Some(limit) if self.max_chars == DEFAULT_MAX_CHARS => limit,
            _ => self.max_chars,
        }
    }

    /// Sub-unit fan-out for a backend with the given worker hint.
    pub fn effective_synthesis_workers(&self, backend_hint: Option<usize>) -> usize {
        if self.synthesis_workers != DEFAULT_SYNTHESIS_WORKERS {
            return self.synthesis_workers;
        }
        match backend_hint {
            Some(hint) => hint.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(DEFAULT_SYNTHESIS_WORKERS),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn unit_concurrency(mut self, n: usize) -> Self {
        self.config.unit_concurrency = n.max(1);
        self
    }

    pub fn synthesis_workers(mut self, n: usize) -> Self {
        self.config.synthesis_workers = n;
        self
    }

    pub fn fingerprint_prefix_bytes(mut self, n: usize) -> Self {
        self.config.fingerprint_prefix_bytes = n;
        self
    }

    pub fn max_chars(mut self, n: usize) -> Self {
        self.config.max_chars = n;
        self
    }

    pub fn skip_references(mut self, v: bool) -> Self {
        self.config.skip_references = v;
        self
    }

    pub fn normalize(mut self, normalize: NormalizeConfig) -> Self {
        self.config.normalize = normalize;
        self
    }

    pub fn synthesis(mut self, synthesis: SynthesisConfig) -> Self {
        self.config.synthesis = synthesis;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, AudiobookError> {
        let c = &self.config;
        if c.fingerprint_prefix_bytes == 0 {
            return Err(AudiobookError::InvalidConfig(
                "fingerprint_prefix_bytes must be > 0".into(),
            ));
        }
        if c.max_chars < 20 {
            return Err(AudiobookError::InvalidConfig(format!(
                "max_chars must be ≥ 20, got {}",
                c.max_chars
            )));
        }
        if c.output_dir.as_os_str().is_empty() {
            return Err(AudiobookError::InvalidConfig(
                "output_dir must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Settings for the LLM text normalizer.
#[derive(Clone)]
pub struct NormalizeConfig {
    /// Use an LLM as the primary normalizer. When false, only the regex
    /// rules run. Default: true.
    pub use_llm: bool,

    /// Model identifier, e.g. "gpt-4.1-nano". If None, uses "gpt-4.1-nano".
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per unit. Default: 16384.
    pub max_tokens: usize,

    /// Retries on a failed LLM call before falling back. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            use_llm: true,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 16384,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

impl fmt::Debug for NormalizeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizeConfig")
            .field("use_llm", &self.use_llm)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Settings for the speech backend.
#[derive(Clone, PartialEq, Eq)]
pub struct SynthesisConfig {
    /// Registry key of the backend. Default: "openai".
    pub backend: String,
    /// Voice identifier understood by the backend. Default: "nova".
    pub voice: String,
    /// Backend model. Default: "tts-1".
    pub model: String,
    /// Base URL for HTTP backends. Default: "https://api.openai.com/v1".
    pub base_url: String,
    /// API key; HTTP backends fall back to their environment variable.
    pub api_key: Option<String>,
    /// Per-request timeout in seconds. Default: 120.
    pub request_timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            backend: "openai".to_string(),
            voice: "nova".to_string(),
            model: "tts-1".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for SynthesisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisConfig")
            .field("backend", &self.backend)
            .field("voice", &self.voice)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}
