//! Speech synthesis backends and the single-flight resource wrapper.
//!
//! Every backend implements one capability, [`SpeechEngine::synthesize`].
//! Backends are selected by name through an [`EngineRegistry`] instead of a
//! type hierarchy, so adding one is a `register` call.
//!
//! A loaded engine is generally not reentrant (a local model, a single
//! external process). [`SingleFlight`] owns the lock around it: the only way
//! to reach the engine is [`SingleFlight::acquire`], so no caller can forget
//! to serialise.

pub mod elevenlabs;
pub mod openai;

use crate::config::SynthesisConfig;
use crate::error::{AudiobookError, SynthesisError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A text-to-speech backend.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Synthesize `text` and write the audio to `output`.
    ///
    /// `output`'s parent directory exists when this is called.
    async fn synthesize(&self, text: &str, output: &Path) -> Result<(), SynthesisError>;

    /// Preferred upper bound on characters per call, when the backend has one
    /// larger than the local default (network backends bill per request).
    fn max_input_chars(&self) -> Option<usize> {
        None
    }

    /// Sub-unit calls worth keeping in flight at once. Network backends
    /// are latency-bound and want many; `None` means CPU-bound.
    fn preferred_workers(&self) -> Option<usize> {
        None
    }
}

/// Concurrent requests suggested by the HTTP backends.
pub(crate) const NETWORK_WORKERS: usize = 8;

/// Longest error body kept in [`SynthesisError::Status`].
const MAX_ERROR_BODY: usize = 300;

/// Cut an HTTP error body down to [`MAX_ERROR_BODY`] bytes on a char boundary.
pub(crate) fn truncate_error_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Write downloaded audio next to `output`, then rename it into place.
///
/// A partial file would be taken as finished on resume.
pub(crate) async fn write_audio(output: &Path, bytes: &[u8]) -> Result<(), SynthesisError> {
    let partial = output.with_extension("wav.part");
    let write_err = |e: std::io::Error| SynthesisError::Write {
        path: output.to_path_buf(),
        detail: e.to_string(),
    };
    tokio::fs::write(&partial, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&partial, output).await.map_err(write_err)
}

/// Exclusive-access wrapper around a shared, non-reentrant resource.
///
/// Cloning shares the same lock; every clone funnels through one section.
pub struct SingleFlight<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> SingleFlight<T> {
    pub fn new(resource: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(resource)),
        }
    }

    /// Wait for exclusive access. Access ends when the guard drops.
    pub async fn acquire(&self) -> SingleFlightGuard<'_, T> {
        SingleFlightGuard {
            guard: self.inner.lock().await,
        }
    }
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("busy", &self.inner.try_lock().is_err())
            .finish()
    }
}

/// Proof of exclusive access to a [`SingleFlight`] resource.
pub struct SingleFlightGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for SingleFlightGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// The engine handle shared by every scheduler worker.
pub type SharedEngine = SingleFlight<Box<dyn SpeechEngine>>;

/// Constructor stored in the registry.
pub type EngineConstructor =
    Arc<dyn Fn(&SynthesisConfig) -> Result<Box<dyn SpeechEngine>, AudiobookError> + Send + Sync>;

/// Name → constructor map for synthesis backends.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    constructors: BTreeMap<String, EngineConstructor>,
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in backends (`"openai"`, `"elevenlabs"`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("openai", |cfg| {
            Ok(Box::new(openai::OpenAiSpeech::from_config(cfg)?) as Box<dyn SpeechEngine>)
        });
        registry.register("elevenlabs", |cfg| {
            Ok(Box::new(elevenlabs::ElevenLabsSpeech::from_config(cfg)?) as Box<dyn SpeechEngine>)
        });
        registry
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&SynthesisConfig) -> Result<Box<dyn SpeechEngine>, AudiobookError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Construct the backend named by `config.backend`.
    pub fn create(&self, config: &SynthesisConfig) -> Result<Box<dyn SpeechEngine>, AudiobookError> {
        let constructor = self.constructors.get(&config.backend).ok_or_else(|| {
            AudiobookError::UnknownEngine {
                name: config.backend.clone(),
                available: self.names().join(", "),
            }
        })?;
        constructor(config)
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullEngine;

    #[async_trait]
    impl SpeechEngine for NullEngine {
        fn name(&self) -> &str {
            "null"
        }

        async fn synthesize(&self, _text: &str, _output: &Path) -> Result<(), SynthesisError> {
            Ok(())
        }
    }

    #[test]
    fn registry_creates_registered_backend() {
        let mut registry = EngineRegistry::new();
        registry.register("null", |_| Ok(Box::new(NullEngine) as Box<dyn SpeechEngine>));
        let cfg = SynthesisConfig {
            backend: "null".into(),
            ..SynthesisConfig::default()
        };
        let engine = registry.create(&cfg).unwrap();
        assert_eq!(engine.name(), "null");
    }

    #[test]
    fn registry_rejects_unknown_backend() {
        let registry = EngineRegistry::with_builtins();
        let cfg = SynthesisConfig {
            backend: "kazoo".into(),
            ..SynthesisConfig::default()
        };
        match registry.create(&cfg) {
            Err(AudiobookError::UnknownEngine { name, available }) => {
                assert_eq!(name, "kazoo");
                assert_eq!(available, "elevenlabs, openai");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("unknown backend must not construct"),
        }
    }

    #[test]
    fn error_body_is_cut_on_a_char_boundary() {
        let body = "é".repeat(200);
        let cut = truncate_error_body(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_error_body("short".into()), "short");
    }

    #[tokio::test]
    async fn audio_lands_without_a_leftover_partial() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = tmp.path().join("chunk_0000.wav");
        write_audio(&output, b"RIFF").await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"RIFF");
        assert!(!output.with_extension("wav.part").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_flight_admits_one_holder_at_a_time() {
        let shared = SingleFlight::new(());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let shared = shared.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _guard = shared.acquire().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
