//! OpenAI-compatible `/audio/speech` backend.
//!
//! Any server exposing the same endpoint (OpenAI, a local proxy, a
//! self-hosted model gateway) works by pointing `base_url` at it.

use crate::config::SynthesisConfig;
use crate::engine::{truncate_error_body, write_audio, SpeechEngine, NETWORK_WORKERS};
use crate::error::{AudiobookError, SynthesisError};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "openai";

/// Characters per request the speech endpoint accepts.
const MAX_INPUT_CHARS: usize = 4096;

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'a str,
}

/// HTTP speech synthesis against an OpenAI-compatible endpoint.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    voice: String,
}

impl OpenAiSpeech {
    /// Build from config; the API key falls back to `OPENAI_API_KEY`.
    pub fn from_config(config: &SynthesisConfig) -> Result<Self, AudiobookError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))
            .ok_or_else(|| AudiobookError::EngineNotConfigured {
                name: BACKEND.to_string(),
                hint: "set OPENAI_API_KEY or SynthesisConfig::api_key".to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AudiobookError::EngineNotConfigured {
                name: BACKEND.to_string(),
                hint: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: speech_endpoint(&config.base_url),
            api_key,
            model: config.model.clone(),
            voice: config.voice.clone(),
        })
    }
}

fn speech_endpoint(base_url: &str) -> String {
    format!("{}/audio/speech", base_url.trim_end_matches('/'))
}

#[async_trait]
impl SpeechEngine for OpenAiSpeech {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn synthesize(&self, text: &str, output: &Path) -> Result<(), SynthesisError> {
        let body = SpeechRequest {
            model: &self.model,
            voice: &self.voice,
            input: text,
            response_format: "wav",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Request {
                backend: BACKEND.to_string(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Status {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                body: truncate_error_body(body),
            });
        }

        let bytes = response.bytes().await.map_err(|e| SynthesisError::Request {
            backend: BACKEND.to_string(),
            detail: e.to_string(),
        })?;
        write_audio(output, &bytes).await?;
        debug!("{}: {} bytes -> {}", BACKEND, bytes.len(), output.display());
        Ok(())
    }

    fn max_input_chars(&self) -> Option<usize> {
        Some(MAX_INPUT_CHARS)
    }

    fn preferred_workers(&self) -> Option<usize> {
        Some(NETWORK_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            speech_endpoint("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/audio/speech"
        );
        assert_eq!(
            speech_endpoint("http://localhost:8880/v1"),
            "http://localhost:8880/v1/audio/speech"
        );
    }

    #[test]
    fn explicit_key_builds_engine() {
        let cfg = SynthesisConfig {
            api_key: Some("sk-test".into()),
            ..SynthesisConfig::default()
        };
        let engine = OpenAiSpeech::from_config(&cfg).unwrap();
        assert_eq!(engine.name(), "openai");
        assert_eq!(engine.max_input_chars(), Some(4096));
        assert_eq!(engine.preferred_workers(), Some(8));
        assert_eq!(engine.voice, cfg.voice);
    }

    #[test]
    fn request_body_asks_for_wav() {
        let body = SpeechRequest {
            model: "tts-1",
            voice: "nova",
            input: "Hello.",
            response_format: "wav",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["response_format"], "wav");
        assert_eq!(json["input"], "Hello.");
    }
}
