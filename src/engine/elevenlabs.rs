//! ElevenLabs text-to-speech backend.
//!
//! The API streams raw 16-bit PCM when asked for `pcm_24000`; a RIFF header
//! is prepended so every sub-unit artifact is a playable `.wav` like the
//! other backends produce.

use crate::config::SynthesisConfig;
use crate::engine::{truncate_error_body, write_audio, SpeechEngine, NETWORK_WORKERS};
use crate::error::{AudiobookError, SynthesisError};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "elevenlabs";

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const DEFAULT_MODEL: &str = "eleven_multilingual_v2";
/// "Rachel".
const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

const OUTPUT_FORMAT: &str = "pcm_24000";
const SAMPLE_RATE: u32 = 24_000;

/// Characters per request accepted by the multilingual models.
const MAX_INPUT_CHARS: usize = 5000;

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

/// HTTP speech synthesis against the ElevenLabs API.
pub struct ElevenLabsSpeech {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ElevenLabsSpeech {
    /// Build from config; the API key falls back to `ELEVENLABS_API_KEY`.
    ///
    /// Voice, model and base URL still holding the OpenAI defaults are
    /// replaced with ElevenLabs' own.
    pub fn from_config(config: &SynthesisConfig) -> Result<Self, AudiobookError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("ELEVENLABS_API_KEY").ok().filter(|k| !k.is_empty()))
            .ok_or_else(|| AudiobookError::EngineNotConfigured {
                name: BACKEND.to_string(),
                hint: "set ELEVENLABS_API_KEY or SynthesisConfig::api_key".to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AudiobookError::EngineNotConfigured {
                name: BACKEND.to_string(),
                hint: e.to_string(),
            })?;

        let openai = SynthesisConfig::default();
        let own = |value: &str, openai_default: &str, fallback: &str| {
            if value.is_empty() || value == openai_default {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };
        let base_url = own(config.base_url.as_str(), openai.base_url.as_str(), DEFAULT_BASE_URL);
        let voice = own(config.voice.as_str(), openai.voice.as_str(), DEFAULT_VOICE_ID);

        Ok(Self {
            client,
            endpoint: speech_endpoint(&base_url, &voice),
            api_key,
            model: own(config.model.as_str(), openai.model.as_str(), DEFAULT_MODEL),
        })
    }
}

fn speech_endpoint(base_url: &str, voice_id: &str) -> String {
    format!(
        "{}/text-to-speech/{}?output_format={}",
        base_url.trim_end_matches('/'),
        voice_id,
        OUTPUT_FORMAT
    )
}

/// Canonical 44-byte RIFF header for mono 16-bit PCM.
fn wav_header(sample_rate: u32, data_len: u32) -> [u8; 44] {
    const CHANNELS: u16 = 1;
    const BITS: u16 = 16;
    let block_align = CHANNELS * BITS / 8;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut h = [0_u8; 44];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16_u32.to_le_bytes());
    h[20..22].copy_from_slice(&1_u16.to_le_bytes());
    h[22..24].copy_from_slice(&CHANNELS.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&BITS.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

#[async_trait]
impl SpeechEngine for ElevenLabsSpeech {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn synthesize(&self, text: &str, output: &Path) -> Result<(), SynthesisError> {
        let request_err = |e: reqwest::Error| SynthesisError::Request {
            backend: BACKEND.to_string(),
            detail: e.to_string(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("xi-api-key", &self.api_key)
            .json(&SpeechRequest {
                text,
                model_id: &self.model,
            })
            .send()
            .await
            .map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Status {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                body: truncate_error_body(body),
            });
        }

        let pcm = response.bytes().await.map_err(request_err)?;
        let data_len = u32::try_from(pcm.len()).map_err(|_| {
            SynthesisError::Engine(format!(
                "{}: {} bytes of audio exceed the WAV size limit",
                BACKEND,
                pcm.len()
            ))
        })?;

        let mut wav = Vec::with_capacity(44 + pcm.len());
        wav.extend_from_slice(&wav_header(SAMPLE_RATE, data_len));
        wav.extend_from_slice(&pcm);
        write_audio(output, &wav).await?;
        debug!("{}: {} PCM bytes -> {}", BACKEND, pcm.len(), output.display());
        Ok(())
    }

    fn max_input_chars(&self) -> Option<usize> {
        Some(MAX_INPUT_CHARS)
    }

    fn preferred_workers(&self) -> Option<usize> {
        Some(NETWORK_WORKERS)
    }
}
