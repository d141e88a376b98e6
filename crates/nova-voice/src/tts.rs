//! **Text-to-Speech** — synthesize reply text into playable audio bytes (MP3/WAV).
//!
//! Voices are addressed by neural-voice names (`en-US-AriaNeural`, `fr-FR-DeniseNeural`);
//! the OpenAI-compatible backend maps each one onto one of its own voices.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use nova_core::{api_key_from_env, TtsConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TTS_KEY_VARS: [&str; 3] = ["NOVA_TTS_API_KEY", "NOVA_LLM_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceInfo {
    pub name: String,
    pub locale: String,
    pub gender: String,
}

const CATALOGUE: &[(&str, &str, &str)] = &[
    ("en-US-AriaNeural", "en-US", "Female"),
    ("en-US-GuyNeural", "en-US", "Male"),
    ("en-US-JennyNeural", "en-US", "Female"),
    ("en-GB-SoniaNeural", "en-GB", "Female"),
    ("en-GB-RyanNeural", "en-GB", "Male"),
    ("fr-FR-DeniseNeural", "fr-FR", "Female"),
    ("fr-FR-HenriNeural", "fr-FR", "Male"),
    ("es-ES-ElviraNeural", "es-ES", "Female"),
    ("de-DE-KatjaNeural", "de-DE", "Female"),
    ("it-IT-ElsaNeural", "it-IT", "Female"),
];

const OPENAI_VOICES: &[&str] = &[
    "alloy", "ash", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer",
];

/// The voices every synthesizer advertises.
pub fn voice_catalogue() -> Vec<VoiceInfo> {
    CATALOGUE
        .iter()
        .map(|(name, locale, gender)| VoiceInfo {
            name: name.to_string(),
            locale: locale.to_string(),
            gender: gender.to_string(),
        })
        .collect()
}

/// Keep voices whose locale starts with `language` (e.g. `fr`, `en-GB`).
pub fn filter_voices(voices: Vec<VoiceInfo>, language: Option<&str>) -> Vec<VoiceInfo> {
    match language.map(str::trim).filter(|l| !l.is_empty()) {
        Some(lang) => {
            let lang = lang.to_lowercase();
            voices
                .into_iter()
                .filter(|v| v.locale.to_lowercase().starts_with(&lang))
                .collect()
        }
        None => voices,
    }
}

/// Map a catalogue voice onto the backend's voice set. Native backend voice names pass through.
fn backing_voice(name: &str) -> &'static str {
    if let Some(v) = OPENAI_VOICES.iter().find(|v| v.eq_ignore_ascii_case(name)) {
        return v;
    }
    let gender = CATALOGUE
        .iter()
        .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, _, g)| *g);
    match gender {
        Some("Male") => "onyx",
        Some(_) => "nova",
        None => "shimmer",
    }
}

/// `"+10%"` → 1.1, `"-25%"` → 0.75. Anything unparsable is normal speed.
fn speed_from_rate(rate: &str) -> f32 {
    let pct = rate
        .trim()
        .trim_end_matches('%')
        .trim_start_matches('+')
        .parse::<f32>()
        .unwrap_or(0.0);
    (1.0 + pct / 100.0).clamp(0.25, 4.0)
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize text with the given voice. Empty bytes mean nothing to play.
    async fn synthesize(&self, text: &str, voice: &str) -> VoiceResult<Vec<u8>>;

    async fn list_voices(&self) -> VoiceResult<Vec<VoiceInfo>> {
        Ok(voice_catalogue())
    }
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderSynthesizer;

#[async_trait]
impl SpeechSynthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// OpenAI-compatible `/audio/speech` backend.
#[derive(Debug, Clone)]
pub struct OpenAiSynthesizer {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    pub speed: f32,
    client: reqwest::Client,
}

impl OpenAiSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        rate: &str,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            speed: speed_from_rate(rate),
            client,
        })
    }

    pub fn from_config(config: &TtsConfig) -> VoiceResult<Self> {
        let api_key = api_key_from_env(&TTS_KEY_VARS).ok_or_else(|| {
            VoiceError::Config(
                "TTS requires NOVA_TTS_API_KEY, NOVA_LLM_API_KEY, or OPENAI_API_KEY".to_string(),
            )
        })?;
        Self::new(&config.api_url, api_key, &config.model, &config.rate)
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url);
        let backing = backing_voice(voice);
        debug!("synthesizing {} chars with {} ({})", text.len(), voice, backing);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": backing,
            "speed": self.speed,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Remote synthesizer when a key is configured, otherwise the silent placeholder.
pub fn create_synthesizer(config: &TtsConfig) -> Arc<dyn SpeechSynthesizer> {
    match OpenAiSynthesizer::from_config(config) {
        Ok(tts) => {
            info!("TTS: {} via {}", tts.model, tts.base_url);
            Arc::new(tts)
        }
        Err(e) => {
            warn!("TTS unavailable ({}); replies will not be spoken", e);
            Arc::new(PlaceholderSynthesizer)
        }
    }
}
