//! **Speech-to-Text** — turn a finished `AudioBuffer` into a transcript.
//!
//! Backends: an OpenAI-compatible `/audio/transcriptions` endpoint, local Whisper
//! (`whisper` feature), and a placeholder for wiring tests.

use crate::capture::AudioBuffer;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use nova_core::{api_key_from_env, SharedSettings, WhisperConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const STT_KEY_VARS: [&str; 3] = ["NOVA_STT_API_KEY", "NOVA_LLM_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Two-letter code when the engine reports one.
    pub language: Option<String>,
}

impl Transcript {
    pub fn new(text: impl Into<String>, language: Option<String>) -> Self {
        Self {
            text: text.into(),
            language,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe one utterance. An empty buffer yields an empty transcript.
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> VoiceResult<Transcript>;
}

/// Whisper's verbose output names languages in English; map the ones we speak.
fn language_code(name: &str) -> Option<String> {
    let lower = name.trim().to_lowercase();
    match lower.as_str() {
        "" => None,
        "english" => Some("en".to_string()),
        "french" => Some("fr".to_string()),
        code if code.len() == 2 => Some(code.to_string()),
        _ => None,
    }
}

/// Placeholder recognizer: returns a fixed string. Use for testing the loop without an engine.
#[derive(Debug, Default)]
pub struct PlaceholderRecognizer {
    pub response: Option<String>,
}

impl PlaceholderRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for PlaceholderRecognizer {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> VoiceResult<Transcript> {
        if audio.is_empty() {
            return Ok(Transcript::default());
        }
        let text = self.response.clone().unwrap_or_default();
        Ok(Transcript::new(text, language_hint.map(str::to_string)))
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, local whisper servers, etc.).
#[derive(Debug, Clone)]
pub struct OpenAiRecognizer {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiRecognizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            client,
        })
    }

    pub fn from_config(config: &WhisperConfig) -> VoiceResult<Self> {
        Self::new(
            config.api_url.clone(),
            api_key_from_env(&STT_KEY_VARS),
            config.api_model.clone(),
        )
    }
}

#[async_trait]
impl SpeechRecognizer for OpenAiRecognizer {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> VoiceResult<Transcript> {
        if audio.is_empty() {
            return Ok(Transcript::default());
        }
        let wav = audio.to_wav()?;
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(lang) = language_hint {
            form = form.text("language", lang.to_string());
        }

        let mut req = self.client.post(&url).multipart(form);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await.map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().await.map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let language = json
            .get("language")
            .and_then(|l| l.as_str())
            .and_then(language_code)
            .or_else(|| language_hint.map(str::to_string));
        debug!("transcribed {} chars (language {:?})", text.len(), language);
        Ok(Transcript::new(text, language))
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper: loads a ggml model (e.g. ggml-base.bin) and runs inference on-device.
    /// Audio must be 16 kHz mono f32.
    pub struct WhisperRecognizer {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Arc<Mutex<whisper_rs::WhisperState>>,
    }

    impl WhisperRecognizer {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Arc::new(Mutex::new(state)),
            })
        }
    }

    #[async_trait]
    impl SpeechRecognizer for WhisperRecognizer {
        async fn transcribe(
            &self,
            audio: &AudioBuffer,
            language_hint: Option<&str>,
        ) -> VoiceResult<Transcript> {
            if audio.is_empty() {
                return Ok(Transcript::default());
            }
            if audio.sample_rate != 16000 {
                return Err(VoiceError::Stt(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    audio.sample_rate
                )));
            }
            let state = Arc::clone(&self.state);
            let samples = audio.samples.clone();
            let language = language_hint.unwrap_or("auto").to_string();
            let text = tokio::task::spawn_blocking(move || -> VoiceResult<String> {
                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_no_timestamps(true);
                params.set_language(Some(&language));

                let mut state = state
                    .lock()
                    .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
                state
                    .full(params, &samples)
                    .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
                Ok(state
                    .as_iter()
                    .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_string())
            })
            .await
            .map_err(|e| VoiceError::Stt(format!("Whisper task failed: {}", e)))??;
            Ok(Transcript::new(text, language_hint.map(str::to_string)))
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperRecognizer;

/// Best available recognizer: (1) local Whisper when `model_path` is set and the feature
/// is on, (2) the remote API when a key is present, (3) the placeholder.
pub fn create_recognizer(config: &WhisperConfig) -> VoiceResult<Arc<dyn SpeechRecognizer>> {
    #[cfg(feature = "whisper")]
    {
        if let Some(path) = config.model_path.as_ref().and_then(|p| p.to_str()) {
            match whisper_stt::WhisperRecognizer::new(path) {
                Ok(w) => {
                    info!("STT: local Whisper ({})", path);
                    return Ok(Arc::new(w));
                }
                Err(e) => warn!("local Whisper unavailable: {}", e),
            }
        }
    }
    let remote = OpenAiRecognizer::from_config(config)?;
    if remote.api_key.is_some() {
        info!("STT: {} via {}", remote.model, remote.base_url);
        return Ok(Arc::new(remote));
    }
    warn!("STT: no API key or local model configured; using placeholder recognizer");
    Ok(Arc::new(PlaceholderRecognizer::new()))
}

/// Builds a recognizer for one Whisper configuration. [`create_recognizer`] in production.
pub type RecognizerFactory =
    Arc<dyn Fn(&WhisperConfig) -> VoiceResult<Arc<dyn SpeechRecognizer>> + Send + Sync>;

/// `base` with the model size switched to `size`. A local model file named
/// `ggml-<size>[.suffix]` is swapped for its sibling of the new size.
pub fn whisper_config_for_size(base: &WhisperConfig, size: &str) -> WhisperConfig {
    let mut config = base.clone();
    config.model = size.to_string();
    config.model_path = base.model_path.as_deref().map(|p| model_file_for_size(p, size));
    config
}

fn model_file_for_size(path: &Path, size: &str) -> PathBuf {
    let Some(rest) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("ggml-"))
    else {
        return path.to_path_buf();
    };
    let suffix = rest.find('.').map(|i| &rest[i..]).unwrap_or("");
    path.with_file_name(format!("ggml-{}{}", size, suffix))
}

struct LoadedRecognizer {
    size: String,
    recognizer: Arc<dyn SpeechRecognizer>,
}

/// Follows the runtime `whisper_model_size` setting: the wrapped recognizer is rebuilt
/// before the first transcription after a change. A failed rebuild keeps the old one.
pub struct ReloadingRecognizer {
    base: WhisperConfig,
    settings: SharedSettings,
    factory: RecognizerFactory,
    loaded: tokio::sync::Mutex<LoadedRecognizer>,
}

impl ReloadingRecognizer {
    pub fn new(
        base: WhisperConfig,
        settings: SharedSettings,
        factory: RecognizerFactory,
    ) -> VoiceResult<Self> {
        let recognizer = factory(&base)?;
        Ok(Self {
            loaded: tokio::sync::Mutex::new(LoadedRecognizer {
                size: base.model.clone(),
                recognizer,
            }),
            base,
            settings,
            factory,
        })
    }

    async fn current(&self) -> Arc<dyn SpeechRecognizer> {
        let wanted = self.settings.read().await.whisper_model_size.clone();
        let mut loaded = self.loaded.lock().await;
        if loaded.size != wanted {
            let config = whisper_config_for_size(&self.base, &wanted);
            let factory = Arc::clone(&self.factory);
            let built = tokio::task::spawn_blocking(move || factory(&config))
                .await
                .map_err(|e| VoiceError::Stt(e.to_string()))
                .and_then(|r| r);
            match built {
                Ok(recognizer) => {
                    info!("STT: Whisper model {} -> {}", loaded.size, wanted);
                    loaded.recognizer = recognizer;
                }
                Err(e) => warn!(
                    "Whisper model {} unavailable, keeping {}: {}",
                    wanted, loaded.size, e
                ),
            }
            loaded.size = wanted;
        }
        Arc::clone(&loaded.recognizer)
    }
}

#[async_trait]
impl SpeechRecognizer for ReloadingRecognizer {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> VoiceResult<Transcript> {
        self.current().await.transcribe(audio, language_hint).await
    }
}
