//! Nova configuration.
//!
//! `NovaConfig` is assembled with the `config` crate: built-in defaults, then an optional
//! TOML file, then `NOVA_*` environment overrides (`NOVA_LLM__MODEL=gpt-4o` sets `llm.model`).
//! API keys are never read from the file; see [`api_key_from_env`].
//!
//! `Settings` is the small, validated subset the dashboard may change at runtime.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

const DEFAULT_CONFIG_PATH: &str = "config/nova.toml";

pub const WHISPER_MODEL_SIZES: [&str; 5] = ["tiny", "base", "small", "medium", "large"];
pub const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("settings could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

// -----------------------------------------------------------------------------
// Static configuration
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub name: String,
    pub wake_word: String,
    pub languages: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: "Nova".to_string(),
            wake_word: "hey nova".to_string(),
            languages: vec!["en".to_string(), "fr".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    /// tiny | base | small | medium | large
    pub model: String,
    pub device: String,
    /// Local ggml model file; when set and the `whisper` feature is on, recognition runs on-device.
    pub model_path: Option<PathBuf>,
    /// Remote OpenAI-compatible transcription endpoint.
    pub api_url: String,
    pub api_model: String,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            device: "cpu".to_string(),
            model_path: None,
            api_url: "https://api.openai.com/v1".to_string(),
            api_model: "whisper-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub voice_en: String,
    pub voice_fr: String,
    /// Relative speaking rate, e.g. `+10%` or `-5%`.
    pub rate: String,
    pub api_url: String,
    pub model: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice_en: "en-US-AriaNeural".to_string(),
            voice_fr: "fr-FR-DeniseNeural".to_string(),
            rate: "+0%".to_string(),
            api_url: "https://api.openai.com/v1".to_string(),
            model: "tts-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 500,
            temperature: 0.7,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    /// Seconds of silence that close an utterance.
    pub silence_duration: f32,
    pub min_speech_ms: u64,
    pub capture_timeout_secs: u64,
    pub wake_window_secs: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            silence_duration: 1.5,
            min_speech_ms: 200,
            capture_timeout_secs: 15,
            wake_window_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_history: usize,
    pub persist: bool,
    pub persist_path: PathBuf,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_history: 20,
            persist: true,
            persist_path: PathBuf::from("./conversations/"),
        }
    }
}

impl ConversationConfig {
    /// SQLite file inside `persist_path`.
    pub fn database_path(&self) -> PathBuf {
        self.persist_path.join("conversations.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("./logs/assistant.log")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    pub rate_limit_backoff_ms: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            rate_limit_backoff_ms: 1000,
        }
    }
}

fn default_system_prompt() -> String {
    "You are Nova, a helpful voice assistant. Be concise and conversational.".to_string()
}

/// Full process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NovaConfig {
    pub assistant: AssistantConfig,
    pub whisper: WhisperConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub audio: AudioSettings,
    pub conversation: ConversationConfig,
    pub system_prompt: String,
    pub web: WebConfig,
    pub logging: LoggingConfig,
    pub dialogue: DialogueConfig,
    /// Where dashboard changes to `Settings` are written. `None` keeps them in memory only.
    pub settings_file: Option<PathBuf>,
}

impl Default for NovaConfig {
    fn default() -> Self {
        Self {
            assistant: AssistantConfig::default(),
            whisper: WhisperConfig::default(),
            tts: TtsConfig::default(),
            llm: LlmConfig::default(),
            audio: AudioSettings::default(),
            conversation: ConversationConfig::default(),
            system_prompt: default_system_prompt(),
            web: WebConfig::default(),
            logging: LoggingConfig::default(),
            dialogue: DialogueConfig::default(),
            settings_file: Some(PathBuf::from("config/settings.toml")),
        }
    }
}

impl NovaConfig {
    /// Load from `NOVA_CONFIG` (or `config/nova.toml`) plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("NOVA_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load with an explicit file path. A missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("NOVA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }
}

/// First non-empty variable among `names`.
pub fn api_key_from_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

// -----------------------------------------------------------------------------
// Runtime settings
// -----------------------------------------------------------------------------

/// Settings the dashboard may read and change. Applied from the next turn on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub name: String,
    pub prompt: String,
    pub model: String,
    pub whisper_model_size: String,
    pub voice_en: String,
    pub voice_fr: String,
    pub languages: Vec<String>,
    pub max_history: usize,
    pub wake_word: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&NovaConfig::default())
    }
}

pub type SharedSettings = Arc<RwLock<Settings>>;

/// Partial update accepted by `POST /api/config`. Unknown fields are rejected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub whisper_model_size: Option<String>,
    pub voice_en: Option<String>,
    pub voice_fr: Option<String>,
    pub languages: Option<Vec<String>>,
    pub max_history: Option<usize>,
    pub wake_word: Option<String>,
}

impl SettingsUpdate {
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

impl Settings {
    pub fn from_config(config: &NovaConfig) -> Self {
        Self {
            name: config.assistant.name.clone(),
            prompt: config.system_prompt.clone(),
            model: config.llm.model.clone(),
            whisper_model_size: config.whisper.model.clone(),
            voice_en: config.tts.voice_en.clone(),
            voice_fr: config.tts.voice_fr.clone(),
            languages: config.assistant.languages.clone(),
            max_history: config.conversation.max_history,
            wake_word: config.assistant.wake_word.clone(),
        }
    }

    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    /// Voice for a detected language; anything other than French speaks English.
    pub fn voice_for(&self, language: Option<&str>) -> &str {
        match language {
            Some(l) if l.eq_ignore_ascii_case("fr") => &self.voice_fr,
            _ => &self.voice_en,
        }
    }

    /// Recognition hint: only pinned when a single language is configured.
    pub fn language_hint(&self) -> Option<&str> {
        match self.languages.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("name", &self.name),
            ("prompt", &self.prompt),
            ("model", &self.model),
            ("voice_en", &self.voice_en),
            ("voice_fr", &self.voice_fr),
            ("wake_word", &self.wake_word),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
            }
        }
        if !WHISPER_MODEL_SIZES.contains(&self.whisper_model_size.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "whisper_model_size must be one of {}",
                WHISPER_MODEL_SIZES.join(", ")
            )));
        }
        if self.max_history == 0 || self.max_history > MAX_HISTORY_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_history must be between 1 and {}",
                MAX_HISTORY_LIMIT
            )));
        }
        if self.languages.is_empty() {
            return Err(ConfigError::Invalid("languages must not be empty".to_string()));
        }
        if let Some(bad) = self
            .languages
            .iter()
            .find(|l| l.len() != 2 || !l.chars().all(|c| c.is_ascii_lowercase()))
        {
            return Err(ConfigError::Invalid(format!(
                "language '{}' is not a two-letter code",
                bad
            )));
        }
        Ok(())
    }

    /// Apply an update atomically: either every field validates and is applied, or nothing changes.
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<(), ConfigError> {
        let mut next = self.clone();
        if let Some(v) = update.name {
            next.name = v.trim().to_string();
        }
        if let Some(v) = update.prompt {
            next.prompt = v.trim().to_string();
        }
        if let Some(v) = update.model {
            next.model = v.trim().to_string();
        }
        if let Some(v) = update.whisper_model_size {
            next.whisper_model_size = v.trim().to_lowercase();
        }
        if let Some(v) = update.voice_en {
            next.voice_en = v.trim().to_string();
        }
        if let Some(v) = update.voice_fr {
            next.voice_fr = v.trim().to_string();
        }
        if let Some(v) = update.languages {
            next.languages = v.iter().map(|l| l.trim().to_lowercase()).collect();
        }
        if let Some(v) = update.max_history {
            next.max_history = v;
        }
        if let Some(v) = update.wake_word {
            next.wake_word = v.trim().to_lowercase();
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Read settings saved by [`Settings::save_to_path`]. `Ok(None)` when the file does not exist.
    pub fn load_from_path(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(Some(settings))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}
