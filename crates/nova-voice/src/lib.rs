//! # Nova Voice - Turn Orchestration
//!
//! Activation (wake phrase or push-to-talk), capture, recognition, dialogue,
//! synthesis and playback composed into one turn-taking state machine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Turn Orchestrator                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │  │  Wake Word   │──▶│   Capture    │──▶│  Recognizer  │          │
//! │  │ (background) │   │ (VAD + gap)  │   │    (STT)     │          │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘          │
//! │         ▲ mic lock          ▲                  ▼                  │
//! │         └──────────────────┘           ┌──────────────┐          │
//! │  ┌──────────────┐   ┌──────────────┐   │   Dialogue   │          │
//! │  │   Speaker    │◀──│ Synthesizer  │◀──│   Session    │          │
//! │  │   (rodio)    │   │    (TTS)     │   └──────────────┘          │
//! │  └──────────────┘   └──────────────┘                              │
//! │        store + dashboard events at every transition               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod error;
pub mod mic;
#[cfg(feature = "hardware")]
pub mod microphone;
pub mod orchestrator;
pub mod playback;
pub mod segmenter;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wake;

pub use capture::{AudioBuffer, AudioCaptureDevice, AudioInput};
pub use error::{VoiceError, VoiceResult};
pub use mic::{MicGuard, MicHolder, MicrophoneLock};
#[cfg(feature = "hardware")]
pub use microphone::{list_input_devices, test_microphone, MicLevel, MicrophoneConfig, MicrophoneInput};
pub use orchestrator::{
    is_stop_speaking_phrase, is_termination_phrase, Collaborators, OrchestratorConfig,
    TurnOrchestrator, STOP_SPEAKING_PHRASES, TERMINATION_PHRASES,
};
#[cfg(feature = "hardware")]
pub use playback::SpeakerOutput;
pub use playback::{AudioPlayer, SilentPlayer};
pub use segmenter::{SegmenterConfig, UtteranceSegmenter};
pub use stt::{
    create_recognizer, whisper_config_for_size, OpenAiRecognizer, PlaceholderRecognizer,
    RecognizerFactory, ReloadingRecognizer, SpeechRecognizer, Transcript,
};
#[cfg(feature = "whisper")]
pub use stt::WhisperRecognizer;
pub use tts::{
    create_synthesizer, filter_voices, voice_catalogue, OpenAiSynthesizer, PlaceholderSynthesizer,
    SpeechSynthesizer, VoiceInfo,
};
pub use vad::{VadConfig, VadDetector};
pub use wake::{
    normalize_phrase, ActivationCallback, TranscribedPhraseEngine, WakeWordDetector,
    WakeWordEngine,
};
