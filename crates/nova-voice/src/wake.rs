//! Background wake-word scanning.
//!
//! While the orchestrator is Idle, the detector repeatedly borrows the microphone for
//! a short window and asks its engine whether the wake phrase was spoken. It yields
//! the microphone the moment a capture asks for it and stays quiet outside Idle.

use crate::capture::AudioInput;
use crate::error::VoiceResult;
use crate::mic::MicrophoneLock;
use crate::stt::SpeechRecognizer;
use async_trait::async_trait;
use nova_core::TurnState;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait WakeWordEngine: Send + Sync {
    /// Listen for up to `window`; true when the wake phrase was heard.
    async fn listen_for_phrase(&self, window: Duration) -> VoiceResult<bool>;

    /// Abandon a window in progress (the microphone is wanted elsewhere).
    fn cancel(&self) {}
}

/// Lowercase, punctuation stripped, whitespace collapsed.
pub fn normalize_phrase(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wake detection by transcribing each short window and looking for the phrase in it.
pub struct TranscribedPhraseEngine {
    input: Arc<dyn AudioInput>,
    recognizer: Arc<dyn SpeechRecognizer>,
    phrase: String,
}

impl TranscribedPhraseEngine {
    pub fn new(
        input: Arc<dyn AudioInput>,
        recognizer: Arc<dyn SpeechRecognizer>,
        phrase: &str,
    ) -> Self {
        Self {
            input,
            recognizer,
            phrase: normalize_phrase(phrase),
        }
    }

    pub fn matches(&self, transcript: &str) -> bool {
        if self.phrase.is_empty() {
            return false;
        }
        let heard = format!(" {} ", normalize_phrase(transcript));
        heard.contains(&format!(" {} ", self.phrase))
    }
}

#[async_trait]
impl WakeWordEngine for TranscribedPhraseEngine {
    async fn listen_for_phrase(&self, window: Duration) -> VoiceResult<bool> {
        let audio = self.input.record(window).await?;
        if audio.is_empty() {
            return Ok(false);
        }
        let transcript = self.recognizer.transcribe(&audio, None).await?;
        let heard = self.matches(&transcript.text);
        debug!("wake window heard {:?} (match: {})", transcript.text, heard);
        Ok(heard)
    }

    fn cancel(&self) {
        self.input.stop();
    }
}

pub type ActivationCallback = Arc<dyn Fn() + Send + Sync>;

pub struct WakeWordDetector {
    engine: Arc<dyn WakeWordEngine>,
    mic: MicrophoneLock,
    turn_state: watch::Receiver<TurnState>,
    window: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WakeWordDetector {
    pub fn new(
        engine: Arc<dyn WakeWordEngine>,
        mic: MicrophoneLock,
        turn_state: watch::Receiver<TurnState>,
        window: Duration,
    ) -> Self {
        Self {
            engine,
            mic,
            turn_state,
            window,
            task: Mutex::new(None),
        }
    }

    /// Start scanning in the background. `on_activation` runs each time the phrase is
    /// heard while Idle. Returns false if already running.
    pub fn start_background_listening(&self, on_activation: ActivationCallback) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return false;
        }
        let engine = Arc::clone(&self.engine);
        let mic = self.mic.clone();
        let state = self.turn_state.clone();
        let window = self.window;
        *task = Some(tokio::spawn(scan_loop(engine, mic, state, window, on_activation)));
        info!("wake word detection started");
        true
    }

    pub fn stop_background_listening(&self) {
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            self.engine.cancel();
            info!("wake word detection stopped");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for WakeWordDetector {
    fn drop(&mut self) {
        self.stop_background_listening();
    }
}

async fn scan_loop(
    engine: Arc<dyn WakeWordEngine>,
    mic: MicrophoneLock,
    mut state: watch::Receiver<TurnState>,
    window: Duration,
    on_activation: ActivationCallback,
) {
    loop {
        while *state.borrow_and_update() != TurnState::Idle {
            if state.changed().await.is_err() {
                return;
            }
        }

        let Some(guard) = mic.try_acquire_background() else {
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        };

        let heard = tokio::select! {
            result = engine.listen_for_phrase(window) => result,
            _ = mic.preempted() => {
                engine.cancel();
                debug!("wake scan yielded the microphone");
                Ok(false)
            }
        };
        drop(guard);

        let still_idle = *state.borrow() == TurnState::Idle;
        match heard {
            Ok(true) if still_idle => {
                info!("wake word detected");
                on_activation();
                // Give the orchestrator a moment to leave Idle before scanning again.
                let _ = tokio::time::timeout(Duration::from_millis(500), state.changed()).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("wake word scan failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
