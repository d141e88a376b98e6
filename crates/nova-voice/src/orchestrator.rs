//! Turn Orchestrator - the turn-taking state machine.
//!
//! One turn runs `Idle → Activating → Listening → Transcribing → Thinking → Speaking → Idle`
//! as a single spawned task. Every transition happens under the turn cell lock, is checked
//! against the legal edges of [`TurnState`], is mirrored on a `watch` channel and is
//! published to the dashboard. Each turn carries an epoch; `stop()` bumps it, so whatever
//! an abandoned collaborator call returns afterwards is dropped on the floor.

use crate::capture::{AudioBuffer, AudioCaptureDevice};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::AudioPlayer;
use crate::stt::{SpeechRecognizer, Transcript};
use crate::tts::SpeechSynthesizer;
use crate::wake::normalize_phrase;
use nova_core::{
    new_session_id, CompletionOptions, ConversationStore, DialogueBackend, DialogueSession,
    EventBroadcaster, EventPayload, FailureKind, Message, NovaConfig, Settings, SharedSettings,
    StoreError, TurnState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const TERMINATION_PHRASES: &[&str] =
    &["stop", "exit", "quit", "goodbye", "bye", "arrête", "au revoir"];

/// Silence the reply without ending the conversation.
pub const STOP_SPEAKING_PHRASES: &[&str] = &["tais toi", "shut up"];

const APOLOGY_EN: &str = "Sorry, something went wrong. Please try again.";
const APOLOGY_FR: &str = "Désolé, une erreur s'est produite. Veuillez réessayer.";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Longest a single recording may run.
    pub capture_timeout: Duration,
    /// Pause before the one retry of a rate-limited dialogue request.
    pub rate_limit_backoff: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_secs(15),
            rate_limit_backoff: Duration::from_millis(1000),
            max_tokens: 500,
            temperature: 0.7,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &NovaConfig) -> Self {
        Self {
            capture_timeout: Duration::from_secs(config.audio.capture_timeout_secs),
            rate_limit_backoff: Duration::from_millis(config.dialogue.rate_limit_backoff_ms),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
        }
    }
}

/// Everything a turn talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub capture: AudioCaptureDevice,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn AudioPlayer>,
    pub backend: Arc<dyn DialogueBackend>,
    pub store: Arc<dyn ConversationStore>,
    pub events: Arc<EventBroadcaster>,
}

/// True for the phrases that end the conversation (`stop`, `exit`, `au revoir`, ...).
pub fn is_termination_phrase(text: &str) -> bool {
    let phrase = normalize_phrase(text);
    TERMINATION_PHRASES.iter().any(|p| *p == phrase)
}

pub fn is_stop_speaking_phrase(text: &str) -> bool {
    let phrase = normalize_phrase(text);
    STOP_SPEAKING_PHRASES.iter().any(|p| *p == phrase)
}

fn apology_for(language: &str) -> &'static str {
    if language.starts_with("fr") {
        APOLOGY_FR
    } else {
        APOLOGY_EN
    }
}

struct TurnCell {
    state: TurnState,
    epoch: u64,
    dialogue: Option<DialogueSession>,
    /// Session id dashboard events are published under.
    event_session: String,
    language: String,
    settings: Settings,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    collab: Collaborators,
    settings: SharedSettings,
    config: OrchestratorConfig,
    cell: Mutex<TurnCell>,
    state_tx: watch::Sender<TurnState>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct TurnOrchestrator {
    inner: Arc<Inner>,
}

impl TurnOrchestrator {
    pub fn new(collab: Collaborators, settings: Settings, config: OrchestratorConfig) -> Self {
        Self::with_shared_settings(collab, settings.shared(), config)
    }

    /// Settings are re-read at every activation, so dashboard updates apply from the next turn.
    pub fn with_shared_settings(
        collab: Collaborators,
        settings: SharedSettings,
        config: OrchestratorConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(TurnState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        let snapshot = settings
            .try_read()
            .map(|s| s.clone())
            .unwrap_or_default();
        let language = snapshot.language_hint().unwrap_or("en").to_string();
        Self {
            inner: Arc::new(Inner {
                collab,
                settings,
                config,
                cell: Mutex::new(TurnCell {
                    state: TurnState::Idle,
                    epoch: 0,
                    dialogue: None,
                    event_session: String::new(),
                    language,
                    settings: snapshot,
                    task: None,
                }),
                state_tx,
                shutdown_tx,
            }),
        }
    }

    pub fn state(&self) -> TurnState {
        *self.inner.state_tx.borrow()
    }

    /// Read-only view of the live state.
    pub fn subscribe_state(&self) -> watch::Receiver<TurnState> {
        self.inner.state_tx.subscribe()
    }

    pub fn settings(&self) -> SharedSettings {
        Arc::clone(&self.inner.settings)
    }

    pub async fn session_id(&self) -> Option<String> {
        let cell = self.inner.cell.lock().await;
        cell.dialogue.as_ref().map(|d| d.session_id().to_string())
    }

    /// Start a turn. Ignored (returns false) unless Idle.
    pub async fn activate(&self) -> bool {
        let inner = &self.inner;
        let mut cell = inner.cell.lock().await;
        if cell.state != TurnState::Idle {
            debug!("activation ignored: turn already {}", cell.state);
            return false;
        }
        if *inner.shutdown_tx.borrow() {
            debug!("activation ignored: conversation terminated");
            return false;
        }
        cell.epoch += 1;
        let epoch = cell.epoch;

        let settings = inner.settings.read().await.clone();
        cell.language = settings.language_hint().unwrap_or("en").to_string();
        let mut session_failure = None;
        if cell.dialogue.is_none() {
            match inner.create_dialogue(&settings).await {
                Ok(dialogue) => {
                    info!("new conversation session {}", dialogue.session_id());
                    cell.event_session = dialogue.session_id().to_string();
                    cell.dialogue = Some(dialogue);
                }
                Err(e) => {
                    cell.event_session = new_session_id();
                    session_failure = Some(e);
                }
            }
        }
        if let Some(dialogue) = cell.dialogue.as_mut() {
            dialogue.apply_settings(&settings);
        }
        cell.settings = settings;

        inner.transition(&mut cell, TurnState::Activating, None);
        let task_inner = Arc::clone(inner);
        cell.task = Some(match session_failure {
            Some(e) => tokio::spawn(async move {
                task_inner
                    .fail(epoch, FailureKind::PersistenceError, e.to_string())
                    .await
            }),
            None => tokio::spawn(async move { task_inner.listen_phase(epoch).await }),
        });
        true
    }

    /// Push-to-talk entry point; same rules as [`activate`](Self::activate).
    pub async fn submit_manual_trigger(&self) -> bool {
        self.activate().await
    }

    /// Abandon the current turn and return to Idle. Results still in flight are discarded.
    /// Returns false if already Idle.
    pub async fn stop(&self) -> bool {
        self.inner.stop().await
    }

    /// Stop and signal the conversation loop to end.
    pub async fn terminate(&self) {
        self.inner.terminate().await
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    pub fn is_termination_phrase(&self, text: &str) -> bool {
        is_termination_phrase(text)
    }

    /// Typed or spoken command outside the recognizer path. Termination phrases end the
    /// conversation in any state; returns true when the phrase was one. A stop-speaking
    /// phrase only stops the current turn.
    pub async fn handle_command_phrase(&self, text: &str) -> bool {
        if is_termination_phrase(text) {
            info!("termination phrase {:?}", text.trim());
            self.terminate().await;
            true
        } else {
            if is_stop_speaking_phrase(text) {
                self.stop().await;
            }
            false
        }
    }

    /// A transcript arrived from outside the capture task. Termination and stop-speaking
    /// phrases act in any state; anything else is only taken while Listening/Transcribing.
    pub async fn handle_transcript_ready(&self, text: &str) -> bool {
        if is_termination_phrase(text) {
            info!("termination phrase {:?} while {}", text.trim(), self.state());
            self.terminate().await;
            return true;
        }
        if is_stop_speaking_phrase(text) {
            info!("stop-speaking phrase {:?} while {}", text.trim(), self.state());
            return self.stop().await;
        }
        let text = text.to_string();
        self.inner
            .take_over(
                &[TurnState::Listening, TurnState::Transcribing],
                Some(TurnState::Transcribing),
                move |inner, epoch| async move {
                    inner
                        .accept_transcript(epoch, Transcript::new(text, None))
                        .await
                },
            )
            .await
    }

    /// A reply arrived from outside the dialogue call (Thinking only).
    pub async fn handle_reply_ready(&self, text: &str) -> bool {
        let text = text.to_string();
        self.inner
            .take_over(&[TurnState::Thinking], None, move |inner, epoch| async move {
                inner.accept_reply(epoch, text).await
            })
            .await
    }

    /// Playback finished (Speaking only).
    pub async fn handle_playback_done(&self) -> bool {
        self.inner
            .take_over(&[TurnState::Speaking], None, |inner, epoch| async move {
                inner.advance(epoch, TurnState::Idle).await;
            })
            .await
    }

    /// A collaborator reported an unrecoverable failure for the current turn.
    pub async fn handle_error(&self, kind: FailureKind) -> bool {
        self.inner
            .take_over(
                &[
                    TurnState::Activating,
                    TurnState::Listening,
                    TurnState::Transcribing,
                    TurnState::Thinking,
                    TurnState::Speaking,
                ],
                None,
                move |inner, epoch| async move {
                    inner.fail(epoch, kind, "reported by collaborator").await
                },
            )
            .await
    }

    /// Continue a stored conversation. Only while Idle.
    pub async fn resume_session(&self, session_id: &str) -> VoiceResult<()> {
        let inner = &self.inner;
        let mut cell = inner.cell.lock().await;
        if cell.state != TurnState::Idle {
            return Err(VoiceError::Config(format!(
                "cannot resume a session while {}",
                cell.state
            )));
        }
        let store = Arc::clone(&inner.collab.store);
        let id = session_id.to_string();
        let session = tokio::task::spawn_blocking(move || store.get_session(&id))
            .await
            .map_err(StoreError::from)??;
        let settings = inner.settings.read().await.clone();
        let dialogue = DialogueSession::resume(
            &session,
            settings.prompt.clone(),
            settings.max_history,
            inner.completion_options(&settings),
            Arc::clone(&inner.collab.backend),
        );
        info!(
            "resuming session {} ({} messages)",
            session.id,
            session.messages.len()
        );
        cell.event_session = session.id.clone();
        cell.dialogue = Some(dialogue);
        cell.settings = settings;
        Ok(())
    }

    /// Speak a greeting or farewell outside any turn. No state change, no message event.
    pub async fn announce(&self, text: &str) -> VoiceResult<()> {
        let voice = {
            let cell = self.inner.cell.lock().await;
            cell.settings.voice_for(Some(cell.language.as_str())).to_string()
        };
        self.inner.speak(text, &voice).await
    }

    /// Language of the most recent transcript (or the configured default).
    pub async fn language(&self) -> String {
        self.inner.cell.lock().await.language.clone()
    }
}

impl Inner {
    fn completion_options(&self, settings: &Settings) -> CompletionOptions {
        CompletionOptions {
            model: settings.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    async fn create_dialogue(&self, settings: &Settings) -> Result<DialogueSession, StoreError> {
        let store = Arc::clone(&self.collab.store);
        let id = tokio::task::spawn_blocking(move || store.create_session()).await??;
        Ok(DialogueSession::new(
            id,
            settings.prompt.clone(),
            settings.max_history,
            self.completion_options(settings),
            Arc::clone(&self.collab.backend),
        ))
    }

    /// Apply one edge. Caller holds the cell lock.
    fn transition(&self, cell: &mut TurnCell, to: TurnState, payload: Option<EventPayload>) -> bool {
        let from = cell.state;
        if !from.can_transition_to(to) {
            warn!("illegal turn transition {} -> {} ignored", from, to);
            return false;
        }
        cell.state = to;
        self.state_tx.send_replace(to);
        let payload = payload.unwrap_or_else(|| EventPayload::status(to));
        self.collab.events.publish(&cell.event_session, payload);
        debug!("turn {} -> {}", from, to);
        true
    }

    /// Transition only if `epoch` is still the live turn.
    async fn advance(&self, epoch: u64, to: TurnState) -> bool {
        let mut cell = self.cell.lock().await;
        if cell.epoch != epoch {
            debug!("stale turn result ignored ({} -> {})", cell.state, to);
            return false;
        }
        self.transition(&mut cell, to, None)
    }

    async fn stop(&self) -> bool {
        let mut cell = self.cell.lock().await;
        // Idle: the devices belong to announce() and the wake scan.
        if cell.state == TurnState::Idle {
            return false;
        }
        if let Some(task) = cell.task.take() {
            task.abort();
        }
        self.collab.player.stop();
        self.collab.capture.stop_capture();
        cell.epoch += 1;
        info!("turn stopped while {}", cell.state);
        self.transition(&mut cell, TurnState::Idle, None)
    }

    async fn terminate(&self) {
        // Signal first: stop() may abort the task this runs on.
        self.shutdown_tx.send_replace(true);
        self.stop().await;
        info!("conversation terminated");
    }

    /// Replace the running task with `next`, optionally moving to `enter` first.
    async fn take_over<F, Fut>(
        self: &Arc<Self>,
        expected: &[TurnState],
        enter: Option<TurnState>,
        next: F,
    ) -> bool
    where
        F: FnOnce(Arc<Inner>, u64) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut cell = self.cell.lock().await;
        if !expected.contains(&cell.state) {
            debug!("event ignored while {}", cell.state);
            return false;
        }
        if let Some(task) = cell.task.take() {
            task.abort();
        }
        self.collab.capture.stop_capture();
        if let Some(state) = enter {
            if cell.state != state {
                self.transition(&mut cell, state, None);
            }
        }
        let epoch = cell.epoch;
        cell.task = Some(tokio::spawn(next(Arc::clone(self), epoch)));
        true
    }

    async fn listen_phase(self: Arc<Self>, epoch: u64) {
        if !self.advance(epoch, TurnState::Listening).await {
            return;
        }
        let audio = match self
            .collab
            .capture
            .record_until_silence(self.config.capture_timeout)
            .await
        {
            Ok(audio) => audio,
            Err(e) => return self.fail(epoch, FailureKind::CaptureError, e.to_string()).await,
        };
        self.transcribe_phase(epoch, audio).await
    }

    async fn transcribe_phase(self: Arc<Self>, epoch: u64, audio: AudioBuffer) {
        if !self.advance(epoch, TurnState::Transcribing).await {
            return;
        }
        if audio.is_empty() {
            info!("no speech captured");
            return self.accept_transcript(epoch, Transcript::default()).await;
        }
        let hint = {
            let cell = self.cell.lock().await;
            cell.settings.language_hint().map(str::to_string)
        };
        let mut attempt = 0;
        let transcript = loop {
            attempt += 1;
            match self.collab.recognizer.transcribe(&audio, hint.as_deref()).await {
                Ok(t) => break t,
                Err(e) if attempt < 2 => warn!("recognition failed, retrying: {}", e),
                Err(e) => {
                    return self
                        .fail(epoch, FailureKind::RecognitionError, e.to_string())
                        .await
                }
            }
        };
        self.accept_transcript(epoch, transcript).await
    }

    async fn accept_transcript(self: Arc<Self>, epoch: u64, transcript: Transcript) {
        let text = transcript.text.trim().to_string();
        if text.is_empty() {
            self.advance(epoch, TurnState::Idle).await;
            return;
        }
        {
            let mut cell = self.cell.lock().await;
            if cell.epoch != epoch {
                return;
            }
            if let Some(lang) = transcript.language.filter(|l| !l.is_empty()) {
                cell.language = lang;
            }
        }
        info!("user said: {}", text);
        if is_termination_phrase(&text) {
            info!("termination phrase heard");
            return self.terminate().await;
        }
        if is_stop_speaking_phrase(&text) {
            info!("stop-speaking phrase heard");
            self.collab.player.stop();
            self.advance(epoch, TurnState::Idle).await;
            return;
        }
        if !self.advance(epoch, TurnState::Thinking).await {
            return;
        }
        match self.record_message(epoch, Message::user(&text)).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => return self.fail(epoch, FailureKind::PersistenceError, e.to_string()).await,
        }
        self.think_phase(epoch).await
    }

    async fn think_phase(self: Arc<Self>, epoch: u64) {
        let dialogue = {
            let cell = self.cell.lock().await;
            if cell.epoch != epoch {
                return;
            }
            match cell.dialogue.clone() {
                Some(d) => d,
                None => {
                    drop(cell);
                    return self
                        .fail(epoch, FailureKind::DialogueError, "no active session")
                        .await;
                }
            }
        };
        let reply = match dialogue.reply_to_history().await {
            Ok(reply) => reply,
            Err(e) if e.is_rate_limited() => {
                warn!("dialogue rate limited, retrying in {:?}", self.config.rate_limit_backoff);
                tokio::time::sleep(self.config.rate_limit_backoff).await;
                match dialogue.reply_to_history().await {
                    Ok(reply) => reply,
                    Err(e) => {
                        return self.fail(epoch, FailureKind::DialogueError, e.to_string()).await
                    }
                }
            }
            Err(e) => return self.fail(epoch, FailureKind::DialogueError, e.to_string()).await,
        };
        self.accept_reply(epoch, reply).await
    }

    async fn accept_reply(self: Arc<Self>, epoch: u64, reply: String) {
        match self.record_message(epoch, Message::assistant(&reply)).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => return self.fail(epoch, FailureKind::PersistenceError, e.to_string()).await,
        }
        if !self.advance(epoch, TurnState::Speaking).await {
            return;
        }
        self.speak_phase(epoch, reply).await
    }

    async fn speak_phase(self: Arc<Self>, epoch: u64, reply: String) {
        let voice = {
            let cell = self.cell.lock().await;
            cell.settings.voice_for(Some(cell.language.as_str())).to_string()
        };
        if let Err(first) = self.speak(&reply, &voice).await {
            warn!("speaking failed, retrying: {}", first);
            if let Err(e) = self.speak(&reply, &voice).await {
                return self.fail(epoch, FailureKind::SynthesisError, e.to_string()).await;
            }
        }
        self.advance(epoch, TurnState::Idle).await;
    }

    async fn speak(&self, text: &str, voice: &str) -> VoiceResult<()> {
        let audio = self.collab.synthesizer.synthesize(text, voice).await?;
        self.collab.player.play(audio).await
    }

    /// Persist, remember and publish one message, unless the turn was abandoned.
    /// The store write runs without the cell lock so `stop()` never waits on it.
    async fn record_message(&self, epoch: u64, message: Message) -> Result<bool, StoreError> {
        let session_id = {
            let cell = self.cell.lock().await;
            if cell.epoch != epoch {
                return Ok(false);
            }
            cell.dialogue
                .as_ref()
                .map(|d| d.session_id().to_string())
                .ok_or_else(|| StoreError::Persistence("no active session".to_string()))?
        };
        let store = Arc::clone(&self.collab.store);
        let stored = message.clone();
        tokio::task::spawn_blocking(move || store.append_message(&session_id, &stored)).await??;

        let mut cell = self.cell.lock().await;
        if cell.epoch != epoch {
            debug!("turn abandoned during store write, {:?} message not published", message.role);
            return Ok(false);
        }
        self.collab
            .events
            .publish(&cell.event_session, EventPayload::message(&message));
        if let Some(dialogue) = cell.dialogue.as_mut() {
            dialogue.append(message);
        }
        Ok(true)
    }

    /// Report a failed turn, apologise when the voice still works, and return to Idle.
    async fn fail(&self, epoch: u64, kind: FailureKind, detail: impl Into<String>) {
        let detail = detail.into();
        let voice_and_text = {
            let mut cell = self.cell.lock().await;
            if cell.epoch != epoch {
                return;
            }
            self.transition(
                &mut cell,
                TurnState::Error,
                Some(EventPayload::failure(kind, detail.clone())),
            );
            (
                cell.settings.voice_for(Some(cell.language.as_str())).to_string(),
                apology_for(&cell.language),
            )
        };
        error!("turn failed ({}): {}", kind, detail);
        if kind != FailureKind::SynthesisError {
            let (voice, apology) = voice_and_text;
            if let Err(e) = self.speak(apology, &voice).await {
                warn!("apology could not be spoken: {}", e);
            }
        }
        self.advance(epoch, TurnState::Idle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_termination_phrases() {
        for phrase in ["stop", "Exit.", "QUIT!", "Goodbye", "bye", "Arrête !", "au revoir"] {
            assert!(is_termination_phrase(phrase), "{phrase}");
        }
        assert!(!is_termination_phrase("stop the music"));
        assert!(!is_termination_phrase("hello"));
        assert!(!is_termination_phrase(""));
    }

    #[test]
    fn stop_speaking_phrases_do_not_terminate() {
        for phrase in ["Tais-toi !", "shut up", "Shut up."] {
            assert!(is_stop_speaking_phrase(phrase), "{phrase}");
            assert!(!is_termination_phrase(phrase), "{phrase}");
        }
        assert!(!is_stop_speaking_phrase("stop"));
        assert!(!is_stop_speaking_phrase("shut up and dance"));
    }

    #[test]
    fn apology_follows_language() {
        assert_eq!(apology_for("fr"), APOLOGY_FR);
        assert_eq!(apology_for("en"), APOLOGY_EN);
        assert_eq!(apology_for("de"), APOLOGY_EN);
    }

    #[test]
    fn config_reads_nova_sections() {
        let config = OrchestratorConfig::from_config(&NovaConfig::default());
        assert_eq!(config.capture_timeout, Duration::from_secs(15));
        assert_eq!(config.rate_limit_backoff, Duration::from_millis(1000));
        assert_eq!(config.max_tokens, 500);
    }
}
