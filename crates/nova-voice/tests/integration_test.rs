//! Turn orchestration scenarios against fake collaborators.

use async_trait::async_trait;
use nova_core::{
    CompletionOptions, ConversationStore, DashboardEvent, DialogueBackend, DialogueError,
    EventBroadcaster, EventPayload, EventSubscription, FailureKind, MemoryConversationStore,
    Message, Role, Session, SessionSummary, Settings, StoreError, TurnState,
};
use nova_voice::{
    AudioBuffer, AudioCaptureDevice, AudioInput, AudioPlayer, Collaborators, MicrophoneLock,
    OrchestratorConfig, SpeechRecognizer, SpeechSynthesizer, Transcript, TurnOrchestrator,
    VoiceError, VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

// -----------------------------------------------------------------------------
// Fakes
// -----------------------------------------------------------------------------

struct FakeInput {
    samples: usize,
    delay: Duration,
}

#[async_trait]
impl AudioInput for FakeInput {
    async fn record(&self, _timeout: Duration) -> VoiceResult<AudioBuffer> {
        tokio::time::sleep(self.delay).await;
        Ok(AudioBuffer::new(vec![0.3; self.samples], 16000))
    }

    fn name(&self) -> String {
        "fake".into()
    }
}

#[derive(Default)]
struct FakeRecognizer {
    script: Mutex<VecDeque<Result<&'static str, &'static str>>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeRecognizer {
    fn new(script: Vec<Result<&'static str, &'static str>>) -> Arc<Self> {
        Self::slow(script, Duration::ZERO)
    }

    fn slow(script: Vec<Result<&'static str, &'static str>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn transcribe(&self, _audio: &AudioBuffer, _hint: Option<&str>) -> VoiceResult<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(""));
        match next {
            Ok(text) => Ok(Transcript::new(text, Some("en".into()))),
            Err(e) => Err(VoiceError::Stt(e.into())),
        }
    }
}

struct FakeBackend {
    script: Mutex<VecDeque<Result<&'static str, DialogueError>>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeBackend {
    fn new(script: Vec<Result<&'static str, DialogueError>>) -> Arc<Self> {
        Self::slow(script, Duration::ZERO)
    }

    fn slow(script: Vec<Result<&'static str, DialogueError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl DialogueBackend for FakeBackend {
    async fn complete(
        &self,
        _messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<String, DialogueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(DialogueError::Backend("script exhausted".into())));
        next.map(str::to_string)
    }
}

#[derive(Default)]
struct FakeSynth {
    failures: AtomicUsize,
    calls: AtomicUsize,
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize(&self, text: &str, _voice: &str) -> VoiceResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(text.to_string());
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VoiceError::Tts("voice engine down".into()));
        }
        Ok(vec![1, 2, 3])
    }
}

#[derive(Default)]
struct FakePlayer {
    duration: Duration,
    plays: AtomicUsize,
    stops: AtomicUsize,
    stopped: Notify,
}

#[async_trait]
impl AudioPlayer for FakePlayer {
    async fn play(&self, _audio: Vec<u8>) -> VoiceResult<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = self.stopped.notified() => {}
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.notify_waiters();
    }
}

/// Store whose appends always fail.
#[derive(Default)]
struct BrokenStore {
    inner: MemoryConversationStore,
}

impl ConversationStore for BrokenStore {
    fn create_session(&self) -> Result<String, StoreError> {
        self.inner.create_session()
    }

    fn append_message(&self, _session_id: &str, _message: &Message) -> Result<(), StoreError> {
        Err(StoreError::Persistence("disk full".into()))
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.inner.list_sessions()
    }

    fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.inner.get_session(session_id)
    }
}

/// Store whose appends block the calling thread before landing.
struct SlowStore {
    inner: MemoryConversationStore,
    delay: Duration,
}

impl ConversationStore for SlowStore {
    fn create_session(&self) -> Result<String, StoreError> {
        self.inner.create_session()
    }

    fn append_message(&self, session_id: &str, message: &Message) -> Result<(), StoreError> {
        std::thread::sleep(self.delay);
        self.inner.append_message(session_id, message)
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.inner.list_sessions()
    }

    fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.inner.get_session(session_id)
    }
}

struct Harness {
    orchestrator: TurnOrchestrator,
    store: Arc<dyn ConversationStore>,
    events: EventSubscription,
    recognizer: Arc<FakeRecognizer>,
    backend: Arc<FakeBackend>,
    synth: Arc<FakeSynth>,
    player: Arc<FakePlayer>,
}

struct Setup {
    input: Option<FakeInput>,
    recognizer: Arc<FakeRecognizer>,
    backend: Arc<FakeBackend>,
    synth: Arc<FakeSynth>,
    player: Arc<FakePlayer>,
    store: Arc<dyn ConversationStore>,
}

impl Setup {
    fn new(
        recognizer: Vec<Result<&'static str, &'static str>>,
        backend: Vec<Result<&'static str, DialogueError>>,
    ) -> Self {
        Self {
            input: Some(FakeInput {
                samples: 1600,
                delay: Duration::from_millis(5),
            }),
            recognizer: FakeRecognizer::new(recognizer),
            backend: FakeBackend::new(backend),
            synth: Arc::new(FakeSynth::default()),
            player: Arc::new(FakePlayer {
                duration: Duration::from_millis(5),
                ..Default::default()
            }),
            store: Arc::new(MemoryConversationStore::new()),
        }
    }

    fn build(self) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mic = MicrophoneLock::new();
        let capture = match self.input {
            Some(input) => AudioCaptureDevice::new(Arc::new(input), mic),
            None => AudioCaptureDevice::unavailable(mic),
        };
        let events = Arc::new(EventBroadcaster::default());
        let subscription = events.subscribe();
        let collab = Collaborators {
            capture,
            recognizer: self.recognizer.clone(),
            synthesizer: self.synth.clone(),
            player: self.player.clone(),
            backend: self.backend.clone(),
            store: Arc::clone(&self.store),
            events,
        };
        let config = OrchestratorConfig {
            capture_timeout: Duration::from_secs(5),
            rate_limit_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        Harness {
            orchestrator: TurnOrchestrator::new(collab, Settings::default(), config),
            store: self.store,
            events: subscription,
            recognizer: self.recognizer,
            backend: self.backend,
            synth: self.synth,
            player: self.player,
        }
    }
}

impl Harness {
    /// All events up to and including the next `Idle` status.
    async fn run_until_idle(&mut self) -> Vec<DashboardEvent> {
        let mut out = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("turn did not reach Idle")
                .expect("broadcaster closed");
            let idle = event.state() == Some(TurnState::Idle);
            out.push(event);
            if idle {
                return out;
            }
        }
    }

    async fn wait_for(&self, state: TurnState) {
        let mut rx = self.orchestrator.subscribe_state();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .expect("orchestrator dropped");
    }

    /// Nothing else is published for a while.
    async fn assert_quiet(&mut self, after: Duration) {
        tokio::time::sleep(after).await;
        if let Ok(event) = timeout(Duration::from_millis(50), self.events.recv()).await {
            panic!("unexpected event after stop: {:?}", event);
        }
    }

    async fn stored_messages(&self) -> Vec<(Role, String)> {
        let id = self.orchestrator.session_id().await.expect("session");
        self.store
            .get_session(&id)
            .unwrap()
            .messages
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect()
    }
}

fn states(events: &[DashboardEvent]) -> Vec<TurnState> {
    events.iter().filter_map(|e| e.state()).collect()
}

fn failure_kind(events: &[DashboardEvent]) -> Option<FailureKind> {
    events.iter().find_map(|e| match &e.payload {
        EventPayload::Status { error, .. } => *error,
        _ => None,
    })
}

use TurnState::*;

// -----------------------------------------------------------------------------
// Scenarios
// -----------------------------------------------------------------------------

#[tokio::test]
async fn full_turn_walks_every_state_and_persists_both_messages() {
    let mut h = Setup::new(vec![Ok("hello")], vec![Ok("hi there")]).build();
    assert!(h.orchestrator.submit_manual_trigger().await);

    let events = h.run_until_idle().await;
    assert_eq!(
        states(&events),
        vec![Activating, Listening, Transcribing, Thinking, Speaking, Idle]
    );
    assert_eq!(
        h.stored_messages().await,
        vec![
            (Role::User, "hello".to_string()),
            (Role::Assistant, "hi there".to_string())
        ]
    );
    let messages: Vec<_> = events.iter().filter(|e| e.kind() == "message").collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(h.player.plays.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.state(), Idle);
}

#[tokio::test]
async fn empty_transcript_returns_to_idle_without_dialogue() {
    let mut h = Setup::new(vec![Ok("   ")], vec![Ok("unused")]).build();
    assert!(h.orchestrator.activate().await);

    let events = h.run_until_idle().await;
    assert_eq!(states(&events), vec![Activating, Listening, Transcribing, Idle]);
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    assert!(h.stored_messages().await.is_empty());
}

#[tokio::test]
async fn rate_limited_twice_reports_dialogue_error() {
    let mut h = Setup::new(
        vec![Ok("hello")],
        vec![
            Err(DialogueError::RateLimited("slow down".into())),
            Err(DialogueError::RateLimited("still".into())),
        ],
    )
    .build();
    h.orchestrator.activate().await;

    let events = h.run_until_idle().await;
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        states(&events),
        vec![Activating, Listening, Transcribing, Thinking, Error, Idle]
    );
    assert_eq!(failure_kind(&events), Some(FailureKind::DialogueError));
    // Apology spoken; user message kept, no assistant message.
    assert_eq!(
        h.synth.texts.lock().unwrap().as_slice(),
        ["Sorry, something went wrong. Please try again."]
    );
    assert_eq!(h.stored_messages().await, vec![(Role::User, "hello".to_string())]);
}

#[tokio::test]
async fn rate_limit_recovers_on_retry() {
    let mut h = Setup::new(
        vec![Ok("hello")],
        vec![Err(DialogueError::RateLimited("once".into())), Ok("made it")],
    )
    .build();
    h.orchestrator.activate().await;
    let events = h.run_until_idle().await;
    assert_eq!(states(&events).last(), Some(&Idle));
    assert!(!states(&events).contains(&Error));
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn other_dialogue_errors_are_not_retried() {
    let mut h = Setup::new(vec![Ok("hello")], vec![Err(DialogueError::Timeout)]).build();
    h.orchestrator.activate().await;
    let events = h.run_until_idle().await;
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
    assert_eq!(failure_kind(&events), Some(FailureKind::DialogueError));
}

#[tokio::test]
async fn stop_phrase_while_speaking_goes_idle_and_terminates() {
    let mut setup = Setup::new(vec![Ok("tell me a story")], vec![Ok("once upon a time")]);
    setup.player = Arc::new(FakePlayer {
        duration: Duration::from_secs(30),
        ..Default::default()
    });
    let mut h = setup.build();
    h.orchestrator.activate().await;
    h.wait_for(Speaking).await;

    assert!(h.orchestrator.handle_command_phrase("stop").await);
    assert_eq!(h.orchestrator.state(), Idle);
    assert!(h.orchestrator.is_terminated());

    let events = h.run_until_idle().await;
    assert_eq!(states(&events).last(), Some(&Idle));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        timeout(Duration::from_millis(50), h.events.recv()).await.is_err(),
        "nothing published after stop"
    );
    assert!(!h.orchestrator.activate().await, "terminated conversation stays down");
}

#[tokio::test]
async fn stop_discards_late_dialogue_reply() {
    let mut setup = Setup::new(vec![Ok("hello")], vec![]);
    setup.backend = FakeBackend::slow(vec![Ok("too late")], Duration::from_millis(200));
    let mut h = setup.build();
    h.orchestrator.activate().await;
    h.wait_for(Thinking).await;

    assert!(h.orchestrator.stop().await);
    assert!(!h.orchestrator.stop().await, "stop is idempotent");
    let events = h.run_until_idle().await;
    assert_eq!(states(&events).last(), Some(&Idle));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.stored_messages().await, vec![(Role::User, "hello".to_string())]);
    assert_eq!(h.orchestrator.state(), Idle);
    assert!(!h.orchestrator.is_terminated());
}

#[tokio::test]
async fn activation_is_ignored_mid_turn() {
    let mut setup = Setup::new(vec![Ok("hello")], vec![Ok("hi")]);
    setup.input = Some(FakeInput {
        samples: 1600,
        delay: Duration::from_millis(100),
    });
    let mut h = setup.build();
    assert!(h.orchestrator.activate().await);
    assert!(!h.orchestrator.activate().await);
    assert!(!h.orchestrator.submit_manual_trigger().await);

    let events = h.run_until_idle().await;
    assert_eq!(states(&events).iter().filter(|s| **s == Activating).count(), 1);
    assert!(h.orchestrator.activate().await, "Idle again accepts a trigger");
}

#[tokio::test]
async fn sequences_increase_by_one_per_session() {
    let mut h = Setup::new(vec![Ok("one"), Ok("two")], vec![Ok("a"), Ok("b")]).build();
    h.orchestrator.activate().await;
    let mut events = h.run_until_idle().await;
    h.orchestrator.activate().await;
    events.extend(h.run_until_idle().await);

    let session = h.orchestrator.session_id().await.unwrap();
    assert!(events.iter().all(|e| e.session_id == session));
    for pair in events.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
    assert_eq!(h.stored_messages().await.len(), 4);
}

#[tokio::test]
async fn missing_microphone_is_a_capture_error() {
    let mut setup = Setup::new(vec![Ok("hello")], vec![Ok("hi")]);
    setup.input = None;
    let mut h = setup.build();
    h.orchestrator.activate().await;

    let events = h.run_until_idle().await;
    assert_eq!(states(&events), vec![Activating, Listening, Error, Idle]);
    assert_eq!(failure_kind(&events), Some(FailureKind::CaptureError));
    assert_eq!(h.recognizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn recognition_is_retried_once() {
    let mut h = Setup::new(vec![Err("garbled"), Ok("hello")], vec![Ok("hi")]).build();
    h.orchestrator.activate().await;
    let events = h.run_until_idle().await;
    assert!(!states(&events).contains(&Error));
    assert_eq!(h.recognizer.calls.load(Ordering::SeqCst), 2);

    let mut h = Setup::new(vec![Err("garbled"), Err("again")], vec![Ok("hi")]).build();
    h.orchestrator.activate().await;
    let events = h.run_until_idle().await;
    assert_eq!(failure_kind(&events), Some(FailureKind::RecognitionError));
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn synthesis_failing_twice_skips_the_apology() {
    let setup = Setup::new(vec![Ok("hello")], vec![Ok("hi")]);
    setup.synth.failures.store(2, Ordering::SeqCst);
    let mut h = setup.build();
    h.orchestrator.activate().await;

    let events = h.run_until_idle().await;
    assert_eq!(failure_kind(&events), Some(FailureKind::SynthesisError));
    assert_eq!(h.synth.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.player.plays.load(Ordering::SeqCst), 0);
    assert_eq!(h.stored_messages().await.len(), 2);
}

#[tokio::test]
async fn persistence_failure_ends_the_turn_before_dialogue() {
    let mut setup = Setup::new(vec![Ok("hello")], vec![Ok("hi")]);
    setup.store = Arc::new(BrokenStore::default());
    let mut h = setup.build();
    h.orchestrator.activate().await;

    let events = h.run_until_idle().await;
    assert_eq!(failure_kind(&events), Some(FailureKind::PersistenceError));
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn spoken_termination_phrase_ends_the_conversation() {
    let mut h = Setup::new(vec![Ok("Goodbye!")], vec![Ok("unused")]).build();
    let mut shutdown = h.orchestrator.shutdown_signal();
    h.orchestrator.activate().await;

    let events = h.run_until_idle().await;
    assert_eq!(states(&events), vec![Activating, Listening, Transcribing, Idle]);
    timeout(Duration::from_secs(1), shutdown.wait_for(|done| *done))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn injected_transcript_takes_over_listening() {
    let mut setup = Setup::new(vec![], vec![Ok("hi")]);
    setup.input = Some(FakeInput {
        samples: 1600,
        delay: Duration::from_secs(30),
    });
    let mut h = setup.build();
    h.orchestrator.activate().await;
    h.wait_for(Listening).await;

    assert!(!h.orchestrator.handle_reply_ready("early").await);
    assert!(h.orchestrator.handle_transcript_ready("hello").await);
    let events = h.run_until_idle().await;
    assert_eq!(
        states(&events),
        vec![Activating, Listening, Transcribing, Thinking, Speaking, Idle]
    );
    assert_eq!(h.recognizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reported_error_fails_the_turn() {
    let mut setup = Setup::new(vec![Ok("hello")], vec![Ok("hi")]);
    setup.input = Some(FakeInput {
        samples: 1600,
        delay: Duration::from_secs(30),
    });
    let mut h = setup.build();
    assert!(!h.orchestrator.handle_error(FailureKind::CaptureError).await);
    h.orchestrator.activate().await;
    h.wait_for(Listening).await;

    assert!(h.orchestrator.handle_error(FailureKind::CaptureError).await);
    let events = h.run_until_idle().await;
    assert_eq!(failure_kind(&events), Some(FailureKind::CaptureError));
    assert_eq!(states(&events), vec![Activating, Listening, Error, Idle]);
}

#[tokio::test]
async fn resumed_session_keeps_history_and_event_stream() {
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());
    let id = store.create_session().unwrap();
    store.append_message(&id, &Message::user("earlier")).unwrap();

    let mut setup = Setup::new(vec![Ok("again")], vec![Ok("welcome back")]);
    setup.store = Arc::clone(&store);
    let mut h = setup.build();
    tokio_test::assert_ok!(h.orchestrator.resume_session(&id).await);
    tokio_test::assert_err!(h.orchestrator.resume_session("missing").await);

    h.orchestrator.activate().await;
    let events = h.run_until_idle().await;
    assert!(events.iter().all(|e| e.session_id == id));
    assert_eq!(h.stored_messages().await.len(), 3);
}

#[tokio::test]
async fn spoken_stop_while_speaking_goes_idle_and_terminates() {
    let mut setup = Setup::new(vec![Ok("tell me a story")], vec![Ok("once upon a time")]);
    setup.player = Arc::new(FakePlayer {
        duration: Duration::from_secs(30),
        ..Default::default()
    });
    let mut h = setup.build();
    h.orchestrator.activate().await;
    h.wait_for(Speaking).await;

    assert!(h.orchestrator.handle_transcript_ready("Stop!").await);
    assert_eq!(h.orchestrator.state(), Idle);
    assert!(h.orchestrator.is_terminated());
    assert!(h.player.stops.load(Ordering::SeqCst) >= 1);

    let events = h.run_until_idle().await;
    assert_eq!(states(&events).last(), Some(&Idle));
    h.assert_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn spoken_exit_while_thinking_drops_the_reply() {
    let mut setup = Setup::new(vec![Ok("hello")], vec![]);
    setup.backend = FakeBackend::slow(vec![Ok("too late")], Duration::from_millis(200));
    let mut h = setup.build();
    h.orchestrator.activate().await;
    h.wait_for(Thinking).await;

    assert!(h.orchestrator.handle_transcript_ready("exit").await);
    assert_eq!(h.orchestrator.state(), Idle);
    assert!(h.orchestrator.is_terminated());

    h.run_until_idle().await;
    h.assert_quiet(Duration::from_millis(300)).await;
    assert_eq!(h.stored_messages().await, vec![(Role::User, "hello".to_string())]);
}

#[tokio::test]
async fn shut_up_silences_the_reply_but_keeps_the_conversation() {
    let mut setup = Setup::new(vec![Ok("tell me a story"), Ok("hello")], vec![Ok("once"), Ok("hi")]);
    setup.player = Arc::new(FakePlayer {
        duration: Duration::from_millis(500),
        ..Default::default()
    });
    let mut h = setup.build();
    h.orchestrator.activate().await;
    h.wait_for(Speaking).await;

    assert!(h.orchestrator.handle_transcript_ready("Shut up.").await);
    assert_eq!(h.orchestrator.state(), Idle);
    assert!(!h.orchestrator.is_terminated());
    assert!(h.player.stops.load(Ordering::SeqCst) >= 1);
    h.run_until_idle().await;

    assert!(h.orchestrator.activate().await, "next turn still accepted");
    h.run_until_idle().await;
    assert_eq!(h.stored_messages().await.len(), 4);
}

#[tokio::test]
async fn spoken_tais_toi_ends_the_turn_without_dialogue() {
    let mut h = Setup::new(vec![Ok("Tais-toi !")], vec![Ok("unused")]).build();
    h.orchestrator.activate().await;

    let events = h.run_until_idle().await;
    assert_eq!(states(&events), vec![Activating, Listening, Transcribing, Idle]);
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    assert!(h.stored_messages().await.is_empty());
    assert!(!h.orchestrator.is_terminated());
}

#[tokio::test]
async fn stop_does_not_wait_for_a_slow_store_write() {
    let mut setup = Setup::new(vec![Ok("hello")], vec![Ok("hi")]);
    setup.store = Arc::new(SlowStore {
        inner: MemoryConversationStore::new(),
        delay: Duration::from_millis(800),
    });
    let mut h = setup.build();
    h.orchestrator.activate().await;
    h.wait_for(Thinking).await;
    // Let the user message reach the store.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert!(h.orchestrator.stop().await);
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "stop waited {:?} on the store",
        started.elapsed()
    );
    assert!(timeout(Duration::from_millis(100), h.orchestrator.session_id())
        .await
        .is_ok());

    let events = h.run_until_idle().await;
    assert!(events.iter().all(|e| e.kind() != "message"));
    h.assert_quiet(Duration::from_millis(900)).await;
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stop_from_any_active_state_returns_to_idle_and_drops_late_results() {
    for from in [Activating, Listening, Transcribing, Error] {
        let mut setup = Setup::new(vec![Ok("hello")], vec![Ok("hi")]);
        match from {
            Listening => {
                setup.input = Some(FakeInput {
                    samples: 1600,
                    delay: Duration::from_millis(300),
                })
            }
            Transcribing => {
                setup.recognizer = FakeRecognizer::slow(vec![Ok("hello")], Duration::from_millis(300))
            }
            Error => {
                setup.recognizer = FakeRecognizer::new(vec![Err("garbled"), Err("again")]);
                setup.player = Arc::new(FakePlayer {
                    duration: Duration::from_secs(30),
                    ..Default::default()
                });
            }
            _ => {}
        }
        let mut h = setup.build();
        assert!(h.orchestrator.activate().await);
        if from == Activating {
            // The turn task has not been polled yet on this runtime.
            assert_eq!(h.orchestrator.state(), Activating);
        } else {
            h.wait_for(from).await;
        }

        assert!(h.orchestrator.stop().await, "stop from {}", from);
        assert_eq!(h.orchestrator.state(), Idle, "stop from {}", from);
        let events = h.run_until_idle().await;
        assert_eq!(states(&events).last(), Some(&Idle));

        h.assert_quiet(Duration::from_millis(400)).await;
        assert_eq!(h.orchestrator.state(), Idle, "late result moved the turn from {}", from);
        assert!(h.stored_messages().await.is_empty(), "late transcript stored ({})", from);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0, "dialogue called ({})", from);
    }
}

#[tokio::test]
async fn stop_while_idle_leaves_announcements_playing() {
    let mut setup = Setup::new(vec![], vec![]);
    setup.player = Arc::new(FakePlayer {
        duration: Duration::from_millis(200),
        ..Default::default()
    });
    let h = setup.build();
    let orchestrator = h.orchestrator.clone();
    let started = Instant::now();
    let greeting = tokio::spawn(async move { orchestrator.announce("Hello!").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!h.orchestrator.stop().await);
    greeting.await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(190));
    assert_eq!(h.player.stops.load(Ordering::SeqCst), 0);
}
