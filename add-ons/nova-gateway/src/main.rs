//! Nova: voice assistant entry point.
//!
//! Loads configuration, wires the turn orchestrator to real (or placeholder) audio,
//! recognition, dialogue and synthesis, then runs the console conversation loop with the
//! dashboard API alongside when `--web` is given.

mod api;
mod cli;
mod live;

use anyhow::Context;
use clap::Parser;
use nova_core::{
    ChatCompletionsBackend, EventBroadcaster, LoggingConfig, NovaConfig, Settings,
};
use nova_voice::{
    create_recognizer, create_synthesizer, AudioCaptureDevice, AudioInput, AudioPlayer,
    Collaborators, MicrophoneLock, OrchestratorConfig, RecognizerFactory, ReloadingRecognizer,
    SpeechRecognizer, TranscribedPhraseEngine, TurnOrchestrator, WakeWordDetector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nova", version, about = "Nova voice assistant")]
struct Cli {
    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Configuration file (default: NOVA_CONFIG or config/nova.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Continue the most recent conversation
    #[arg(long = "continue")]
    continue_session: bool,

    /// Serve the dashboard API and live channel
    #[arg(long)]
    web: bool,

    /// Press Enter to talk; no wake word detection
    #[arg(long)]
    push_to_talk: bool,

    /// List synthesis voices and exit
    #[arg(long)]
    list_voices: bool,

    /// List audio input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Measure microphone level for a few seconds and exit
    #[arg(long)]
    test_mic: bool,
}

fn init_tracing(logging: &LoggingConfig, debug: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()))
    };

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "assistant.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

#[cfg(feature = "hardware")]
fn audio_devices(config: &NovaConfig) -> (Option<Arc<dyn AudioInput>>, Arc<dyn AudioPlayer>) {
    use nova_voice::{MicrophoneConfig, MicrophoneInput, SilentPlayer, SpeakerOutput};

    let input: Option<Arc<dyn AudioInput>> =
        match MicrophoneInput::new(MicrophoneConfig::from(&config.audio)) {
            Ok(mic) => Some(Arc::new(mic)),
            Err(e) => {
                warn!("microphone unavailable: {}", e);
                None
            }
        };
    let player: Arc<dyn AudioPlayer> = match SpeakerOutput::new() {
        Ok(speaker) => Arc::new(speaker),
        Err(e) => {
            warn!("speaker unavailable, replies will not be played: {}", e);
            Arc::new(SilentPlayer)
        }
    };
    (input, player)
}

#[cfg(not(feature = "hardware"))]
fn audio_devices(_config: &NovaConfig) -> (Option<Arc<dyn AudioInput>>, Arc<dyn AudioPlayer>) {
    warn!("built without the `hardware` feature: no microphone or speaker");
    (None, Arc::new(nova_voice::SilentPlayer))
}

async fn list_voices(config: &NovaConfig) -> anyhow::Result<()> {
    let voices = create_synthesizer(&config.tts).list_voices().await?;
    for voice in voices {
        println!("{:<24} {:<8} {}", voice.name, voice.locale, voice.gender);
    }
    Ok(())
}

#[cfg(feature = "hardware")]
fn list_devices() -> anyhow::Result<()> {
    for (i, name) in nova_voice::list_input_devices()?.iter().enumerate() {
        println!("{:>2}: {}", i, name);
    }
    Ok(())
}

#[cfg(not(feature = "hardware"))]
fn list_devices() -> anyhow::Result<()> {
    anyhow::bail!("audio devices need a build with `--features hardware`")
}

#[cfg(feature = "hardware")]
async fn test_mic(config: &NovaConfig) -> anyhow::Result<()> {
    use nova_voice::MicrophoneConfig;

    println!("Speak now, measuring for 3 seconds...");
    let level =
        nova_voice::test_microphone(MicrophoneConfig::from(&config.audio), Duration::from_secs(3))
            .await?;
    println!(
        "samples: {}  peak: {:.3}  rms: {:.4}",
        level.samples, level.peak, level.rms
    );
    if level.peak < 0.01 {
        println!("Very low level: check the input device and its volume.");
    }
    Ok(())
}

#[cfg(not(feature = "hardware"))]
async fn test_mic(_config: &NovaConfig) -> anyhow::Result<()> {
    anyhow::bail!("microphone test needs a build with `--features hardware`")
}

fn load_settings(config: &NovaConfig) -> Settings {
    let Some(path) = &config.settings_file else {
        return Settings::from_config(config);
    };
    match Settings::load_from_path(path) {
        Ok(Some(saved)) => {
            info!("settings loaded from {}", path.display());
            saved
        }
        Ok(None) => Settings::from_config(config),
        Err(e) => {
            warn!("ignoring settings file {}: {}", path.display(), e);
            Settings::from_config(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[nova] .env not loaded: {} (using system environment)", e);
    }
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => NovaConfig::load_from(path),
        None => NovaConfig::load(),
    }
    .context("loading configuration")?;
    let _log_guard = init_tracing(&config.logging, args.debug)?;

    if args.list_voices {
        return list_voices(&config).await;
    }
    if args.list_devices {
        return list_devices();
    }
    if args.test_mic {
        return test_mic(&config).await;
    }

    let store = nova_core::open_store(&config.conversation).context("opening conversation store")?;
    let events = Arc::new(EventBroadcaster::default());
    let backend = ChatCompletionsBackend::from_config(&config.llm)?;
    if !backend.has_api_key() {
        warn!("no LLM API key set (NOVA_LLM_API_KEY or OPENAI_API_KEY); replies will fail");
    }
    let settings = load_settings(&config).shared();
    let factory: RecognizerFactory = Arc::new(create_recognizer);
    let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(ReloadingRecognizer::new(
        config.whisper.clone(),
        Arc::clone(&settings),
        factory,
    )?);
    let synthesizer = create_synthesizer(&config.tts);
    let mic = MicrophoneLock::new();
    let (input, player) = audio_devices(&config);
    let capture = match &input {
        Some(input) => AudioCaptureDevice::new(Arc::clone(input), mic.clone()),
        None => AudioCaptureDevice::unavailable(mic.clone()),
    };

    let orchestrator = TurnOrchestrator::with_shared_settings(
        Collaborators {
            capture,
            recognizer: Arc::clone(&recognizer),
            synthesizer: Arc::clone(&synthesizer),
            player,
            backend: Arc::new(backend),
            store: Arc::clone(&store),
            events: Arc::clone(&events),
        },
        Arc::clone(&settings),
        OrchestratorConfig::from_config(&config),
    );

    if args.continue_session {
        match store.latest_session()? {
            Some(session) => {
                orchestrator.resume_session(&session.id).await?;
                println!(
                    "Continuing conversation {} ({} messages)",
                    session.id,
                    session.messages.len()
                );
            }
            None => println!("No previous conversation, starting a new one."),
        }
    }

    let web = if args.web {
        let app = api::build_app(api::AppState {
            orchestrator: orchestrator.clone(),
            store: Arc::clone(&store),
            events: Arc::clone(&events),
            synthesizer: Arc::clone(&synthesizer),
            settings: Arc::clone(&settings),
            settings_path: config.settings_file.clone(),
        });
        let addr = format!("{}:{}", config.web.host, config.web.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        println!("Dashboard API on http://{}", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("dashboard server stopped: {}", e);
            }
        }))
    } else {
        None
    };

    let wake_word = settings.read().await.wake_word.clone();
    let detector = match (&input, args.push_to_talk) {
        (Some(input), false) => {
            let engine = TranscribedPhraseEngine::new(Arc::clone(input), recognizer, &wake_word);
            let detector = WakeWordDetector::new(
                Arc::new(engine),
                mic.clone(),
                orchestrator.subscribe_state(),
                Duration::from_secs(config.audio.wake_window_secs),
            );
            detector.start_background_listening(cli::wake_activation(&orchestrator));
            println!("Listening for \"{}\"", wake_word);
            Some(detector)
        }
        (None, false) => {
            warn!("no microphone: wake word detection disabled");
            None
        }
        (_, true) => None,
    };

    let name = settings.read().await.name.clone();
    let echo = cli::spawn_console_echo(&events, name);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    cli::run_conversation(&orchestrator, stdin, args.push_to_talk || detector.is_none()).await;

    if let Some(detector) = detector {
        detector.stop_background_listening();
    }
    echo.abort();
    if let Some(web) = web {
        web.abort();
    }
    info!("nova stopped");
    Ok(())
}
