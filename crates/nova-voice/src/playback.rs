//! Speaker output for synthesized replies.
//!
//! `play` resolves once the audio has finished (or was cut off by `stop`), so the
//! orchestrator can leave the Speaking state exactly when the speaker falls silent.

use crate::error::VoiceResult;
use async_trait::async_trait;

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Play encoded audio (MP3/WAV) to completion. Empty input is a no-op.
    async fn play(&self, audio: Vec<u8>) -> VoiceResult<()>;

    /// Cut playback off immediately and clear anything queued.
    fn stop(&self);
}

/// Discards audio. Used when no output device is available and in tests.
#[derive(Debug, Default)]
pub struct SilentPlayer;

#[async_trait]
impl AudioPlayer for SilentPlayer {
    async fn play(&self, _audio: Vec<u8>) -> VoiceResult<()> {
        Ok(())
    }

    fn stop(&self) {}
}

#[cfg(feature = "hardware")]
mod speaker {
    use super::*;
    use crate::error::VoiceError;
    use rodio::{OutputStream, Sink, Source};
    use std::io::Cursor;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use tracing::{debug, info};

    /// rodio sink on the default output device.
    ///
    /// `OutputStream` is `!Send`, so it lives on a dedicated thread for as long as the
    /// `SpeakerOutput` does; only the `Sink` is shared.
    pub struct SpeakerOutput {
        sink: Arc<Sink>,
        _keepalive: mpsc::Sender<()>,
    }

    impl SpeakerOutput {
        pub fn new() -> VoiceResult<Self> {
            let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<Arc<Sink>>>();
            let (keep_tx, keep_rx) = mpsc::channel::<()>();
            thread::Builder::new()
                .name("nova-speaker".to_string())
                .spawn(move || {
                    let opened = OutputStream::try_default()
                        .map_err(|e| VoiceError::Playback(e.to_string()))
                        .and_then(|(stream, handle)| {
                            Sink::try_new(&handle)
                                .map(|sink| (stream, handle, Arc::new(sink)))
                                .map_err(|e| VoiceError::Playback(e.to_string()))
                        });
                    match opened {
                        Ok((_stream, _handle, sink)) => {
                            let _ = ready_tx.send(Ok(sink));
                            // Returns when the SpeakerOutput (the only sender) is dropped.
                            let _ = keep_rx.recv();
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })?;
            let sink = ready_rx
                .recv()
                .map_err(|_| VoiceError::Playback("speaker thread exited".to_string()))??;
            info!("speaker ready for TTS playback");
            Ok(Self {
                sink,
                _keepalive: keep_tx,
            })
        }

        pub fn is_playing(&self) -> bool {
            !self.sink.empty()
        }
    }

    #[async_trait]
    impl AudioPlayer for SpeakerOutput {
        async fn play(&self, audio: Vec<u8>) -> VoiceResult<()> {
            if audio.is_empty() {
                return Ok(());
            }
            let source = rodio::Decoder::new(Cursor::new(audio))
                .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
            self.sink.append(source.convert_samples::<f32>());
            let sink = Arc::clone(&self.sink);
            tokio::task::spawn_blocking(move || sink.sleep_until_end())
                .await
                .map_err(|e| VoiceError::Playback(e.to_string()))?;
            debug!("playback finished");
            Ok(())
        }

        fn stop(&self) {
            self.sink.stop();
            info!("playback stopped");
        }
    }
}

#[cfg(feature = "hardware")]
pub use speaker::SpeakerOutput;
