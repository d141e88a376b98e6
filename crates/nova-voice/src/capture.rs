//! Audio capture façade.
//!
//! `AudioCaptureDevice` pairs an input backend with the shared [`MicrophoneLock`]
//! so an active turn's recording never overlaps background wake-word scanning.

use crate::error::{VoiceError, VoiceResult};
use crate::mic::MicrophoneLock;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Mono f32 PCM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn empty(sample_rate: u32) -> Self {
        Self::new(Vec::new(), sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// 16-bit PCM WAV, the upload format of the transcription APIs.
    pub fn to_wav(&self) -> VoiceResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| VoiceError::Stt(format!("WAV encode failed: {}", e)))?;
            for &s in &self.samples {
                let sample = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                writer
                    .write_sample(sample)
                    .map_err(|e| VoiceError::Stt(format!("WAV encode failed: {}", e)))?;
            }
            writer
                .finalize()
                .map_err(|e| VoiceError::Stt(format!("WAV encode failed: {}", e)))?;
        }
        Ok(cursor.into_inner())
    }
}

/// A source of recorded utterances.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Record until the speaker falls silent or `timeout` elapses. Silence only yields an empty buffer.
    async fn record(&self, timeout: Duration) -> VoiceResult<AudioBuffer>;

    /// Abort an in-progress recording; the pending `record` returns what it has.
    fn stop(&self) {}

    fn name(&self) -> String;
}

#[derive(Clone)]
pub struct AudioCaptureDevice {
    input: Option<Arc<dyn AudioInput>>,
    mic: MicrophoneLock,
}

impl AudioCaptureDevice {
    pub fn new(input: Arc<dyn AudioInput>, mic: MicrophoneLock) -> Self {
        Self {
            input: Some(input),
            mic,
        }
    }

    /// A device with no input attached; every recording fails with a capture error.
    pub fn unavailable(mic: MicrophoneLock) -> Self {
        Self { input: None, mic }
    }

    pub fn microphone(&self) -> &MicrophoneLock {
        &self.mic
    }

    pub fn input(&self) -> Option<Arc<dyn AudioInput>> {
        self.input.clone()
    }

    pub fn is_available(&self) -> bool {
        self.input.is_some()
    }

    /// Take the microphone (pre-empting background scanning) and record one utterance.
    pub async fn record_until_silence(&self, timeout: Duration) -> VoiceResult<AudioBuffer> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
        let _guard = self.mic.acquire_capture().await;
        info!("recording from {} (timeout {:?})", input.name(), timeout);
        let audio = input.record(timeout).await?;
        debug!("recorded {:?} of audio", audio.duration());
        Ok(audio)
    }

    pub fn stop_capture(&self) {
        if let Some(input) = &self.input {
            input.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mic::MicHolder;

    struct Fixed;

    #[async_trait]
    impl AudioInput for Fixed {
        async fn record(&self, _timeout: Duration) -> VoiceResult<AudioBuffer> {
            Ok(AudioBuffer::new(vec![0.25; 1600], 16000))
        }

        fn name(&self) -> String {
            "fixed".into()
        }
    }

    #[tokio::test]
    async fn missing_device_is_a_capture_error() {
        let device = AudioCaptureDevice::unavailable(MicrophoneLock::new());
        let err = device
            .record_until_silence(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::AudioDevice(_)), "{err}");
    }

    #[tokio::test]
    async fn recording_releases_the_microphone() {
        let mic = MicrophoneLock::new();
        let device = AudioCaptureDevice::new(Arc::new(Fixed), mic.clone());
        let audio = device.record_until_silence(Duration::from_secs(1)).await.unwrap();
        assert_eq!(audio.duration(), Duration::from_millis(100));
        assert_eq!(mic.holder(), None);
        assert!(mic.try_acquire_background().is_some());
    }

    #[tokio::test]
    async fn capture_holds_the_microphone_while_recording() {
        struct Probe(MicrophoneLock);

        #[async_trait]
        impl AudioInput for Probe {
            async fn record(&self, _timeout: Duration) -> VoiceResult<AudioBuffer> {
                assert_eq!(self.0.holder(), Some(MicHolder::Capture));
                assert!(self.0.try_acquire_background().is_none());
                Ok(AudioBuffer::empty(16000))
            }

            fn name(&self) -> String {
                "probe".into()
            }
        }

        let mic = MicrophoneLock::new();
        let device = AudioCaptureDevice::new(Arc::new(Probe(mic.clone())), mic);
        assert!(device
            .record_until_silence(Duration::from_secs(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn wav_has_riff_header() {
        let wav = AudioBuffer::new(vec![0.0, 0.5, -0.5], 16000).to_wav().unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 6);
    }
}
