//! Microphone input via CPAL: WebRTC VAD frames into the utterance segmenter.
//!
//! Each `record` opens its own input stream on a blocking thread (cpal `Stream` is
//! `!Send` on some platforms) and closes it when the utterance ends.

use crate::capture::{AudioBuffer, AudioInput};
use crate::error::{VoiceError, VoiceResult};
use crate::segmenter::{SegmenterConfig, UtteranceSegmenter};
use crate::vad::{VadConfig, VadDetector};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use nova_core::AudioSettings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MicrophoneConfig {
    /// Output rate of recorded buffers; the device is resampled to it.
    pub sample_rate: u32,
    pub silence_threshold: Duration,
    pub min_speech: Duration,
    /// WebRTC VAD aggressiveness (0-3).
    pub vad_mode: u8,
    /// Input device by name; `None` for the host default.
    pub device_name: Option<String>,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            silence_threshold: Duration::from_millis(1500),
            min_speech: Duration::from_millis(200),
            vad_mode: 2,
            device_name: None,
        }
    }
}

impl From<&AudioSettings> for MicrophoneConfig {
    fn from(audio: &AudioSettings) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            silence_threshold: Duration::from_secs_f32(audio.silence_duration.max(0.0)),
            min_speech: Duration::from_millis(audio.min_speech_ms),
            ..Default::default()
        }
    }
}

pub struct MicrophoneInput {
    config: MicrophoneConfig,
    /// Bumped by `stop`; a recording ends when the value it started with changes.
    generation: Arc<AtomicU64>,
}

impl MicrophoneInput {
    pub fn new(config: MicrophoneConfig) -> VoiceResult<Self> {
        // Fail early on an unusable rate or a missing device.
        VadDetector::new(VadConfig {
            sample_rate: config.sample_rate,
            mode: config.vad_mode,
        })?;
        let device = find_device(config.device_name.as_deref())?;
        info!(
            "microphone: {} ({} Hz)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            config.sample_rate
        );
        Ok(Self {
            config,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }
}

fn find_device(name: Option<&str>) -> VoiceResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| VoiceError::AudioDevice(format!("Input device not found: {}", wanted))),
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string())),
    }
}

/// Downmix interleaved frames to mono and resample (nearest sample) to `to_rate`.
fn to_mono(samples: &[f32], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if channels == 0 || samples.is_empty() || from_rate == 0 {
        return Vec::new();
    }
    let mono: Vec<f32> = if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    if from_rate == to_rate {
        return mono;
    }
    let out_len = (mono.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    (0..out_len)
        .map(|i| (i as u64 * from_rate as u64 / to_rate as u64) as usize)
        .take_while(|&idx| idx < mono.len())
        .map(|idx| mono[idx])
        .collect()
}

/// Open an input stream that delivers mono f32 at `target_rate` over a channel.
fn open_stream(
    device: &cpal::Device,
    target_rate: u32,
    tx: mpsc::Sender<Vec<f32>>,
) -> VoiceResult<Stream> {
    let config = device.default_input_config()?;
    let from_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let stream_config: StreamConfig = config.clone().into();
    let on_error = |err: cpal::StreamError| warn!("audio stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(to_mono(data, channels, from_rate, target_rate));
            },
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let f: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                let _ = tx.send(to_mono(&f, channels, from_rate, target_rate));
            },
            on_error,
            None,
        )?,
        other => {
            return Err(VoiceError::AudioDevice(format!(
                "Unsupported sample format {:?} (need F32 or I16)",
                other
            )))
        }
    };
    stream.play()?;
    Ok(stream)
}

fn record_blocking(
    config: MicrophoneConfig,
    timeout: Duration,
    generation: Arc<AtomicU64>,
    started: u64,
) -> VoiceResult<AudioBuffer> {
    let device = find_device(config.device_name.as_deref())?;
    let mut vad = VadDetector::new(VadConfig {
        sample_rate: config.sample_rate,
        mode: config.vad_mode,
    })?;
    let mut segmenter = UtteranceSegmenter::new(SegmenterConfig {
        silence_threshold: config.silence_threshold,
        min_speech: config.min_speech,
        max_utterance: timeout,
        sample_rate: config.sample_rate,
    });
    let (tx, rx) = mpsc::channel();
    let _stream = open_stream(&device, config.sample_rate, tx)?;

    let chunk = vad.chunk_size();
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<f32> = Vec::with_capacity(chunk * 4);

    loop {
        if generation.load(Ordering::SeqCst) != started {
            debug!("recording stopped");
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("recording timed out after {:?}", timeout);
            break;
        }
        match rx.recv_timeout(remaining.min(Duration::from_millis(100))) {
            Ok(data) => {
                pending.extend_from_slice(&data);
                while pending.len() >= chunk {
                    let frame: Vec<f32> = pending.drain(..chunk).collect();
                    let speech = vad.is_speech(&frame)?;
                    if let Some(utterance) = segmenter.push(speech, &frame) {
                        return Ok(AudioBuffer::new(utterance, config.sample_rate));
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(VoiceError::AudioStream("input stream closed".to_string()))
            }
        }
    }
    Ok(AudioBuffer::new(segmenter.finish(), config.sample_rate))
}

#[async_trait]
impl AudioInput for MicrophoneInput {
    async fn record(&self, timeout: Duration) -> VoiceResult<AudioBuffer> {
        let config = self.config.clone();
        let generation = Arc::clone(&self.generation);
        let started = generation.load(Ordering::SeqCst);
        tokio::task::spawn_blocking(move || record_blocking(config, timeout, generation, started))
            .await
            .map_err(|e| VoiceError::AudioStream(format!("capture task failed: {}", e)))?
    }

    fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> String {
        self.config
            .device_name
            .clone()
            .unwrap_or_else(|| "default microphone".to_string())
    }
}

/// Names of the host's input devices.
pub fn list_input_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    Ok(host.input_devices()?.filter_map(|d| d.name().ok()).collect())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicLevel {
    pub peak: f32,
    pub rms: f32,
    pub samples: usize,
}

impl MicLevel {
    fn measure(samples: &[f32]) -> Self {
        if samples.is_empty() {
            return Self {
                peak: 0.0,
                rms: 0.0,
                samples: 0,
            };
        }
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        Self {
            peak,
            rms,
            samples: samples.len(),
        }
    }
}

/// Record raw input for `duration` and report its level.
pub async fn test_microphone(config: MicrophoneConfig, duration: Duration) -> VoiceResult<MicLevel> {
    tokio::task::spawn_blocking(move || -> VoiceResult<MicLevel> {
        let device = find_device(config.device_name.as_deref())?;
        let (tx, rx) = mpsc::channel();
        let stream = open_stream(&device, config.sample_rate, tx)?;
        std::thread::sleep(duration);
        drop(stream);
        let samples: Vec<f32> = rx.try_iter().flatten().collect();
        Ok(MicLevel::measure(&samples))
    })
    .await
    .map_err(|e| VoiceError::AudioStream(format!("mic test failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmixes_and_resamples() {
        let stereo = vec![0.5, -0.5, 1.0, 0.0, 0.2, 0.2, 0.0, 0.0];
        assert_eq!(to_mono(&stereo, 2, 16000, 16000), vec![0.0, 0.5, 0.2, 0.0]);

        let mono48 = vec![0.1f32; 4800];
        assert_eq!(to_mono(&mono48, 1, 48000, 16000).len(), 1600);
    }

    #[test]
    fn measures_levels() {
        let level = MicLevel::measure(&[0.5, -0.5, 0.5, -0.5]);
        assert!((level.peak - 0.5).abs() < 1e-6);
        assert!((level.rms - 0.5).abs() < 1e-6);
        assert_eq!(MicLevel::measure(&[]).samples, 0);
    }

    #[test]
    fn config_follows_audio_settings() {
        let config = MicrophoneConfig::from(&AudioSettings::default());
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.silence_threshold, Duration::from_millis(1500));
        assert_eq!(config.min_speech, Duration::from_millis(200));
    }

    #[tokio::test]
    #[ignore = "needs a microphone"]
    async fn records_from_default_device() {
        let mic = MicrophoneInput::new(MicrophoneConfig::default()).unwrap();
        let audio = mic.record(Duration::from_secs(2)).await.unwrap();
        assert_eq!(audio.sample_rate, 16000);
    }
}
