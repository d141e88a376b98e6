//! Utterance segmentation ("gap logic").
//!
//! Fed one VAD decision per frame, the segmenter collects speech and closes the
//! utterance once a configured gap of silence follows it. Time is measured in
//! samples so the result does not depend on wall-clock scheduling.

use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Silence after speech that closes the utterance.
    pub silence_threshold: Duration,
    /// Speech shorter than this is discarded as noise.
    pub min_speech: Duration,
    /// Utterances are force-closed at this length.
    pub max_utterance: Duration,
    pub sample_rate: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_millis(1500),
            min_speech: Duration::from_millis(200),
            max_utterance: Duration::from_secs(30),
            sample_rate: 16000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Speaking,
    Trailing,
}

pub struct UtteranceSegmenter {
    config: SegmenterConfig,
    phase: Phase,
    buffer: Vec<f32>,
    speech_samples: usize,
    silence_samples: usize,
}

impl UtteranceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            phase: Phase::Waiting,
            buffer: Vec::new(),
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    fn samples(&self, d: Duration) -> usize {
        (d.as_millis() as usize * self.config.sample_rate as usize) / 1000
    }

    /// Feed one frame. Returns the finished utterance when this frame closes it.
    pub fn push(&mut self, is_speech: bool, frame: &[f32]) -> Option<Vec<f32>> {
        match (self.phase, is_speech) {
            (Phase::Waiting, false) => return None,
            (Phase::Waiting, true) => {
                debug!("speech started");
                self.phase = Phase::Speaking;
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                self.speech_samples = frame.len();
                self.silence_samples = 0;
            }
            (Phase::Speaking, true) | (Phase::Trailing, true) => {
                self.phase = Phase::Speaking;
                self.buffer.extend_from_slice(frame);
                self.speech_samples += frame.len();
                self.silence_samples = 0;
            }
            (Phase::Speaking, false) | (Phase::Trailing, false) => {
                self.phase = Phase::Trailing;
                self.buffer.extend_from_slice(frame);
                self.silence_samples += frame.len();
                if self.silence_samples >= self.samples(self.config.silence_threshold) {
                    return self.commit();
                }
            }
        }

        if self.buffer.len() >= self.samples(self.config.max_utterance) {
            info!("max utterance length reached, closing");
            return self.commit();
        }
        None
    }

    /// Close whatever is buffered (capture timeout or stop).
    pub fn finish(&mut self) -> Vec<f32> {
        self.commit().unwrap_or_default()
    }

    pub fn is_speaking(&self) -> bool {
        self.phase != Phase::Waiting
    }

    fn commit(&mut self) -> Option<Vec<f32>> {
        if self.phase == Phase::Waiting {
            return None;
        }
        let speech = self.speech_samples;
        let mut audio = std::mem::take(&mut self.buffer);
        self.reset();
        if speech < self.samples(self.config.min_speech) {
            debug!("speech too short ({} samples), ignoring", speech);
            return None;
        }
        // Keep a short tail of silence, drop the rest of the gap.
        let tail = self.samples(Duration::from_millis(200));
        let trailing = audio.len().saturating_sub(speech);
        if trailing > tail {
            let keep = audio.len() - (trailing - tail);
            audio.truncate(keep);
        }
        info!("utterance closed: {} samples", audio.len());
        Some(audio)
    }

    fn reset(&mut self) {
        self.phase = Phase::Waiting;
        self.buffer.clear();
        self.speech_samples = 0;
        self.silence_samples = 0;
    }
}
