//! Window-level silence gate.
//!
//! The transcription gateway runs a [`SilenceGate`] over each normalised
//! window before calling the speech engine. A window without enough speech
//! frames is "no speech detected": it yields empty text, so it never reaches
//! the classifier, the relay, or the telemetry sink.

pub mod energy;

use crate::audio::PcmBuffer;
use energy::EnergyVad;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Thresholds for the window-level silence gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceGateConfig {
    /// RMS threshold per frame.
    pub rms_threshold: f32,
    /// Frame length in milliseconds.
    pub frame_ms: u32,
    /// Minimum number of speech frames for a window to be transcribed.
    pub min_speech_frames: usize,
}

impl Default for SilenceGateConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 0.01,
            frame_ms: 20,
            // 200 ms of speech energy
            min_speech_frames: 10,
        }
    }
}

/// Decides whether a whole window contains any speech worth transcribing.
#[derive(Debug, Clone)]
pub struct SilenceGate {
    config: SilenceGateConfig,
}

impl SilenceGate {
    pub fn new(config: SilenceGateConfig) -> Self {
        Self { config }
    }

    /// Count speech frames in `pcm`.
    pub fn speech_frames(&self, pcm: &PcmBuffer) -> usize {
        let frame_len = pcm.sample_rate as usize * self.config.frame_ms as usize / 1000;
        EnergyVad::new(self.config.rms_threshold).count_speech(&pcm.samples, frame_len)
    }

    /// `true` when the window should be treated as silence.
    pub fn is_silent(&self, pcm: &PcmBuffer) -> bool {
        self.speech_frames(pcm) < self.config.min_speech_frames
    }
}

impl Default for SilenceGate {
    fn default() -> Self {
        Self::new(SilenceGateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_window_is_silent() {
        let gate = SilenceGate::default();
        assert!(gate.is_silent(&PcmBuffer::new(vec![0.0; 16_000], 16_000)));
    }

    #[test]
    fn loud_window_is_not_silent() {
        let gate = SilenceGate::default();
        let samples: Vec<f32> = (0..16_000)
            .map(|i| if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        let pcm = PcmBuffer::new(samples, 16_000);
        assert_eq!(gate.speech_frames(&pcm), 50);
        assert!(!gate.is_silent(&pcm));
    }

    #[test]
    fn brief_click_stays_below_minimum() {
        let gate = SilenceGate::default();
        let mut samples = vec![0.0f32; 16_000];
        // 3 frames of energy at 20 ms / 320 samples each
        for s in samples.iter_mut().take(960) {
            *s = 0.5;
        }
        let pcm = PcmBuffer::new(samples, 16_000);
        assert_eq!(gate.speech_frames(&pcm), 3);
        assert!(gate.is_silent(&pcm));
    }

    #[test]
    fn empty_buffer_is_silent() {
        let gate = SilenceGate::default();
        assert!(gate.is_silent(&PcmBuffer::new(Vec::new(), 16_000)));
    }
}
