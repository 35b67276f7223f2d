//! Frame energy detector.
//!
//! A frame is speech when its RMS reaches the threshold. Frames are judged
//! independently; there is no hangover, so a window's speech count reflects
//! only the energy actually present in it.

use super::VadDecision;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.max(0.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn classify(&self, frame: &[f32]) -> VadDecision {
        if !frame.is_empty() && rms(frame) >= self.threshold {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    /// Number of `frame_len`-sample frames in `samples` classified as speech.
    /// A trailing short frame is judged on its own samples.
    pub fn count_speech(&self, samples: &[f32], frame_len: usize) -> usize {
        samples
            .chunks(frame_len.max(1))
            .filter(|frame| self.classify(frame).is_speech())
            .count()
    }
}

/// Root-mean-square amplitude; 0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        let vad = EnergyVad::new(0.25);
        assert_eq!(vad.classify(&[0.25; 64]), VadDecision::Speech);
        assert_eq!(vad.classify(&[0.24; 64]), VadDecision::Silence);
    }

    #[test]
    fn empty_frame_is_silence_even_at_zero_threshold() {
        let vad = EnergyVad::new(0.0);
        assert_eq!(vad.classify(&[]), VadDecision::Silence);
        assert_eq!(vad.classify(&[0.0; 4]), VadDecision::Speech);
    }

    #[test]
    fn counts_loud_frames_only() {
        let vad = EnergyVad::new(0.1);
        let mut samples = vec![0.0f32; 1_000];
        samples[100..300].fill(0.4);
        assert_eq!(vad.count_speech(&samples, 100), 2);
    }

    #[test]
    fn negative_threshold_is_clamped() {
        assert_eq!(EnergyVad::new(-1.0).threshold(), 0.0);
    }

    #[test]
    fn rms_of_alternating_signal() {
        let samples: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        approx::assert_abs_diff_eq!(rms(&samples), 0.5, epsilon = 1e-5);
        assert_eq!(rms(&[]), 0.0);
    }
}
