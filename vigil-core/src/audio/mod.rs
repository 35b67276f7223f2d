//! Format normalisation for captured windows.
//!
//! Clients send either WAV containers or raw little-endian 16-bit PCM at an
//! arbitrary rate and channel count. The speech engine needs 16 kHz mono f32,
//! so every window goes through [`normalize`] before transcription:
//!
//! ```text
//! bytes ──► decode (hound / s16le) ──► downmix ──► resample::convert ──► PcmBuffer @ 16 kHz
//! ```
//!
//! A failure anywhere in this chain is reported as an error; the transcription
//! gateway turns it into an empty transcript so the utterance is dropped.

pub mod decode;
pub mod resample;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Sample rate expected by the speech engine.
pub const ENGINE_SAMPLE_RATE: u32 = 16_000;

/// Container/encoding of the bytes a client sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioFormat {
    /// A complete RIFF/WAVE file per window.
    #[default]
    Wav,
    /// Headerless interleaved signed 16-bit little-endian samples.
    PcmS16le { sample_rate: u32, channels: u16 },
}

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of this buffer in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode `bytes` and bring them to mono f32 at `target_rate`.
pub fn normalize(bytes: &[u8], format: AudioFormat, target_rate: u32) -> Result<PcmBuffer> {
    let decoded = match format {
        AudioFormat::Wav => decode::decode_wav(bytes)?,
        AudioFormat::PcmS16le {
            sample_rate,
            channels,
        } => decode::decode_pcm_s16le(bytes, sample_rate, channels)?,
    };

    if decoded.sample_rate == target_rate {
        return Ok(decoded);
    }

    let samples = resample::convert(&decoded.samples, decoded.sample_rate, target_rate)?;
    Ok(PcmBuffer::new(samples, target_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16le(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn pcm_at_engine_rate_passes_through() {
        let bytes = s16le(&[0, 16_384, -16_384, 0]);
        let format = AudioFormat::PcmS16le {
            sample_rate: ENGINE_SAMPLE_RATE,
            channels: 1,
        };
        let pcm = normalize(&bytes, format, ENGINE_SAMPLE_RATE).unwrap();
        assert_eq!(pcm.sample_rate, ENGINE_SAMPLE_RATE);
        assert_eq!(pcm.samples.len(), 4);
        approx::assert_abs_diff_eq!(pcm.samples[1], 0.5, epsilon = 1e-4);
    }

    #[test]
    fn pcm_48k_is_resampled_to_a_third() {
        let bytes = s16le(&vec![0i16; 48_000]);
        let format = AudioFormat::PcmS16le {
            sample_rate: 48_000,
            channels: 1,
        };
        let pcm = normalize(&bytes, format, ENGINE_SAMPLE_RATE).unwrap();
        assert_eq!(pcm.sample_rate, ENGINE_SAMPLE_RATE);
        assert_eq!(pcm.samples.len(), 16_000);
        approx::assert_abs_diff_eq!(pcm.duration_secs(), 1.0, epsilon = 0.01);
    }

    #[test]
    fn garbage_wav_is_an_error() {
        assert!(normalize(b"not a wav file", AudioFormat::Wav, ENGINE_SAMPLE_RATE).is_err());
    }

    #[test]
    fn format_serializes_with_kind_tag() {
        let json = serde_json::to_value(AudioFormat::PcmS16le {
            sample_rate: 48_000,
            channels: 2,
        })
        .unwrap();
        assert_eq!(json["kind"], "pcm_s16le");
        assert_eq!(json["sample_rate"], 48_000);
        let wav: AudioFormat = serde_json::from_str(r#"{"kind":"wav"}"#).unwrap();
        assert_eq!(wav, AudioFormat::Wav);
    }
}
