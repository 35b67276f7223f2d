//! Whole-window sample-rate conversion with rubato.
//!
//! A captured window is converted in one call on the blocking transcription
//! thread. The resampler's group delay is skipped and the output is trimmed
//! to exactly `round(len * target / source)` samples, so a 4 s window at
//! 48 kHz comes back as 4 s at 16 kHz.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::trace;

use crate::error::{Result, VigilError};

/// Input frames per rubato call.
pub const DEFAULT_CHUNK: usize = 960;

/// Convert mono `samples` from `source_rate` to `target_rate`.
///
/// # Errors
/// `VigilError::Resample` for a zero rate or a rubato failure.
pub fn convert(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    convert_with_chunk(samples, source_rate, target_rate, DEFAULT_CHUNK)
}

pub fn convert_with_chunk(
    samples: &[f32],
    source_rate: u32,
    target_rate: u32,
    chunk: usize,
) -> Result<Vec<f32>> {
    if source_rate == 0 || target_rate == 0 || chunk == 0 {
        return Err(VigilError::Resample(format!(
            "invalid conversion {source_rate} Hz -> {target_rate} Hz (chunk {chunk})"
        )));
    }
    if source_rate == target_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(target_rate) / f64::from(source_rate);
    let mut resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk, 1)
        .map_err(|e| VigilError::Resample(format!("resampler init: {e}")))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let wanted = expected + delay;

    let mut out = Vec::with_capacity(wanted + resampler.output_frames_max());
    let mut scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];
    let mut block = vec![0f32; chunk];
    let mut offset = 0;

    // Past the end of the window the input is zero padding, fed until the
    // delayed tail has been flushed out.
    while out.len() < wanted {
        block.fill(0.0);
        if offset < samples.len() {
            let end = (offset + chunk).min(samples.len());
            block[..end - offset].copy_from_slice(&samples[offset..end]);
        }
        offset += chunk;

        let (_, produced) = resampler
            .process_into_buffer(&[block.as_slice()], &mut scratch, None)
            .map_err(|e| VigilError::Resample(format!("resampler process: {e}")))?;
        out.extend_from_slice(&scratch[0][..produced]);
    }

    trace!(source_rate, target_rate, input = samples.len(), output = expected, delay, "window resampled");
    out.drain(..delay);
    out.truncate(expected);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, rate: u32, secs: f32, amplitude: f32) -> Vec<f32> {
        let n = (rate as f32 * secs) as usize;
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn same_rate_is_a_copy() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(convert(&samples, 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn output_length_matches_ratio_exactly() {
        let out = convert(&vec![0.0; 48_000], 48_000, 16_000).unwrap();
        assert_eq!(out.len(), 16_000);
        let out = convert(&vec![0.0; 1_000], 44_100, 16_000).unwrap();
        assert_eq!(out.len(), 363);
    }

    #[test]
    fn short_window_below_one_chunk_still_converts() {
        let out = convert_with_chunk(&[0.0; 300], 48_000, 16_000, 960).unwrap();
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn tone_energy_survives_downsampling() {
        let input = tone(440.0, 48_000, 0.5, 0.5);
        let out = convert(&input, 48_000, 16_000).unwrap();
        // Skip the edges where the filter rings in and out.
        let body = &out[400..out.len() - 400];
        approx::assert_abs_diff_eq!(rms(body), rms(&input), epsilon = 0.03);
    }

    #[test]
    fn zero_rates_are_rejected() {
        assert!(convert(&[0.0; 10], 0, 16_000).is_err());
        assert!(convert(&[0.0; 10], 48_000, 0).is_err());
        assert!(convert_with_chunk(&[0.0; 10], 48_000, 16_000, 0).is_err());
    }
}
