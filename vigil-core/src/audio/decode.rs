//! Byte-level decoders producing mono f32 PCM.

use std::io::Cursor;

use hound::{SampleFormat, WavReader};

use super::PcmBuffer;
use crate::error::{Result, VigilError};

/// Decode a complete WAV file held in memory.
pub fn decode_wav(bytes: &[u8]) -> Result<PcmBuffer> {
    let mut reader =
        WavReader::new(Cursor::new(bytes)).map_err(|e| VigilError::AudioDecode(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(VigilError::AudioDecode("wav header declares 0 channels".into()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VigilError::AudioDecode(e.to_string()))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VigilError::AudioDecode(e.to_string()))?
        }
    };

    Ok(PcmBuffer::new(
        downmix(&interleaved, spec.channels),
        spec.sample_rate,
    ))
}

/// Decode headerless interleaved s16le samples.
pub fn decode_pcm_s16le(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PcmBuffer> {
    if channels == 0 || sample_rate == 0 {
        return Err(VigilError::AudioDecode(format!(
            "invalid pcm layout: {sample_rate} Hz, {channels} channels"
        )));
    }
    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(VigilError::AudioDecode(format!(
            "{} bytes is not a whole number of {}-byte frames",
            bytes.len(),
            frame_bytes
        )));
    }

    let interleaved: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();

    Ok(PcmBuffer::new(downmix(&interleaved, channels), sample_rate))
}

/// Average interleaved channels into one.
fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    let n = channels as usize;
    interleaved
        .chunks_exact(n)
        .map(|frame| frame.iter().sum::<f32>() / n as f32)
        .collect()
}
