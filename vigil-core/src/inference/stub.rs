//! `StubTranscriber`: placeholder backend that needs no model files.
//!
//! Used for development and tests so the relay can be exercised end to end
//! without whisper.cpp. Non-empty audio produces either a fixed response or a
//! deterministic description of the buffer.

use tracing::debug;

use super::Transcriber;
use crate::audio::PcmBuffer;
use crate::error::{Result, VigilError};

/// Below 10 ms of audio there is nothing to describe.
const MIN_SAMPLES: usize = 160;

#[derive(Debug, Clone, Default)]
pub struct StubTranscriber {
    response: Option<String>,
    should_fail: bool,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `response` for non-trivial audio.
    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
            should_fail: false,
        }
    }

    /// Fail every call, as a broken engine would.
    pub fn failing() -> Self {
        Self {
            response: None,
            should_fail: true,
        }
    }
}

impl Transcriber for StubTranscriber {
    fn warm_up(&self) -> Result<()> {
        debug!("StubTranscriber::warm_up: no-op");
        Ok(())
    }

    fn transcribe(&self, audio: &PcmBuffer) -> Result<String> {
        if self.should_fail {
            return Err(VigilError::Transcription("stub configured to fail".into()));
        }
        if audio.samples.len() < MIN_SAMPLES {
            return Ok(String::new());
        }
        Ok(match &self.response {
            Some(text) => text.clone(),
            None => format!(
                "[stub: {} samples @ {} Hz]",
                audio.samples.len(),
                audio.sample_rate
            ),
        })
    }

    fn model_name(&self) -> &str {
        "stub"
    }
}
