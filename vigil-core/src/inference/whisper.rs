//! whisper.cpp backend via `whisper-rs`.
//!
//! Requires the `whisper` feature (and cmake at build time):
//!
//! ```bash
//! cargo build --features whisper
//! ```

use std::path::PathBuf;
use std::sync::Once;

use tracing::info;
use whisper_rs::{
    install_logging_hooks, FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters,
};

use super::Transcriber;
use crate::audio::{PcmBuffer, ENGINE_SAMPLE_RATE};
use crate::error::{Result, VigilError};

static LOGGING_HOOKS_INSTALLED: Once = Once::new();

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Path to a ggml model file.
    pub model_path: PathBuf,
    /// Language code, or `None` for auto-detection.
    pub language: Option<String>,
    /// Inference threads per call (`None` = whisper.cpp default).
    pub threads: Option<usize>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/ggml-base.en.bin"),
            language: Some("en".to_string()),
            threads: None,
        }
    }
}

/// Shared whisper context; each call creates its own decoder state.
pub struct WhisperTranscriber {
    context: WhisperContext,
    config: WhisperConfig,
    model_name: String,
}

impl std::fmt::Debug for WhisperTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTranscriber")
            .field("config", &self.config)
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

impl WhisperTranscriber {
    /// Load the model.
    ///
    /// # Errors
    /// `ModelNotFound` when the file is missing, `Transcription` when
    /// whisper.cpp rejects it.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        if !config.model_path.exists() {
            return Err(VigilError::ModelNotFound {
                path: config.model_path.clone(),
            });
        }

        let model_name = config
            .model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let path = config
            .model_path
            .to_str()
            .ok_or_else(|| VigilError::Transcription("model path is not valid UTF-8".into()))?;
        let context = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| VigilError::Transcription(format!("failed to load model: {e}")))?;

        info!(model = %model_name, "whisper model loaded");
        Ok(Self {
            context,
            config,
            model_name,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    fn warm_up(&self) -> Result<()> {
        // One second of silence exercises state creation and the decoder.
        let silence = PcmBuffer::new(vec![0.0; ENGINE_SAMPLE_RATE as usize], ENGINE_SAMPLE_RATE);
        self.transcribe(&silence).map(|_| ())
    }

    fn transcribe(&self, audio: &PcmBuffer) -> Result<String> {
        if audio.sample_rate != ENGINE_SAMPLE_RATE {
            return Err(VigilError::Transcription(format!(
                "expected {ENGINE_SAMPLE_RATE} Hz input, got {}",
                audio.sample_rate
            )));
        }

        let mut state = self
            .context
            .create_state()
            .map_err(|e| VigilError::Transcription(format!("failed to create state: {e}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(self.config.language.as_deref());
        if let Some(threads) = self.config.threads {
            params.set_n_threads(threads as i32);
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &audio.samples)
            .map_err(|e| VigilError::Transcription(format!("inference failed: {e}")))?;

        let text: Vec<String> = state.as_iter().map(|segment| segment.to_string()).collect();
        Ok(text.join(" ").trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
