//! Speech-to-text capability and the transcription gateway.
//!
//! The [`Transcriber`] trait decouples the pipeline from any specific
//! backend (stub, whisper.cpp, ...). Methods take `&self`: one loaded model is
//! shared by every session, and backends create per-call decoder state so
//! concurrent sessions never queue behind each other's inference.
//!
//! [`TranscriptionGateway`] runs normalisation, the silence gate and the
//! engine on tokio's blocking pool, off the tasks that serve live connections.

pub mod stub;

#[cfg(feature = "whisper")]
pub mod whisper;

pub use stub::StubTranscriber;

#[cfg(feature = "whisper")]
pub use whisper::{WhisperConfig, WhisperTranscriber};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::audio::{self, AudioFormat, PcmBuffer, ENGINE_SAMPLE_RATE};
use crate::buffering::chunk::AudioChunk;
use crate::error::Result;
use crate::vad::SilenceGate;

/// Contract for speech recognition backends.
pub trait Transcriber: Send + Sync + 'static {
    /// One-time start-up check: load weights, run a dummy inference.
    ///
    /// # Errors
    /// The engine is unusable. Callers abort start-up rather than run degraded.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    /// Transcribe 16 kHz mono f32 audio. Empty text means no speech.
    fn transcribe(&self, audio: &PcmBuffer) -> Result<String>;

    /// Name of the loaded model, for logs.
    fn model_name(&self) -> &str;
}

/// Why a transcript came back the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    Speech,
    /// Engine ran (or the silence gate fired) and found no speech.
    Silence,
    /// The captured bytes could not be normalised.
    DecodeFailed,
    /// The engine returned an error or panicked.
    EngineFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptResult {
    /// Trimmed text; empty means "discard silently".
    pub text: String,
    pub duration: Duration,
    pub kind: TranscriptKind,
}

impl TranscriptResult {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Stateless adapter from an [`AudioChunk`] to text.
#[derive(Clone)]
pub struct TranscriptionGateway {
    engine: Arc<dyn Transcriber>,
    format: AudioFormat,
    silence_gate: Option<SilenceGate>,
}

impl TranscriptionGateway {
    pub fn new(
        engine: Arc<dyn Transcriber>,
        format: AudioFormat,
        silence_gate: Option<SilenceGate>,
    ) -> Self {
        Self {
            engine,
            format,
            silence_gate,
        }
    }

    pub fn engine(&self) -> &Arc<dyn Transcriber> {
        &self.engine
    }

    /// Transcribe one window. Never fails: every error yields empty text.
    pub async fn transcribe(&self, chunk: &AudioChunk) -> TranscriptResult {
        let started = Instant::now();
        let bytes = chunk.shared_bytes();
        let engine = Arc::clone(&self.engine);
        let format = self.format;
        let gate = self.silence_gate.clone();
        let session = chunk.session();

        // Failures travel back as text so they are logged from the calling
        // task, inside the utterance span.
        let joined = tokio::task::spawn_blocking(move || -> (TranscriptKind, String, Option<String>) {
            let pcm = match audio::normalize(&bytes, format, ENGINE_SAMPLE_RATE) {
                Ok(pcm) => pcm,
                Err(e) => return (TranscriptKind::DecodeFailed, String::new(), Some(e.to_string())),
            };

            if let Some(gate) = gate {
                if gate.is_silent(&pcm) {
                    return (TranscriptKind::Silence, String::new(), None);
                }
            }

            match engine.transcribe(&pcm) {
                Ok(text) => {
                    let text = text.trim().to_string();
                    let kind = if text.is_empty() {
                        TranscriptKind::Silence
                    } else {
                        TranscriptKind::Speech
                    };
                    (kind, text, None)
                }
                Err(e) => (
                    TranscriptKind::EngineFailed,
                    String::new(),
                    Some(format!("{}: {e}", engine.model_name())),
                ),
            }
        })
        .await;

        let (kind, text, failure) = joined.unwrap_or_else(|e| {
            (
                TranscriptKind::EngineFailed,
                String::new(),
                Some(format!("transcription task aborted: {e}")),
            )
        });
        match (kind, failure) {
            (_, Some(error)) => trace!(session = %session, ?kind, %error, "utterance dropped"),
            (TranscriptKind::Silence, None) => trace!(session = %session, "no speech in window"),
            _ => {}
        }

        TranscriptResult {
            text,
            duration: started.elapsed(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VigilError;
    use crate::session::ConnectionId;
    use chrono::Utc;

    struct Failing;

    impl Transcriber for Failing {
        fn transcribe(&self, _audio: &PcmBuffer) -> Result<String> {
            Err(VigilError::Transcription("engine exploded".into()))
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }

    struct Panicking;

    impl Transcriber for Panicking {
        fn transcribe(&self, _audio: &PcmBuffer) -> Result<String> {
            panic!("inference crashed")
        }

        fn model_name(&self) -> &str {
            "panicking"
        }
    }

    fn pcm_format() -> AudioFormat {
        AudioFormat::PcmS16le {
            sample_rate: 16_000,
            channels: 1,
        }
    }

    fn chunk(samples: &[i16]) -> AudioChunk {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        AudioChunk::new(bytes, ConnectionId::new(1), 1, Utc::now(), Utc::now())
    }

    fn loud(n: usize) -> Vec<i16> {
        (0..n).map(|i| if i % 2 == 0 { 8_000 } else { -8_000 }).collect()
    }

    #[tokio::test]
    async fn speech_is_transcribed_and_trimmed() {
        let gateway = TranscriptionGateway::new(
            Arc::new(StubTranscriber::with_response("  hello everyone ")),
            pcm_format(),
            Some(SilenceGate::default()),
        );
        let result = gateway.transcribe(&chunk(&loud(16_000))).await;
        assert_eq!(result.text, "hello everyone");
        assert_eq!(result.kind, TranscriptKind::Speech);
    }

    #[tokio::test]
    async fn silent_window_skips_engine() {
        let gateway = TranscriptionGateway::new(
            Arc::new(Failing),
            pcm_format(),
            Some(SilenceGate::default()),
        );
        let result = gateway.transcribe(&chunk(&vec![0; 16_000])).await;
        assert!(result.is_empty());
        assert_eq!(result.kind, TranscriptKind::Silence);
    }

    #[tokio::test]
    async fn undecodable_window_is_dropped() {
        let gateway = TranscriptionGateway::new(
            Arc::new(StubTranscriber::with_response("unreachable")),
            AudioFormat::Wav,
            None,
        );
        let result = gateway.transcribe(&chunk(&loud(100))).await;
        assert!(result.is_empty());
        assert_eq!(result.kind, TranscriptKind::DecodeFailed);
    }

    #[tokio::test]
    async fn engine_error_is_dropped() {
        let gateway = TranscriptionGateway::new(Arc::new(Failing), pcm_format(), None);
        let result = gateway.transcribe(&chunk(&loud(16_000))).await;
        assert!(result.is_empty());
        assert_eq!(result.kind, TranscriptKind::EngineFailed);
    }

    #[tokio::test]
    async fn engine_panic_is_contained() {
        let gateway = TranscriptionGateway::new(Arc::new(Panicking), pcm_format(), None);
        let result = gateway.transcribe(&chunk(&loud(16_000))).await;
        assert_eq!(result.kind, TranscriptKind::EngineFailed);
    }

    /// Records the level of every event emitted on the current thread.
    struct LevelLog(Arc<parking_lot::Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelLog {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0.lock().push(*event.metadata().level());
        }
    }

    #[tokio::test]
    async fn dropped_utterances_are_logged_at_trace_only() {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(LevelLog(Arc::clone(&levels)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let failing = TranscriptionGateway::new(Arc::new(Failing), pcm_format(), None);
        assert_eq!(
            failing.transcribe(&chunk(&loud(16_000))).await.kind,
            TranscriptKind::EngineFailed
        );
        let panicking = TranscriptionGateway::new(Arc::new(Panicking), pcm_format(), None);
        assert_eq!(
            panicking.transcribe(&chunk(&loud(16_000))).await.kind,
            TranscriptKind::EngineFailed
        );

        let levels = levels.lock();
        assert!(levels.len() >= 2, "each dropped utterance is logged");
        assert!(levels.iter().all(|level| *level == tracing::Level::TRACE), "{levels:?}");
    }
}
