//! Per-session pipeline worker.
//!
//! ## Stages (per captured window)
//!
//! ```text
//! 1. Session still registered?            no  → Stale
//! 2. Transcribe (blocking pool)           ""  → Silent / Dropped
//! 3. Session still registered?            no  → Stale
//! 4. Classify (timeout, fail-open)
//! 5. Session still registered?            no  → Stale
//! 6. decide(mode, text, labels)
//! 7. Relay::deliver
//! 8. Telemetry row
//! ```
//!
//! One worker task per session drains that session's window queue, so a
//! speaker's utterances are evaluated strictly in arrival order while capture
//! keeps running. Sessions never share a worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    buffering::chunk::AudioChunk,
    classify::ClassificationGateway,
    inference::{TranscriptKind, TranscriptionGateway},
    moderation::{decide, Decision},
    relay::{DeliveryReport, Relay},
    session::{ConnectionId, SessionRegistry},
    telemetry::{TelemetrySink, UtteranceRecord},
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub windows_received: AtomicUsize,
    pub silent_windows: AtomicUsize,
    pub transcription_failures: AtomicUsize,
    pub classifier_calls: AtomicUsize,
    pub classifier_failures: AtomicUsize,
    pub allowed: AtomicUsize,
    pub blocked: AtomicUsize,
    pub flagged: AtomicUsize,
    pub stale_discards: AtomicUsize,
    pub delivery_failures: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            windows_received: self.windows_received.load(Ordering::Relaxed),
            silent_windows: self.silent_windows.load(Ordering::Relaxed),
            transcription_failures: self.transcription_failures.load(Ordering::Relaxed),
            classifier_calls: self.classifier_calls.load(Ordering::Relaxed),
            classifier_failures: self.classifier_failures.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            flagged: self.flagged.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 10] {
        [
            &self.windows_received,
            &self.silent_windows,
            &self.transcription_failures,
            &self.classifier_calls,
            &self.classifier_failures,
            &self.allowed,
            &self.blocked,
            &self.flagged,
            &self.stale_discards,
            &self.delivery_failures,
        ]
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub windows_received: usize,
    pub silent_windows: usize,
    pub transcription_failures: usize,
    pub classifier_calls: usize,
    pub classifier_failures: usize,
    pub allowed: usize,
    pub blocked: usize,
    pub flagged: usize,
    pub stale_discards: usize,
    pub delivery_failures: usize,
}

/// What became of one window.
#[derive(Debug, Clone, PartialEq)]
pub enum UtteranceOutcome {
    /// No speech. Nothing was sent or recorded.
    Silent,
    /// Decode or engine failure. Nothing was sent or recorded.
    Dropped { reason: TranscriptKind },
    /// The speaker left before the result was ready.
    Stale,
    Processed {
        decision: Decision,
        report: DeliveryReport,
    },
}

/// Everything a worker needs, shared by all sessions.
#[derive(Clone)]
pub struct PipelineContext {
    pub transcription: TranscriptionGateway,
    pub classification: ClassificationGateway,
    pub relay: Arc<Relay>,
    pub registry: Arc<SessionRegistry>,
    pub sink: Arc<dyn TelemetrySink>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

impl PipelineContext {
    /// Run one window through every stage.
    pub async fn process(&self, chunk: AudioChunk) -> UtteranceOutcome {
        let span = info_span!("utterance", session = %chunk.session(), seq = chunk.seq());
        self.process_inner(chunk).instrument(span).await
    }

    async fn process_inner(&self, chunk: AudioChunk) -> UtteranceOutcome {
        let diag = &self.diagnostics;
        let session = chunk.session();
        PipelineDiagnostics::bump(&diag.windows_received);

        if !self.registry.contains(session) {
            return self.stale(session, "before transcription");
        }

        let transcript = self.transcription.transcribe(&chunk).await;
        match transcript.kind {
            TranscriptKind::Speech => {}
            TranscriptKind::Silence => {
                PipelineDiagnostics::bump(&diag.silent_windows);
                trace!("no speech in window");
                return UtteranceOutcome::Silent;
            }
            reason @ (TranscriptKind::DecodeFailed | TranscriptKind::EngineFailed) => {
                PipelineDiagnostics::bump(&diag.transcription_failures);
                debug!(?reason, "window dropped");
                return UtteranceOutcome::Dropped { reason };
            }
        }

        let stt_ms = transcript.duration.as_millis() as u64;
        if !self.registry.contains(session) {
            return self.stale(session, "after transcription");
        }
        debug!(stt_ms, text = %transcript.text, "transcribed");

        PipelineDiagnostics::bump(&diag.classifier_calls);
        let classification = self.classification.classify(&transcript.text).await;
        if classification.is_unavailable() {
            PipelineDiagnostics::bump(&diag.classifier_failures);
        } else if classification.labels().is_empty() {
            info!(verdict = "safe", ai_ms = classification.duration.as_millis() as u64, "classifier verdict");
        } else {
            info!(
                verdict = "labels",
                labels = ?classification.label_names(),
                ai_ms = classification.duration.as_millis() as u64,
                "classifier verdict"
            );
        }

        // Snapshot the speaker after the last suspension point.
        let Some(sender) = self.registry.recipient(session) else {
            return self.stale(session, "after classification");
        };

        let decision = decide(self.relay.mode(), &transcript.text, &classification);
        let report = self.relay.deliver(&chunk, &sender, &decision);

        if decision.is_blocked() {
            PipelineDiagnostics::bump(&diag.blocked);
            warn!(speaker = %sender.display_name, labels = ?decision.flagged_labels, "utterance blocked");
        } else if decision.is_flagged() {
            PipelineDiagnostics::bump(&diag.flagged);
            warn!(speaker = %sender.display_name, labels = ?decision.flagged_labels, "utterance flagged after delivery");
        } else {
            PipelineDiagnostics::bump(&diag.allowed);
            info!(speaker = %sender.display_name, explanation = %decision.explanation, "utterance allowed");
        }

        let record = UtteranceRecord {
            timestamp: Local::now(),
            speaker: sender.display_name.clone(),
            text: transcript.text.clone(),
            labels: classification.summary(),
            classifier_status: classification.status().to_string(),
            stt: transcript.duration,
            classify: classification.duration,
            user_count: self.registry.len(),
        };
        if let Err(e) = self.sink.record(&record) {
            warn!(error = %e, "telemetry write failed");
        }

        UtteranceOutcome::Processed { decision, report }
    }

    fn stale(&self, session: ConnectionId, stage: &str) -> UtteranceOutcome {
        PipelineDiagnostics::bump(&self.diagnostics.stale_discards);
        debug!(session = %session, stage, "speaker left; result discarded");
        UtteranceOutcome::Stale
    }
}

/// Drain one session's window queue until the capture side hangs up.
pub async fn run_worker(ctx: PipelineContext, session: ConnectionId, mut windows: mpsc::Receiver<AudioChunk>) {
    debug!(session = %session, "pipeline worker started");
    let mut delivered = 0usize;
    let mut undelivered = 0usize;
    while let Some(chunk) = windows.recv().await {
        match ctx.process(chunk).await {
            UtteranceOutcome::Processed { report, .. } => {
                delivered += 1;
                trace!(session = %session, sent = report.delivered.len(), failed = report.failed.len(), "window delivered");
            }
            _ => undelivered += 1,
        }
    }
    debug!(session = %session, delivered, undelivered, "pipeline worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::classify::{ToxicLabel, ToxicityClassifier};
    use crate::error::Result;
    use crate::inference::StubTranscriber;
    use crate::moderation::Mode;
    use crate::relay::{outbound_channel, OutboundReceiver};
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl ToxicityClassifier for Fixed {
        async fn classify(&self, _text: &str) -> Result<Vec<ToxicLabel>> {
            Ok(self.0.iter().map(|l| ToxicLabel::new(*l)).collect())
        }
    }

    struct Setup {
        ctx: PipelineContext,
        sink: Arc<MemorySink>,
        speaker: ConnectionId,
        _rxs: Vec<OutboundReceiver>,
    }

    fn setup(mode: Mode, response: &str, labels: Vec<&'static str>) -> Setup {
        let registry = Arc::new(SessionRegistry::new());
        let speaker = registry.next_connection_id();
        let other = registry.next_connection_id();
        let (tx_a, rx_a) = outbound_channel(32);
        let (tx_b, rx_b) = outbound_channel(32);
        registry.register(speaker, Some("s1"), tx_a).unwrap();
        registry.register(other, Some("s2"), tx_b).unwrap();

        let sink = Arc::new(MemorySink::new());
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let ctx = PipelineContext {
            transcription: TranscriptionGateway::new(
                Arc::new(StubTranscriber::with_response(response)),
                AudioFormat::PcmS16le {
                    sample_rate: 16_000,
                    channels: 1,
                },
                None,
            ),
            classification: ClassificationGateway::new(Arc::new(Fixed(labels)), Duration::from_secs(2)),
            relay: Arc::new(Relay::with_diagnostics(mode, Arc::clone(&registry), Arc::clone(&diagnostics))),
            registry,
            sink: sink.clone(),
            diagnostics,
        };
        Setup {
            ctx,
            sink,
            speaker,
            _rxs: vec![rx_a, rx_b],
        }
    }

    fn window(session: ConnectionId, seq: u64) -> AudioChunk {
        let bytes: Vec<u8> = (0..3_200i16).flat_map(|i| (i * 7).to_le_bytes()).collect();
        AudioChunk::new(bytes, session, seq, Utc::now(), Utc::now())
    }

    #[tokio::test]
    async fn allowed_utterance_is_recorded() {
        let s = setup(Mode::Preventive, "good morning", vec![]);
        let outcome = s.ctx.process(window(s.speaker, 0)).await;
        assert!(matches!(outcome, UtteranceOutcome::Processed { ref decision, .. } if decision.is_allowed()));

        let records = s.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].speaker, "s1");
        assert_eq!(records[0].labels, "SAFE");
        assert_eq!(records[0].user_count, 2);

        let snap = s.ctx.diagnostics.snapshot();
        assert_eq!(snap.allowed, 1);
        assert_eq!(snap.classifier_calls, 1);
    }

    #[tokio::test]
    async fn blocked_utterance_counts_and_records_labels() {
        let s = setup(Mode::Preventive, "you idiot", vec!["insult"]);
        let outcome = s.ctx.process(window(s.speaker, 0)).await;
        assert!(matches!(outcome, UtteranceOutcome::Processed { ref decision, .. } if decision.is_blocked()));
        assert_eq!(s.sink.records()[0].labels, "insult");
        assert_eq!(s.ctx.diagnostics.snapshot().blocked, 1);
    }

    #[tokio::test]
    async fn empty_transcript_has_no_side_effects() {
        let s = setup(Mode::Preventive, "   ", vec!["insult"]);
        let outcome = s.ctx.process(window(s.speaker, 0)).await;
        assert_eq!(outcome, UtteranceOutcome::Silent);
        assert!(s.sink.is_empty());
        let snap = s.ctx.diagnostics.snapshot();
        assert_eq!(snap.classifier_calls, 0);
        assert_eq!(snap.silent_windows, 1);
    }

    #[tokio::test]
    async fn unregistered_speaker_is_stale() {
        let s = setup(Mode::Reactive, "hello", vec![]);
        s.ctx.registry.unregister(s.speaker);
        let outcome = s.ctx.process(window(s.speaker, 0)).await;
        assert_eq!(outcome, UtteranceOutcome::Stale);
        assert!(s.sink.is_empty());
        assert_eq!(s.ctx.diagnostics.snapshot().stale_discards, 1);
    }

    #[test]
    fn reset_clears_counters() {
        let diag = PipelineDiagnostics::default();
        PipelineDiagnostics::bump(&diag.blocked);
        PipelineDiagnostics::bump(&diag.flagged);
        diag.reset();
        assert_eq!(diag.snapshot(), DiagnosticsSnapshot::default());
    }
}
