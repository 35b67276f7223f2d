//! `ModerationEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! ModerationEngine::new(config, transcriber, classifier, sink)
//!     └─► warm_up()                 → engine verified, or start-up aborts
//!         └─► connect(name, queue)  → session registered, capture loop + worker spawned
//!             └─► disconnect(handle) → unregistered, loop winds down, late results discarded
//! ```
//!
//! ## Tasks
//!
//! Per session: one [`CaptureLoop`] fed by the transport and one pipeline
//! worker fed by the capture loop. Process-wide: one membership announcer
//! turning registry notifications into `system` + `user_list` broadcasts.
//! Inference runs on tokio's blocking pool inside the worker.

pub mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{
    audio::AudioFormat,
    capture::{CaptureController, CaptureLoop, CaptureStrategy, InboundFrame},
    classify::{ClassificationGateway, ToxicityClassifier},
    error::{Result, VigilError},
    inference::{Transcriber, TranscriptionGateway},
    moderation::Mode,
    relay::{OutboundSender, Relay},
    session::{ConnectionId, MembershipEvent, SessionInfo, SessionRegistry},
    telemetry::TelemetrySink,
    vad::{SilenceGate, SilenceGateConfig},
};

pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics, UtteranceOutcome};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(4);
pub const MIN_WINDOW: Duration = Duration::from_millis(500);
pub const MAX_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_CLASSIFIER_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(5);

/// Which capture variant sessions use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// One inbound binary frame = one window.
    #[default]
    PerMessage,
    /// Frames accumulate into fixed-duration windows.
    Timed,
}

/// Configuration for `ModerationEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed for the life of the engine.
    pub mode: Mode,
    pub capture: CaptureKind,
    /// Timed window length. Default: 4 s, clamped to 0.5 – 10 s.
    pub window: Duration,
    /// Encoding of inbound audio bytes.
    pub input_format: AudioFormat,
    /// Confidence threshold forwarded to the classifier. Default: 0.5.
    pub classifier_threshold: f32,
    /// Default: 2 s. Past it the utterance fails open.
    pub classifier_timeout: Duration,
    /// `None` sends every decodable window to the engine.
    pub silence_gate: Option<SilenceGateConfig>,
    /// Windows waiting for a session's worker.
    pub window_queue_depth: usize,
    /// Frames waiting for a session's capture loop.
    pub inbound_queue_depth: usize,
    /// Frames waiting for a session's transport writer.
    pub outbound_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Reactive,
            capture: CaptureKind::PerMessage,
            window: DEFAULT_WINDOW,
            input_format: AudioFormat::Wav,
            classifier_threshold: 0.5,
            classifier_timeout: DEFAULT_CLASSIFIER_TIMEOUT,
            silence_gate: Some(SilenceGateConfig::default()),
            window_queue_depth: 8,
            inbound_queue_depth: 64,
            outbound_queue_depth: 256,
        }
    }
}

impl EngineConfig {
    /// Clamp tunables into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.window = self.window.clamp(MIN_WINDOW, MAX_WINDOW);
        self.classifier_timeout = self
            .classifier_timeout
            .clamp(MIN_CLASSIFIER_TIMEOUT, MAX_CLASSIFIER_TIMEOUT);
        self.classifier_threshold = self.classifier_threshold.clamp(0.0, 1.0);
        self.window_queue_depth = self.window_queue_depth.max(1);
        self.inbound_queue_depth = self.inbound_queue_depth.max(1);
        self.outbound_queue_depth = self.outbound_queue_depth.max(1);
        self
    }

    /// # Errors
    /// Timed capture concatenates frames, which only works for headerless PCM.
    pub fn validate(&self) -> Result<()> {
        if self.capture == CaptureKind::Timed && self.input_format == AudioFormat::Wav {
            return Err(VigilError::Config(
                "timed capture needs raw PCM input (input_format = pcm_s16le)".into(),
            ));
        }
        Ok(())
    }

    pub fn strategy(&self) -> CaptureStrategy {
        match self.capture {
            CaptureKind::PerMessage => CaptureStrategy::PerMessage,
            CaptureKind::Timed => CaptureStrategy::Timed {
                window: self.window.clamp(MIN_WINDOW, MAX_WINDOW),
            },
        }
    }
}

/// A live session as seen by its transport.
pub struct SessionHandle {
    info: SessionInfo,
    frames: mpsc::Sender<InboundFrame>,
    capture: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn display_name(&self) -> &str {
        &self.info.display_name
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Queue a frame for the capture loop. Returns false once the loop is gone.
    pub async fn push(&self, frame: InboundFrame) -> bool {
        self.frames.send(frame).await.is_ok()
    }

    /// Close the inbound queue and wait for the capture loop and worker to
    /// finish. Queued windows still drain through the worker.
    pub async fn close(self) {
        drop(self.frames);
        if let Err(e) = self.capture.await {
            warn!(session = %self.info.id, error = %e, "capture loop ended abnormally");
        }
        if let Err(e) = self.worker.await {
            warn!(session = %self.info.id, error = %e, "pipeline worker ended abnormally");
        }
    }
}

/// The top-level engine handle.
///
/// `ModerationEngine` is `Send + Sync`; wrap it in an `Arc` to share it
/// between transport handlers.
pub struct ModerationEngine {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    relay: Arc<Relay>,
    pipeline: pipeline::PipelineContext,
    announcer: Mutex<Option<JoinHandle<()>>>,
}

impl ModerationEngine {
    /// # Errors
    /// `VigilError::Config` for an unusable configuration.
    pub fn new(
        config: EngineConfig,
        transcriber: Arc<dyn Transcriber>,
        classifier: Arc<dyn ToxicityClassifier>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;

        let registry = Arc::new(SessionRegistry::new());
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let relay = Arc::new(Relay::with_diagnostics(
            config.mode,
            Arc::clone(&registry),
            Arc::clone(&diagnostics),
        ));
        let pipeline = pipeline::PipelineContext {
            transcription: TranscriptionGateway::new(
                transcriber,
                config.input_format,
                config.silence_gate.map(SilenceGate::new),
            ),
            classification: ClassificationGateway::new(classifier, config.classifier_timeout),
            relay: Arc::clone(&relay),
            registry: Arc::clone(&registry),
            sink,
            diagnostics,
        };

        info!(mode = %config.mode, capture = ?config.capture, window_ms = config.window.as_millis() as u64, "moderation engine configured");
        Ok(Self {
            config,
            registry,
            relay,
            pipeline,
            announcer: Mutex::new(None),
        })
    }

    /// Verify the speech engine before accepting connections.
    ///
    /// # Errors
    /// `VigilError::EngineNotReady`. Callers abort start-up.
    pub fn warm_up(&self) -> Result<()> {
        let engine = self.pipeline.transcription.engine();
        info!(model = engine.model_name(), "warming up speech engine");
        engine
            .warm_up()
            .map_err(|e| VigilError::EngineNotReady(format!("{}: {e}", engine.model_name())))?;
        info!(model = engine.model_name(), "speech engine ready");
        Ok(())
    }

    /// Register a participant and spawn its capture loop and worker.
    ///
    /// `outbound` is drained by the transport; everything addressed to this
    /// session goes through it. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// `VigilError::AlreadyRegistered` (not expected with fresh ids).
    pub fn connect(&self, display_name: Option<&str>, outbound: OutboundSender) -> Result<SessionHandle> {
        self.ensure_announcer();

        let id = self.registry.next_connection_id();
        let info = self.registry.register(id, display_name, outbound)?;

        let (frame_tx, frame_rx) = mpsc::channel(self.config.inbound_queue_depth);
        let (window_tx, window_rx) = mpsc::channel(self.config.window_queue_depth);

        let worker = tokio::spawn(pipeline::run_worker(self.pipeline.clone(), id, window_rx));
        let capture = tokio::spawn(
            CaptureLoop::new(
                CaptureController::new(id, self.config.strategy()),
                frame_rx,
                window_tx,
                Arc::clone(&self.relay),
                Arc::clone(&self.registry),
            )
            .run(),
        );

        Ok(SessionHandle {
            info,
            frames: frame_tx,
            capture,
            worker,
        })
    }

    /// Unregister a session and return its display name.
    ///
    /// The capture loop stops at its next suspension point and any result
    /// still in flight for this session is discarded.
    pub fn disconnect(&self, handle: SessionHandle) -> String {
        let name = self.registry.unregister(handle.id());
        // Dropping the frame sender ends the capture loop, which closes the
        // window queue and lets the worker exit.
        drop(handle);
        name
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.sessions()
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.registry.subscribe_membership()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.pipeline.diagnostics.snapshot()
    }

    /// Stop the membership announcer. Sessions wind down as their
    /// transports close.
    pub fn shutdown(&self) {
        if let Some(task) = self.announcer.lock().take() {
            task.abort();
            info!(sessions = self.registry.len(), "moderation engine shut down");
        }
    }

    fn ensure_announcer(&self) {
        let mut slot = self.announcer.lock();
        if slot.is_some() {
            return;
        }
        // Subscribe before the first register so no join is missed.
        let mut events = self.registry.subscribe_membership();
        let relay = Arc::clone(&self.relay);
        *slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let report = relay.announce(&event);
                        trace!(
                            session = %event.id,
                            change = ?event.change,
                            delivered = report.delivered.len(),
                            failed = report.failed.len(),
                            "membership announced"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "membership announcer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("membership announcer stopped");
        }));
    }
}

impl Drop for ModerationEngine {
    fn drop(&mut self) {
        if let Some(task) = self.announcer.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ToxicLabel;
    use crate::inference::StubTranscriber;
    use crate::relay::{outbound_channel, Outbound};
    use crate::telemetry::NullSink;
    use crate::wire::events::ServerEvent;
    use async_trait::async_trait;

    struct Clean;

    #[async_trait]
    impl ToxicityClassifier for Clean {
        async fn classify(&self, _text: &str) -> Result<Vec<ToxicLabel>> {
            Ok(Vec::new())
        }
    }

    fn engine(config: EngineConfig, transcriber: StubTranscriber) -> Result<ModerationEngine> {
        ModerationEngine::new(config, Arc::new(transcriber), Arc::new(Clean), Arc::new(NullSink))
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.mode, Mode::Reactive);
        assert_eq!(config.window, Duration::from_secs(4));
        assert_eq!(config.classifier_timeout, Duration::from_secs(2));
        assert!((config.classifier_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn normalized_clamps_window_and_timeout() {
        let config = EngineConfig {
            window: Duration::from_secs(60),
            classifier_timeout: Duration::from_millis(1),
            window_queue_depth: 0,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(config.window, MAX_WINDOW);
        assert_eq!(config.classifier_timeout, MIN_CLASSIFIER_TIMEOUT);
        assert_eq!(config.window_queue_depth, 1);

        let short = EngineConfig {
            window: Duration::from_millis(10),
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(short.window, MIN_WINDOW);
    }

    #[test]
    fn timed_capture_rejects_wav_input() {
        let config = EngineConfig {
            capture: CaptureKind::Timed,
            input_format: AudioFormat::Wav,
            ..EngineConfig::default()
        };
        assert!(matches!(
            engine(config, StubTranscriber::new()),
            Err(VigilError::Config(_))
        ));
    }

    struct Unloadable;

    impl Transcriber for Unloadable {
        fn warm_up(&self) -> Result<()> {
            Err(VigilError::ModelNotFound {
                path: "models/ggml-base.en.bin".into(),
            })
        }

        fn transcribe(&self, _audio: &crate::audio::PcmBuffer) -> Result<String> {
            Ok(String::new())
        }

        fn model_name(&self) -> &str {
            "unloadable"
        }
    }

    #[test]
    fn warm_up_failure_is_reported_as_not_ready() {
        let engine = ModerationEngine::new(
            EngineConfig::default(),
            Arc::new(Unloadable),
            Arc::new(Clean),
            Arc::new(NullSink),
        )
        .unwrap();
        let err = engine.warm_up().unwrap_err();
        assert!(matches!(err, VigilError::EngineNotReady(ref msg) if msg.starts_with("unloadable")));
    }

    #[test]
    fn stub_warms_up() {
        let engine = engine(EngineConfig::default(), StubTranscriber::new()).unwrap();
        assert!(engine.warm_up().is_ok());
    }

    #[tokio::test]
    async fn connect_announces_membership() {
        let engine = engine(EngineConfig::default(), StubTranscriber::new()).unwrap();
        let (tx, mut rx) = outbound_channel(16);
        let handle = engine.connect(Some("ana"), tx).unwrap();
        assert_eq!(handle.display_name(), "ana");
        assert_eq!(engine.sessions().len(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first, Outbound::Event(ServerEvent::system("ana joined")));
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second,
            Outbound::Event(ServerEvent::UserList {
                users: vec!["ana".into()]
            })
        );

        assert_eq!(engine.disconnect(handle), "ana");
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn blank_name_defaults_to_anonymous() {
        let engine = engine(EngineConfig::default(), StubTranscriber::new()).unwrap();
        let (tx, _rx) = outbound_channel(16);
        let handle = engine.connect(Some("   "), tx).unwrap();
        assert_eq!(handle.display_name(), crate::session::DEFAULT_DISPLAY_NAME);
        handle.close().await;
    }
}
