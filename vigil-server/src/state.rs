//! Shared application state, cloned into every axum handler.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Instant;

use serde::Serialize;
use vigil_core::{DiagnosticsSnapshot, ModerationEngine};

use crate::settings::ServerSettings;
use crate::storage::UtteranceStore;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ModerationEngine>,
    pub settings: Arc<ServerSettings>,
    /// Present when `sqlitePath` is configured.
    pub store: Option<Arc<UtteranceStore>>,
    pub transport: Arc<TransportCounters>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        engine: Arc<ModerationEngine>,
        settings: ServerSettings,
        store: Option<Arc<UtteranceStore>>,
    ) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            store,
            transport: Arc::new(TransportCounters::default()),
            started_at: Instant::now(),
        }
    }

    pub fn diagnostics_snapshot(&self) -> AppDiagnostics {
        AppDiagnostics {
            connections_accepted: self.transport.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.transport.connections_rejected.load(Ordering::Relaxed),
            audio_frames_in: self.transport.audio_frames_in.load(Ordering::Relaxed),
            control_frames_in: self.transport.control_frames_in.load(Ordering::Relaxed),
            active_sessions: self.engine.registry().len(),
            pipeline: self.engine.diagnostics_snapshot(),
        }
    }
}

/// Counters owned by the WebSocket transport.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub connections_accepted: AtomicUsize,
    pub connections_rejected: AtomicUsize,
    pub audio_frames_in: AtomicUsize,
    pub control_frames_in: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiagnostics {
    pub connections_accepted: usize,
    pub connections_rejected: usize,
    pub audio_frames_in: usize,
    pub control_frames_in: usize,
    pub active_sessions: usize,
    pub pipeline: DiagnosticsSnapshot,
}
