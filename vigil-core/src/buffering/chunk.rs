//! Immutable audio chunk handed from a closed capture window to the pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::session::ConnectionId;

/// Raw bytes of one closed capture window.
///
/// The session reference is a lookup key only: a chunk never keeps its
/// session alive, and the pipeline re-checks the registry before delivering.
/// Bytes live behind an `Arc` so fan-out and the blocking transcription
/// thread can share them without copying.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    bytes: Arc<[u8]>,
    session: ConnectionId,
    /// Monotonic per-session window number, starting at 1.
    seq: u64,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl AudioChunk {
    pub fn new(
        bytes: impl Into<Arc<[u8]>>,
        session: ConnectionId,
        seq: u64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            session,
            seq,
            started_at,
            ended_at,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared handle to the bytes, for relaying without a copy.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn session(&self) -> ConnectionId {
        self.session
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
