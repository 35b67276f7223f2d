//! Capture-window buffer.
//!
//! A `CaptureWindow` accumulates one speaker's raw bytes over a bounded time
//! slice. Closing it consumes the window and yields an immutable
//! [`AudioChunk`]; a window is never reopened after it has been handed off.

pub mod chunk;

use chrono::{DateTime, Utc};

use crate::session::ConnectionId;
use chunk::AudioChunk;

/// Initial allocation for a window: 4 s of 16 kHz mono s16le.
const WINDOW_CAPACITY_HINT: usize = 128 * 1024;

/// An open capture window for one session.
#[derive(Debug)]
pub struct CaptureWindow {
    session: ConnectionId,
    seq: u64,
    opened_at: DateTime<Utc>,
    buf: Vec<u8>,
}

impl CaptureWindow {
    pub fn open(session: ConnectionId, seq: u64) -> Self {
        Self {
            session,
            seq,
            opened_at: Utc::now(),
            buf: Vec::with_capacity(WINDOW_CAPACITY_HINT),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Close the window. Returns `None` when nothing was captured.
    pub fn close(self) -> Option<AudioChunk> {
        if self.buf.is_empty() {
            return None;
        }
        Some(AudioChunk::new(
            self.buf,
            self.session,
            self.seq,
            self.opened_at,
            Utc::now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_yields_chunk_with_all_bytes() {
        let mut window = CaptureWindow::open(ConnectionId::new(3), 7);
        window.append(&[1, 2, 3]);
        window.append(&[4]);
        let chunk = window.close().expect("non-empty window");
        assert_eq!(chunk.bytes(), &[1, 2, 3, 4]);
        assert_eq!(chunk.session(), ConnectionId::new(3));
        assert_eq!(chunk.seq(), 7);
        assert!(chunk.ended_at() >= chunk.started_at());
    }

    #[test]
    fn empty_window_closes_to_nothing() {
        let window = CaptureWindow::open(ConnectionId::new(1), 1);
        assert!(window.close().is_none());
    }

    #[test]
    fn shared_bytes_do_not_copy() {
        let mut window = CaptureWindow::open(ConnectionId::new(1), 1);
        window.append(&[9; 32]);
        let chunk = window.close().expect("chunk");
        let a = chunk.shared_bytes();
        let b = chunk.shared_bytes();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
