//! Capture loop controller.
//!
//! One [`CaptureController`] per session turns inbound transport frames into
//! [`AudioChunk`]s:
//!
//! ```text
//!   Idle ──start──▶ Capturing ──window elapsed──▶ Draining ──handoff──▶ Capturing …
//!     ▲                 │                                                  │
//!     └──── stop ───────┴─────────────── disconnect (terminal) ───────────┘
//! ```
//!
//! The controller is synchronous and owns the open window. [`CaptureLoop`]
//! drives it from the transport's frame queue and a window timer, handing
//! each closed chunk to the session's pipeline worker without waiting for it
//! to be moderated. When the worker's queue is full the hand-off waits for a
//! free slot: the loop stops reading frames, the transport's inbound queue
//! fills, and the socket reader slows down. No window is ever dropped
//! unmoderated while the session is connected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::buffering::{chunk::AudioChunk, CaptureWindow};
use crate::relay::Relay;
use crate::session::{ConnectionId, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Draining,
}

/// How inbound audio is sliced into windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// Every inbound binary frame is one complete window.
    PerMessage,
    /// Frames are appended to a window that closes every `window`.
    Timed { window: Duration },
}

/// A frame arriving from the transport for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Audio(Vec<u8>),
    Start,
    Stop,
}

pub struct CaptureController {
    session: ConnectionId,
    strategy: CaptureStrategy,
    state: CaptureState,
    window: Option<CaptureWindow>,
    next_seq: u64,
    terminated: bool,
}

impl CaptureController {
    pub fn new(session: ConnectionId, strategy: CaptureStrategy) -> Self {
        Self {
            session,
            strategy,
            state: CaptureState::Idle,
            window: None,
            next_seq: 1,
            terminated: false,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn strategy(&self) -> CaptureStrategy {
        self.strategy
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Bytes held by the open window.
    pub fn buffered(&self) -> usize {
        self.window.as_ref().map_or(0, CaptureWindow::len)
    }

    /// Idle → Capturing. Returns false when already capturing or terminated.
    pub fn start(&mut self) -> bool {
        if self.terminated || self.state != CaptureState::Idle {
            return false;
        }
        if matches!(self.strategy, CaptureStrategy::Timed { .. }) {
            self.open_window();
        }
        self.state = CaptureState::Capturing;
        debug!(session = %self.session, "capture started");
        true
    }

    /// Feed transport bytes.
    ///
    /// Per-message capture returns a finished chunk for every non-empty
    /// frame. Timed capture appends to the open window and returns `None`.
    /// Bytes arriving while idle are dropped.
    pub fn ingest(&mut self, bytes: &[u8]) -> Option<AudioChunk> {
        if self.terminated || bytes.is_empty() {
            return None;
        }
        match self.strategy {
            CaptureStrategy::PerMessage if self.state != CaptureState::Capturing => {
                trace!(session = %self.session, len = bytes.len(), "audio while idle dropped");
                None
            }
            CaptureStrategy::PerMessage => {
                let mut window = CaptureWindow::open(self.session, self.take_seq());
                window.append(bytes);
                window.close()
            }
            CaptureStrategy::Timed { .. } => {
                match (self.state, self.window.as_mut()) {
                    (CaptureState::Capturing, Some(window)) => window.append(bytes),
                    _ => trace!(session = %self.session, len = bytes.len(), "audio while idle dropped"),
                }
                None
            }
        }
    }

    /// Capturing → Draining. Returns the closed window, or `None` if it was
    /// empty. Call [`reopen`](Self::reopen) once the chunk has been handed off.
    pub fn drain(&mut self) -> Option<AudioChunk> {
        if self.state != CaptureState::Capturing {
            return None;
        }
        self.state = CaptureState::Draining;
        self.window.take().and_then(CaptureWindow::close)
    }

    /// Draining → Capturing with a fresh window.
    pub fn reopen(&mut self) {
        if self.state == CaptureState::Draining && !self.terminated {
            self.open_window();
            self.state = CaptureState::Capturing;
        }
    }

    /// Explicit stop: the open window is closed and returned, then Idle.
    pub fn stop(&mut self) -> Option<AudioChunk> {
        if self.state == CaptureState::Idle {
            return None;
        }
        self.state = CaptureState::Idle;
        debug!(session = %self.session, "capture stopped");
        self.window.take().and_then(CaptureWindow::close)
    }

    /// Transport went away: the partial window is discarded and the
    /// controller stays Idle for good. Returns the number of bytes dropped.
    pub fn disconnect(&mut self) -> usize {
        let dropped = self.buffered();
        self.window = None;
        self.state = CaptureState::Idle;
        self.terminated = true;
        dropped
    }

    fn open_window(&mut self) {
        let seq = self.take_seq();
        self.window = Some(CaptureWindow::open(self.session, seq));
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Async driver for one session's [`CaptureController`].
pub struct CaptureLoop {
    controller: CaptureController,
    frames: mpsc::Receiver<InboundFrame>,
    chunks: mpsc::Sender<AudioChunk>,
    relay: Arc<Relay>,
    registry: Arc<SessionRegistry>,
    /// `speaking_start` already went out for the open window.
    speaking: bool,
    live_failures: usize,
}

impl CaptureLoop {
    pub fn new(
        controller: CaptureController,
        frames: mpsc::Receiver<InboundFrame>,
        chunks: mpsc::Sender<AudioChunk>,
        relay: Arc<Relay>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            controller,
            frames,
            chunks,
            relay,
            registry,
            speaking: false,
            live_failures: 0,
        }
    }

    /// Run until the transport closes its frame queue.
    ///
    /// Per-message capture starts immediately. Timed capture waits for an
    /// explicit [`InboundFrame::Start`].
    pub async fn run(mut self) {
        let session = self.controller.session;
        let mut ticker: Option<Interval> = None;

        if self.controller.strategy == CaptureStrategy::PerMessage {
            self.begin(&mut ticker);
        }

        loop {
            tokio::select! {
                frame = self.frames.recv() => match frame {
                    Some(InboundFrame::Audio(bytes)) => self.on_audio(bytes).await,
                    Some(InboundFrame::Start) => self.begin(&mut ticker),
                    Some(InboundFrame::Stop) => {
                        ticker = None;
                        self.speaking = false;
                        if let Some(chunk) = self.controller.stop() {
                            self.hand_off(chunk).await;
                        }
                        self.registry.set_recording(session, false);
                    }
                    None => break,
                },
                _ = next_tick(&mut ticker), if ticker.is_some() => {
                    self.speaking = false;
                    if let Some(chunk) = self.controller.drain() {
                        self.hand_off(chunk).await;
                    } else {
                        trace!(session = %session, "empty window skipped");
                    }
                    self.controller.reopen();
                }
            }
        }

        let dropped = self.controller.disconnect();
        info!(
            session = %session,
            dropped_bytes = dropped,
            live_failures = self.live_failures,
            "capture loop finished"
        );
    }

    fn begin(&mut self, ticker: &mut Option<Interval>) {
        if !self.controller.start() {
            return;
        }
        if let CaptureStrategy::Timed { window } = self.controller.strategy {
            let mut interval = time::interval_at(Instant::now() + window, window);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *ticker = Some(interval);
        }
        self.registry.set_recording(self.controller.session, true);
    }

    async fn on_audio(&mut self, bytes: Vec<u8>) {
        let live = self.relay.mode().delivers_live()
            && self.controller.state() == CaptureState::Capturing;

        match self.controller.ingest(&bytes) {
            Some(chunk) => {
                if live {
                    // A per-message frame is a whole utterance.
                    self.forward_live(chunk.shared_bytes(), true);
                }
                self.hand_off(chunk).await;
            }
            None => {
                if live && !bytes.is_empty() {
                    let opens_burst = !self.speaking;
                    self.forward_live(Arc::from(bytes), opens_burst);
                    self.speaking = true;
                }
            }
        }
    }

    fn forward_live(&mut self, bytes: Arc<[u8]>, opens_burst: bool) {
        let report = self
            .relay
            .forward_live(self.controller.session, bytes, opens_burst);
        self.live_failures += report.failed.len();
    }

    /// Waits for room in the pipeline queue.
    async fn hand_off(&self, chunk: AudioChunk) {
        let session = chunk.session();
        let seq = chunk.seq();
        if self.chunks.capacity() == 0 {
            debug!(session = %session, seq, "pipeline backlog full, capture waiting");
        }
        match self.chunks.send(chunk).await {
            Ok(()) => trace!(session = %session, seq, "window handed to pipeline"),
            Err(_) => debug!(session = %session, seq, "pipeline gone, window discarded"),
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
