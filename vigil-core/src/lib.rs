//! # vigil-core
//!
//! Real-time voice moderation engine.
//!
//! ## Architecture
//!
//! ```text
//! transport frames ─► CaptureLoop (per session) ──live bytes (REACTIVE)──► Relay
//!                          │
//!                     AudioChunk queue
//!                          │
//!                  pipeline worker (per session)
//!                          │
//!        TranscriptionGateway (spawn_blocking) ─► ClassificationGateway (timeout)
//!                          │
//!                  moderation::decide ─► Relay::deliver ─► per-session outbound queues
//!                          │
//!                    TelemetrySink
//! ```
//!
//! Sessions never block each other: each has its own capture loop, worker and
//! outbound queue. The [`session::SessionRegistry`] is the only shared
//! mutable state and is consulted at every broadcast.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod classify;
pub mod engine;
pub mod error;
pub mod inference;
pub mod moderation;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod vad;
pub mod wire;

// Convenience re-exports for downstream crates
pub use capture::InboundFrame;
pub use classify::{http::HttpClassifier, ToxicLabel, ToxicityClassifier};
pub use engine::{CaptureKind, DiagnosticsSnapshot, EngineConfig, ModerationEngine, SessionHandle};
pub use error::{Result, VigilError};
pub use inference::{StubTranscriber, Transcriber};
pub use moderation::{Decision, Mode, ModerationOutcome};
pub use relay::{outbound_channel, Outbound, OutboundReceiver, OutboundSender};
pub use session::{ConnectionId, SessionInfo};
pub use telemetry::{CsvSink, MemorySink, NullSink, TelemetrySink, UtteranceRecord};
pub use wire::events::ServerEvent;

#[cfg(feature = "whisper")]
pub use inference::{WhisperConfig, WhisperTranscriber};
