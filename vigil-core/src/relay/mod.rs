//! Relay/broadcast stage.
//!
//! Every session owns a bounded outbound queue drained by its transport task.
//! The relay never writes to a socket itself: it snapshots the registry and
//! `try_send`s into each queue, so one slow or departed recipient can neither
//! block nor abort delivery to the others. Each attempt is recorded in a
//! [`DeliveryReport`]. Failed sends are counted into the shared
//! [`PipelineDiagnostics`] before the report is returned. The relay never
//! evicts a session; only transport disconnects unregister.
//!
//! Mode wiring lives here. In `Reactive` mode raw audio is forwarded on
//! arrival via [`Relay::forward_live`] and [`Relay::deliver`] only pushes the
//! notification. In `Preventive` mode audio leaves only through `deliver`
//! after an `Allow` decision.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::buffering::chunk::AudioChunk;
use crate::engine::PipelineDiagnostics;
use crate::moderation::{Decision, Mode, ModerationOutcome};
use crate::session::{ConnectionId, MembershipChange, MembershipEvent, Recipient, SessionRegistry};
use crate::wire::events::{ModerationNotice, NoticeAction, ServerEvent, StatusKind};

/// A frame queued for one recipient.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Binary audio originating from `from`.
    Audio { from: ConnectionId, bytes: Arc<[u8]> },
    /// A JSON text frame.
    Event(ServerEvent),
}

pub type OutboundSender = mpsc::Sender<Outbound>;
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

pub fn outbound_channel(depth: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(depth.max(1))
}

/// Why a single send did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The recipient's transport is gone.
    Departed,
    /// The recipient's queue is full.
    Backlogged,
}

/// Per-recipient results of one relay call.
#[must_use]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, SendFailure)>,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempts(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    fn record(&mut self, id: ConnectionId, result: Result<(), SendFailure>) {
        match result {
            Ok(()) => self.delivered.push(id),
            Err(failure) => self.failed.push((id, failure)),
        }
    }
}

pub struct Relay {
    mode: Mode,
    registry: Arc<SessionRegistry>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl Relay {
    pub fn new(mode: Mode, registry: Arc<SessionRegistry>) -> Self {
        Self::with_diagnostics(mode, registry, Arc::default())
    }

    pub fn with_diagnostics(
        mode: Mode,
        registry: Arc<SessionRegistry>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            mode,
            registry,
            diagnostics,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn diagnostics(&self) -> &Arc<PipelineDiagnostics> {
        &self.diagnostics
    }

    /// Forward freshly captured bytes to everyone else, before classification.
    ///
    /// `opens_burst` marks the first frame of a speaking burst; only that
    /// frame is preceded by `speaking_start`. A no-op in `Preventive` mode,
    /// where audio waits for a decision.
    pub fn forward_live(&self, sender: ConnectionId, bytes: Arc<[u8]>, opens_burst: bool) -> DeliveryReport {
        if !self.mode.delivers_live() {
            return DeliveryReport::default();
        }
        let Some(name) = self.registry.display_name(sender) else {
            return DeliveryReport::default();
        };
        let report = self.fan_out_audio(sender, &name, bytes, opens_burst);
        self.settle("live audio", sender, &report);
        report
    }

    /// Act on a moderation decision for `chunk`, spoken by `sender`.
    pub fn deliver(&self, chunk: &AudioChunk, sender: &Recipient, decision: &Decision) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        match &decision.outcome {
            ModerationOutcome::Block { labels, .. } => {
                let joined = labels.join(", ");
                report.record(
                    sender.id,
                    send(sender, ServerEvent::status(StatusKind::Toxic, format!("Blocked: {joined}"))),
                );
                let notice = ServerEvent::System {
                    message: format!("Message from {} was blocked ({joined})", sender.display_name),
                    moderation: Some(ModerationNotice {
                        action: NoticeAction::Blocked,
                        speaker: sender.display_name.clone(),
                        labels: labels.clone(),
                        text: None,
                    }),
                };
                report.merge(self.broadcast(&notice, None));
            }
            ModerationOutcome::Allow { text } => {
                if !self.mode.delivers_live() {
                    report.merge(self.fan_out_audio(sender.id, &sender.display_name, chunk.shared_bytes(), true));
                }

                if decision.is_flagged() {
                    let joined = decision.flagged_labels.join(", ");
                    report.record(
                        sender.id,
                        send(sender, ServerEvent::status(StatusKind::Flagged, format!("Flagged: {joined}"))),
                    );
                    let alert = ServerEvent::System {
                        message: format!("{} was flagged for {joined}: \"{text}\"", sender.display_name),
                        moderation: Some(ModerationNotice {
                            action: NoticeAction::Flagged,
                            speaker: sender.display_name.clone(),
                            labels: decision.flagged_labels.clone(),
                            text: Some(text.clone()),
                        }),
                    };
                    report.merge(self.broadcast(&alert, None));
                } else {
                    let verb = if self.mode.delivers_live() { "Heard" } else { "Sent" };
                    report.record(
                        sender.id,
                        send(sender, ServerEvent::status(StatusKind::Safe, format!("{verb}: {text}"))),
                    );
                }
            }
        }

        self.settle("moderation", sender.id, &report);
        report
    }

    /// Tell everyone about a join or leave, then push the new user list.
    pub fn announce(&self, event: &MembershipEvent) -> DeliveryReport {
        let message = match event.change {
            MembershipChange::Joined => format!("{} joined", event.display_name),
            MembershipChange::Left => format!("{} left", event.display_name),
        };
        let mut report = self.broadcast(&ServerEvent::system(message), None);
        report.merge(self.broadcast(
            &ServerEvent::UserList {
                users: event.users.clone(),
            },
            None,
        ));
        self.settle("membership", event.id, &report);
        report
    }

    /// Optionally `speaking_start` to everyone, then the audio to everyone
    /// but the speaker.
    fn fan_out_audio(
        &self,
        sender: ConnectionId,
        sender_name: &str,
        bytes: Arc<[u8]>,
        announce: bool,
    ) -> DeliveryReport {
        let recipients = self.registry.recipients();
        let mut report = DeliveryReport::default();
        if announce {
            let speaking = ServerEvent::SpeakingStart {
                user: sender_name.to_string(),
            };
            for recipient in &recipients {
                report.record(recipient.id, send(recipient, speaking.clone()));
            }
        }
        for recipient in recipients.iter().filter(|r| r.id != sender) {
            let frame = Outbound::Audio {
                from: sender,
                bytes: Arc::clone(&bytes),
            };
            report.record(recipient.id, try_send(recipient, frame));
        }
        report
    }

    fn broadcast(&self, event: &ServerEvent, exclude: Option<ConnectionId>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for recipient in self.registry.recipients() {
            if Some(recipient.id) == exclude {
                continue;
            }
            report.record(recipient.id, send(&recipient, event.clone()));
        }
        report
    }

    /// Count failed sends and log each one. A departed recipient is routine
    /// (its disconnect is already under way); a backlogged one lost a frame.
    fn settle(&self, what: &str, origin: ConnectionId, report: &DeliveryReport) {
        if report.is_clean() {
            trace!(origin = %origin, delivered = report.delivered.len(), "{what} relayed");
            return;
        }
        self.diagnostics
            .delivery_failures
            .fetch_add(report.failed.len(), Ordering::Relaxed);
        for (recipient, failure) in &report.failed {
            match failure {
                SendFailure::Departed => {
                    debug!(origin = %origin, recipient = %recipient, "{what}: recipient departed")
                }
                SendFailure::Backlogged => {
                    warn!(origin = %origin, recipient = %recipient, "{what}: recipient backlogged, frame dropped")
                }
            }
        }
    }
}

fn send(recipient: &Recipient, event: ServerEvent) -> Result<(), SendFailure> {
    try_send(recipient, Outbound::Event(event))
}

fn try_send(recipient: &Recipient, frame: Outbound) -> Result<(), SendFailure> {
    recipient.outbound.try_send(frame).map_err(|e| match e {
        TrySendError::Full(_) => SendFailure::Backlogged,
        TrySendError::Closed(_) => SendFailure::Departed,
    })
}
