//! Session registry: the single source of truth for "who receives broadcasts".
//!
//! Membership mutations are serialised behind a `parking_lot::RwLock` write
//! guard. Every read used for fan-out returns an owned snapshot, so callers
//! iterate a point-in-time copy and never hold the lock across a send.
//!
//! Each change publishes a [`MembershipEvent`] on a `tokio::sync::broadcast`
//! channel. The event is sent while the write guard is held, so subscribers
//! observe joins and leaves in the same order the registry applied them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Result, VigilError};
use crate::relay::OutboundSender;

/// Display name used when a client does not supply one.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";
/// Identity returned when unregistering a connection the registry never saw.
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

const MAX_DISPLAY_NAME_CHARS: usize = 64;
const MEMBERSHIP_CHANNEL_CAP: usize = 256;

/// Opaque handle for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connected participant.
#[derive(Debug)]
struct Session {
    display_name: String,
    joined_at: DateTime<Utc>,
    recording_enabled: bool,
    outbound: OutboundSender,
}

/// Owned, serialisable view of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub recording_enabled: bool,
}

/// A fan-out target taken from a registry snapshot.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: ConnectionId,
    pub display_name: String,
    pub outbound: OutboundSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Joined,
    Left,
}

/// Published after every successful register/unregister.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipEvent {
    pub change: MembershipChange,
    pub id: ConnectionId,
    pub display_name: String,
    /// Display names of everyone connected after the change, in join order.
    pub users: Vec<String>,
}

/// Shared, mutable set of connected participants.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    next_id: AtomicU64,
    membership_tx: broadcast::Sender<MembershipEvent>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (membership_tx, _) = broadcast::channel(MEMBERSHIP_CHANNEL_CAP);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            membership_tx,
        }
    }

    /// Allocate a fresh, never-reused connection handle.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a session.
    ///
    /// # Errors
    /// `VigilError::AlreadyRegistered` if `id` is already present. Reconnects
    /// must unregister the old connection first.
    pub fn register(
        &self,
        id: ConnectionId,
        display_name: Option<&str>,
        outbound: OutboundSender,
    ) -> Result<SessionInfo> {
        let display_name = normalize_display_name(display_name);
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(VigilError::AlreadyRegistered(id));
        }

        let session = Session {
            display_name: display_name.clone(),
            joined_at: Utc::now(),
            recording_enabled: false,
            outbound,
        };
        let info = SessionInfo {
            id,
            display_name: display_name.clone(),
            joined_at: session.joined_at,
            recording_enabled: false,
        };
        sessions.insert(id, session);

        info!(session = %id, name = %display_name, total = sessions.len(), "session registered");
        let _ = self.membership_tx.send(MembershipEvent {
            change: MembershipChange::Joined,
            id,
            display_name,
            users: users_in_join_order(&sessions),
        });
        Ok(info)
    }

    /// Remove a session and return its display name.
    ///
    /// Unknown connections are a no-op returning [`UNKNOWN_DISPLAY_NAME`].
    pub fn unregister(&self, id: ConnectionId) -> String {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.remove(&id) else {
            debug!(session = %id, "unregister of unknown connection");
            return UNKNOWN_DISPLAY_NAME.to_string();
        };

        info!(session = %id, name = %session.display_name, total = sessions.len(), "session unregistered");
        let _ = self.membership_tx.send(MembershipEvent {
            change: MembershipChange::Left,
            id,
            display_name: session.display_name.clone(),
            users: users_in_join_order(&sessions),
        });
        session.display_name
    }

    /// Point-in-time `(connection, display name)` pairs, ordered by connection.
    pub fn list_sessions(&self) -> Vec<(ConnectionId, String)> {
        let sessions = self.sessions.read();
        let mut out: Vec<_> = sessions
            .iter()
            .map(|(id, s)| (*id, s.display_name.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Full snapshot for observability endpoints.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read();
        let mut out: Vec<_> = sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                id: *id,
                display_name: s.display_name.clone(),
                joined_at: s.joined_at,
                recording_enabled: s.recording_enabled,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Snapshot of every fan-out target.
    pub fn recipients(&self) -> Vec<Recipient> {
        let sessions = self.sessions.read();
        let mut out: Vec<_> = sessions
            .iter()
            .map(|(id, s)| Recipient {
                id: *id,
                display_name: s.display_name.clone(),
                outbound: s.outbound.clone(),
            })
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn recipient(&self, id: ConnectionId) -> Option<Recipient> {
        self.sessions.read().get(&id).map(|s| Recipient {
            id,
            display_name: s.display_name.clone(),
            outbound: s.outbound.clone(),
        })
    }

    pub fn display_name(&self, id: ConnectionId) -> Option<String> {
        self.sessions.read().get(&id).map(|s| s.display_name.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Flip the recording flag. Returns `false` for unknown connections.
    pub fn set_recording(&self, id: ConnectionId, enabled: bool) -> bool {
        match self.sessions.write().get_mut(&id) {
            Some(session) => {
                session.recording_enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn users_in_join_order(sessions: &HashMap<ConnectionId, Session>) -> Vec<String> {
    let mut entries: Vec<_> = sessions.iter().collect();
    entries.sort_by_key(|(id, s)| (s.joined_at, **id));
    entries
        .into_iter()
        .map(|(_, s)| s.display_name.clone())
        .collect()
}

fn normalize_display_name(raw: Option<&str>) -> String {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return DEFAULT_DISPLAY_NAME.to_string();
    }
    trimmed.chars().take(MAX_DISPLAY_NAME_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Outbound;
    use tokio::sync::mpsc;

    fn outbound() -> (OutboundSender, mpsc::Receiver<Outbound>) {
        mpsc::channel(8)
    }

    #[test]
    fn register_then_list() {
        let registry = SessionRegistry::new();
        let a = registry.next_connection_id();
        let b = registry.next_connection_id();
        registry.register(a, Some("ana"), outbound().0).unwrap();
        registry.register(b, Some("bob"), outbound().0).unwrap();

        assert_eq!(
            registry.list_sessions(),
            vec![(a, "ana".to_string()), (b, "bob".to_string())]
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_register_is_an_error() {
        let registry = SessionRegistry::new();
        let id = registry.next_connection_id();
        registry.register(id, Some("ana"), outbound().0).unwrap();
        let err = registry.register(id, Some("imposter"), outbound().0).unwrap_err();
        assert!(matches!(err, VigilError::AlreadyRegistered(dup) if dup == id));
        assert_eq!(registry.display_name(id).as_deref(), Some("ana"));
    }

    #[test]
    fn unregister_unknown_returns_sentinel() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.unregister(ConnectionId::new(99)), UNKNOWN_DISPLAY_NAME);
    }

    #[test]
    fn unregister_returns_display_name() {
        let registry = SessionRegistry::new();
        let id = registry.next_connection_id();
        registry.register(id, Some("ana"), outbound().0).unwrap();
        assert_eq!(registry.unregister(id), "ana");
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn blank_name_defaults_to_anonymous() {
        let registry = SessionRegistry::new();
        let a = registry.next_connection_id();
        let b = registry.next_connection_id();
        registry.register(a, None, outbound().0).unwrap();
        registry.register(b, Some("   "), outbound().0).unwrap();
        assert_eq!(registry.display_name(a).as_deref(), Some(DEFAULT_DISPLAY_NAME));
        assert_eq!(registry.display_name(b).as_deref(), Some(DEFAULT_DISPLAY_NAME));
    }

    #[test]
    fn snapshot_is_detached_from_live_registry() {
        let registry = SessionRegistry::new();
        let a = registry.next_connection_id();
        registry.register(a, Some("ana"), outbound().0).unwrap();
        let snapshot = registry.recipients();
        registry.unregister(a);
        assert_eq!(snapshot.len(), 1);
        assert!(registry.recipients().is_empty());
    }

    #[test]
    fn membership_events_follow_mutations() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe_membership();
        let a = registry.next_connection_id();
        let b = registry.next_connection_id();
        registry.register(a, Some("ana"), outbound().0).unwrap();
        registry.register(b, Some("bob"), outbound().0).unwrap();
        registry.unregister(a);
        registry.unregister(a);

        let joined = rx.try_recv().unwrap();
        assert_eq!(joined.change, MembershipChange::Joined);
        assert_eq!(joined.users, vec!["ana"]);

        let joined = rx.try_recv().unwrap();
        assert_eq!(joined.display_name, "bob");
        assert_eq!(joined.users, vec!["ana", "bob"]);

        let left = rx.try_recv().unwrap();
        assert_eq!(left.change, MembershipChange::Left);
        assert_eq!(left.id, a);
        assert_eq!(left.users, vec!["bob"]);

        assert!(rx.try_recv().is_err(), "unknown unregister publishes nothing");
    }

    #[test]
    fn recording_flag_toggles() {
        let registry = SessionRegistry::new();
        let a = registry.next_connection_id();
        registry.register(a, Some("ana"), outbound().0).unwrap();
        assert!(registry.set_recording(a, true));
        assert!(registry.sessions()[0].recording_enabled);
        assert!(!registry.set_recording(ConnectionId::new(77), true));
    }

    #[test]
    fn long_names_are_truncated() {
        let registry = SessionRegistry::new();
        let a = registry.next_connection_id();
        let long = "x".repeat(200);
        registry.register(a, Some(&long), outbound().0).unwrap();
        assert_eq!(registry.display_name(a).unwrap().chars().count(), 64);
    }
}
