//! Structured status/event messages sent to clients alongside binary audio.
//!
//! | `type` | Audience | Meaning |
//! |--------|----------|---------|
//! | `status` | the speaker only | outcome of the speaker's own utterance |
//! | `system` | everyone | joins, leaves, block notices, toxicity alerts |
//! | `user_list` | everyone | display names currently connected |
//! | `speaking_start` | everyone | audio from `user` follows |

use serde::{Deserialize, Serialize};

/// One JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        status: StatusKind,
        message: String,
    },
    System {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        moderation: Option<ModerationNotice>,
    },
    UserList {
        users: Vec<String>,
    },
    SpeakingStart {
        user: String,
    },
}

impl ServerEvent {
    pub fn system(message: impl Into<String>) -> Self {
        ServerEvent::System {
            message: message.into(),
            moderation: None,
        }
    }

    pub fn status(status: StatusKind, message: impl Into<String>) -> Self {
        ServerEvent::Status {
            status,
            message: message.into(),
        }
    }
}

/// Outcome reported to the speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Delivered (or heard) without labels.
    Safe,
    /// Blocked before delivery.
    Toxic,
    /// Already heard, publicly flagged afterwards.
    Flagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeAction {
    Blocked,
    Flagged,
}

/// Machine-readable detail attached to public moderation notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationNotice {
    pub action: NoticeAction,
    pub speaker: String,
    pub labels: Vec<String>,
    /// Present on flag alerts only; block notices never repeat the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
