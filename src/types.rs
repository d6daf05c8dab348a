//! Common types used throughout the pairing service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque unique identifier for participants
pub type ParticipantId = String;

/// Unique identifier for conversations
pub type ConversationId = Uuid;

/// Handle shown to a peer when the participant has not registered a username
pub const ANONYMOUS_HANDLE: &str = "stranger";

/// Identifier of a single live connection, used to tell a stale handler from a newer one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A participant known to the pairing engine
///
/// A participant without a live connection is still valid and can re-join
/// the waiting queue once it reconnects.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    /// Persistent handle, empty until registered
    pub username: Option<String>,
    pub last_skip_at: Option<Instant>,
    /// Back reference to the connection owned by the registry
    pub connection: Option<ConnectionId>,
    /// When the last connection went away, if currently disconnected
    pub disconnected_at: Option<Instant>,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            username: None,
            last_skip_at: None,
            connection: None,
            disconnected_at: Some(Instant::now()),
            created_at: Utc::now(),
        }
    }

    /// Handle revealed to peers: the username if registered, otherwise a generic one
    pub fn display_handle(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| ANONYMOUS_HANDLE.to_string())
    }

    pub fn is_registered(&self) -> bool {
        self.username.is_some()
    }
}

/// What to do with a conversation when one side loses its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// The disconnected participant stays in the conversation until expiry or skip
    #[default]
    KeepUntilRoundEnds,
    /// Tear the conversation down at once and requeue the remaining peer
    EndRound,
}

impl std::fmt::Display for DisconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectPolicy::KeepUntilRoundEnds => write!(f, "keep_until_round_ends"),
            DisconnectPolicy::EndRound => write!(f, "end_round"),
        }
    }
}

impl std::str::FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "keep_until_round_ends" | "keep" => Ok(DisconnectPolicy::KeepUntilRoundEnds),
            "end_round" | "end" => Ok(DisconnectPolicy::EndRound),
            other => Err(format!("unknown disconnect policy: {}", other)),
        }
    }
}

/// Why a conversation was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    Expired,
    Skipped,
    Disconnected,
}

impl TeardownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownReason::Expired => "expired",
            TeardownReason::Skipped => "skipped",
            TeardownReason::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages pushed from the server to a participant's connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent on every successful connect, before any pairing
    Welcome {
        participant_id: ParticipantId,
        handle: String,
        timestamp: DateTime<Utc>,
    },
    Paired {
        conversation_id: ConversationId,
        peer_handle: String,
        expires_at: DateTime<Utc>,
    },
    TimeUp {
        conversation_id: ConversationId,
    },
    PeerLeft {
        conversation_id: ConversationId,
    },
    Chat {
        conversation_id: ConversationId,
        sender_handle: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    SkipRejected {
        retry_after_ms: u64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Short name used in logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Paired { .. } => "paired",
            ServerMessage::TimeUp { .. } => "time_up",
            ServerMessage::PeerLeft { .. } => "peer_left",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::SkipRejected { .. } => "skip_rejected",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Messages read from a participant's connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// `conversation_id` stays raw: a stale or malformed id is dropped by the relay
    Chat {
        conversation_id: String,
        text: String,
    },
    Skip,
}
