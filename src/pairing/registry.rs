//! Connection registry: which participant currently owns a live outbound channel
//!
//! The registry holds no business logic. It lives inside the engine state and is
//! only touched under the engine lock. Writes never block: each connection is an
//! unbounded channel drained by that connection's writer task.

use crate::types::{ConnectionId, ParticipantId, ServerMessage};
use crate::utils::next_connection_id;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Close code sent to a connection evicted by a newer one for the same participant
pub const CLOSE_REPLACED: u16 = 4000;

/// Item queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

/// Sender half feeding a connection's writer task
pub type ConnectionSender = mpsc::UnboundedSender<Delivery>;

/// A live, writable channel to exactly one participant
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    sender: ConnectionSender,
}

impl Connection {
    /// Wrap a sender with a fresh connection ID
    pub fn new(sender: ConnectionSender) -> Self {
        Self {
            id: next_connection_id(),
            sender,
        }
    }

    /// Create a connection together with the receiver its writer task should drain
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message; returns false when the writer side is gone
    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(Delivery::Message(message)).is_ok()
    }

    /// Ask the writer task to close the underlying transport
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Delivery::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Participant ID to live connection mapping
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ParticipantId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection, returning the evicted one (if any)
    ///
    /// The caller must close the evicted connection after releasing the engine lock.
    pub fn bind(&mut self, participant_id: &str, connection: Connection) -> Option<Connection> {
        let evicted = self
            .connections
            .insert(participant_id.to_string(), connection);

        if let Some(old) = &evicted {
            debug!(
                "Connection {} for participant '{}' replaced",
                old.id(),
                participant_id
            );
        }

        evicted
    }

    /// Remove the mapping only if it still points at `connection_id`
    pub fn unbind(
        &mut self,
        participant_id: &str,
        connection_id: ConnectionId,
    ) -> Option<Connection> {
        match self.connections.get(participant_id) {
            Some(current) if current.id() == connection_id => {
                self.connections.remove(participant_id)
            }
            Some(current) => {
                debug!(
                    "Ignoring unbind of stale {} for participant '{}' (current: {})",
                    connection_id,
                    participant_id,
                    current.id()
                );
                None
            }
            None => None,
        }
    }

    /// Best-effort send; unreachable participants are silently skipped
    pub fn send(&self, participant_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(participant_id) {
            Some(connection) => {
                let kind = message.kind();
                let delivered = connection.send(message);
                if !delivered {
                    debug!(
                        "Dropped '{}' for participant '{}': connection {} closed",
                        kind,
                        participant_id,
                        connection.id()
                    );
                }
                delivered
            }
            None => {
                debug!(
                    "Dropped '{}' for participant '{}': not connected",
                    message.kind(),
                    participant_id
                );
                false
            }
        }
    }

    /// Whether the participant has a bound connection whose writer is still alive
    pub fn is_connected(&self, participant_id: &str) -> bool {
        self.connections
            .get(participant_id)
            .map(|connection| !connection.is_closed())
            .unwrap_or(false)
    }

    pub fn connection_id(&self, participant_id: &str) -> Option<ConnectionId> {
        self.connections.get(participant_id).map(Connection::id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
