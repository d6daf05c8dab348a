//! Message relay between the members of a conversation

use crate::error::Result;
use crate::pairing::engine::PairingEngine;
use crate::types::{ConversationId, ServerMessage};
use crate::utils::current_timestamp;
use tracing::debug;
use uuid::Uuid;

/// Why a chat message was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Expired, skipped or never existed
    UnknownConversation,
    /// The sender is not a member of the conversation
    NotAMember,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnknownConversation => "unknown_conversation",
            DropReason::NotAMember => "not_a_member",
        }
    }
}

/// Result of relaying one chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded; `recipients` counts the peers whose connection accepted it
    Delivered { recipients: usize },
    Dropped(DropReason),
}

impl PairingEngine {
    /// Relay a chat frame whose conversation id arrived as client text
    ///
    /// An id that does not parse can never name a live conversation, so it is
    /// dropped like any other unknown conversation.
    pub fn relay_client_chat(
        &self,
        sender_id: &str,
        raw_conversation_id: &str,
        text: &str,
    ) -> Result<RelayOutcome> {
        match Uuid::parse_str(raw_conversation_id) {
            Ok(conversation_id) => self.relay_chat(sender_id, conversation_id, text),
            Err(_) => {
                self.lock()?.stats.messages_dropped += 1;
                let reason = DropReason::UnknownConversation;
                self.record_drop(sender_id, raw_conversation_id, reason);
                Ok(RelayOutcome::Dropped(reason))
            }
        }
    }

    /// Forward a chat message to every other member of the conversation
    ///
    /// Stale or misaddressed messages are dropped without an error.
    pub fn relay_chat(
        &self,
        sender_id: &str,
        conversation_id: ConversationId,
        text: &str,
    ) -> Result<RelayOutcome> {
        let mut state = self.lock()?;

        let reason = match state.table.get(&conversation_id) {
            None => Some(DropReason::UnknownConversation),
            Some(conversation) if !conversation.contains(sender_id) => {
                Some(DropReason::NotAMember)
            }
            Some(_) => None,
        };

        if let Some(reason) = reason {
            state.stats.messages_dropped += 1;
            self.record_drop(sender_id, &conversation_id.to_string(), reason);
            return Ok(RelayOutcome::Dropped(reason));
        }

        let recipients: Vec<String> = state
            .table
            .get(&conversation_id)
            .map(|conversation| {
                conversation
                    .participants
                    .iter()
                    .filter(|id| id.as_str() != sender_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let message = ServerMessage::Chat {
            conversation_id,
            sender_handle: state.handle_of(sender_id),
            text: text.to_string(),
            timestamp: current_timestamp(),
        };

        let delivered = recipients
            .iter()
            .filter(|recipient| state.registry.send(recipient, message.clone()))
            .count();

        state.stats.messages_relayed += 1;
        self.metrics().record_message_relayed();

        Ok(RelayOutcome::Delivered {
            recipients: delivered,
        })
    }

    fn record_drop(&self, sender_id: &str, conversation_id: &str, reason: DropReason) {
        self.metrics().record_message_dropped(reason.as_str());
        debug!(
            "Dropped chat from '{}' for conversation '{}': {}",
            sender_id,
            conversation_id,
            reason.as_str()
        );
    }
}
