//! Conversation table and per-conversation round state
//!
//! A conversation holds exactly two participant ids, its round deadline and the
//! abort handle of its expiry timer. The table keeps a participant index next to
//! the primary map so "which conversation is this participant in" never needs a
//! scan.

use crate::error::{PairingError, Result};
use crate::types::{ConversationId, ParticipantId, TeardownReason};
use crate::utils::{current_timestamp, deadline_after};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Round state of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    /// Both participants are paired and the round timer is running
    Active,
    /// Timer fired, teardown in progress
    Expiring,
    /// One side ended the round early (skip, or disconnect under `end_round`)
    Skipped,
    /// Removed from the table (terminal state)
    Closed,
}

/// An active pairing between two participants
#[derive(Debug)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: [ParticipantId; 2],
    pub created_at: DateTime<Utc>,
    /// Wall-clock deadline shown to clients
    pub expires_at: DateTime<Utc>,
    /// Monotonic deadline the timer sleeps until
    pub deadline: Instant,
    state: ConversationState,
    timer: Option<AbortHandle>,
}

impl Conversation {
    pub fn new(id: ConversationId, first: ParticipantId, second: ParticipantId, round: Duration) -> Self {
        debug_assert_ne!(first, second, "conversation needs two distinct participants");

        Self {
            id,
            participants: [first, second],
            created_at: current_timestamp(),
            expires_at: deadline_after(round),
            deadline: Instant::now() + round,
            state: ConversationState::Active,
            timer: None,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConversationState::Active
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p == participant_id)
    }

    /// The other participant, if `participant_id` is a member
    pub fn peer_of(&self, participant_id: &str) -> Option<&ParticipantId> {
        match &self.participants {
            [a, b] if a == participant_id => Some(b),
            [a, b] if b == participant_id => Some(a),
            _ => None,
        }
    }

    /// Attach the expiry timer; a previously attached timer is cancelled
    pub fn attach_timer(&mut self, handle: AbortHandle) {
        self.cancel_timer();
        self.timer = Some(handle);
    }

    /// Cancel the expiry timer; no-op if it already fired or was cancelled
    pub fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }

    /// Move from Active into the teardown state matching `reason`
    pub fn begin_teardown(&mut self, reason: TeardownReason) -> Result<()> {
        if self.state != ConversationState::Active {
            return Err(PairingError::InvariantViolation {
                message: format!(
                    "conversation {} cannot begin teardown ({}) from {:?}",
                    self.id, reason, self.state
                ),
            }
            .into());
        }

        self.state = match reason {
            TeardownReason::Expired => ConversationState::Expiring,
            TeardownReason::Skipped | TeardownReason::Disconnected => ConversationState::Skipped,
        };
        Ok(())
    }

    pub fn close(&mut self) {
        self.cancel_timer();
        self.state = ConversationState::Closed;
    }

    /// Remaining round time
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            participants: self.participants.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            state: self.state,
        }
    }
}

/// Cloneable view of a conversation for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participants: [ParticipantId; 2],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ConversationState,
}

/// Active conversations keyed by id, with a participant index
#[derive(Debug, Default)]
pub struct ConversationTable {
    conversations: HashMap<ConversationId, Conversation>,
    by_participant: HashMap<ParticipantId, ConversationId>,
}

impl ConversationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a conversation; both participants must be free
    pub fn insert(&mut self, conversation: Conversation) -> Result<()> {
        let [first, second] = &conversation.participants;
        if first == second {
            return Err(PairingError::InvariantViolation {
                message: format!(
                    "conversation {} pairs participant '{}' with itself",
                    conversation.id, first
                ),
            }
            .into());
        }

        for participant_id in &conversation.participants {
            if self.by_participant.contains_key(participant_id) {
                return Err(PairingError::AlreadyInConversation {
                    participant_id: participant_id.clone(),
                }
                .into());
            }
        }

        for participant_id in &conversation.participants {
            self.by_participant
                .insert(participant_id.clone(), conversation.id);
        }
        self.conversations.insert(conversation.id, conversation);
        Ok(())
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.get_mut(id)
    }

    /// Conversation the participant is currently in
    pub fn conversation_of(&self, participant_id: &str) -> Option<ConversationId> {
        self.by_participant.get(participant_id).copied()
    }

    pub fn contains_participant(&self, participant_id: &str) -> bool {
        self.by_participant.contains_key(participant_id)
    }

    /// Detach a conversation for teardown
    ///
    /// Returns `None` when the conversation is already gone, which is how the
    /// loser of a timer/skip race finds out there is nothing left to do.
    pub fn take_for_teardown(
        &mut self,
        id: &ConversationId,
        reason: TeardownReason,
    ) -> Result<Option<Conversation>> {
        let Some(conversation) = self.conversations.get_mut(id) else {
            debug!("Conversation {} already closed, ignoring {}", id, reason);
            return Ok(None);
        };

        conversation.begin_teardown(reason)?;
        conversation.cancel_timer();

        let mut conversation = match self.remove(id) {
            Some(conversation) => conversation,
            None => return Ok(None),
        };
        conversation.close();
        Ok(Some(conversation))
    }

    /// Remove a conversation and its index entries without state checks
    pub fn remove(&mut self, id: &ConversationId) -> Option<Conversation> {
        let conversation = self.conversations.remove(id)?;
        for participant_id in &conversation.participants {
            if self.by_participant.get(participant_id) == Some(id) {
                self.by_participant.remove(participant_id);
            }
        }
        Some(conversation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    /// Participant index entries, for consistency checks
    pub fn index(&self) -> impl Iterator<Item = (&ParticipantId, &ConversationId)> {
        self.by_participant.iter()
    }

    /// Drop a dangling index entry
    pub fn unindex(&mut self, participant_id: &str) -> Option<ConversationId> {
        self.by_participant.remove(participant_id)
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.conversations.values().map(Conversation::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_conversation_id;

    fn conversation(a: &str, b: &str) -> Conversation {
        Conversation::new(
            generate_conversation_id(),
            a.to_string(),
            b.to_string(),
            Duration::from_secs(180),
        )
    }

    #[test]
    fn test_peer_lookup() {
        let conv = conversation("a", "b");
        assert_eq!(conv.peer_of("a").map(String::as_str), Some("b"));
        assert_eq!(conv.peer_of("b").map(String::as_str), Some("a"));
        assert!(conv.peer_of("c").is_none());
        assert!(conv.contains("a"));
        assert!(conv.is_active());
    }

    #[test]
    fn test_insert_indexes_both_participants() {
        let mut table = ConversationTable::new();
        let conv = conversation("a", "b");
        let id = conv.id;
        table.insert(conv).unwrap();

        assert_eq!(table.conversation_of("a"), Some(id));
        assert_eq!(table.conversation_of("b"), Some(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_rejects_double_placement() {
        let mut table = ConversationTable::new();
        table.insert(conversation("a", "b")).unwrap();

        let err = table.insert(conversation("b", "c")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PairingError>(),
            Some(PairingError::AlreadyInConversation { participant_id }) if participant_id == "b"
        ));
        assert!(!table.contains_participant("c"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_teardown_only_once() {
        let mut table = ConversationTable::new();
        let conv = conversation("a", "b");
        let id = conv.id;
        table.insert(conv).unwrap();

        let closed = table
            .take_for_teardown(&id, TeardownReason::Skipped)
            .unwrap()
            .expect("first teardown wins");
        assert_eq!(closed.state(), ConversationState::Closed);
        assert!(table.is_empty());
        assert!(!table.contains_participant("a"));

        let second = table.take_for_teardown(&id, TeardownReason::Expired).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_teardown_requires_active_state() {
        let mut conv = conversation("a", "b");
        conv.begin_teardown(TeardownReason::Expired).unwrap();
        assert_eq!(conv.state(), ConversationState::Expiring);
        assert!(conv.begin_teardown(TeardownReason::Skipped).is_err());
    }

    #[tokio::test]
    async fn test_cancel_timer_aborts_task() {
        let mut conv = conversation("a", "b");
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        conv.attach_timer(task.abort_handle());

        conv.cancel_timer();
        conv.cancel_timer();

        let err = task.await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
