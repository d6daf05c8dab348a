//! Round lifecycle: expiry, skip, disconnect and stale waiter pruning
//!
//! Every teardown goes through `ConversationTable::take_for_teardown`, so when a
//! timer and a skip race for the same conversation exactly one of them finds it
//! in the table; the other sees nothing and returns without side effects.

use crate::error::{PairingError, Result};
use crate::pairing::conversation::Conversation;
use crate::pairing::engine::{EngineState, PairingEngine};
use crate::types::{
    ConnectionId, ConversationId, DisconnectPolicy, ParticipantId, ServerMessage, TeardownReason,
};
use chrono::Utc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What a successful skip did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipOutcome {
    /// Conversation that was ended, if the participant was in one
    pub ended: Option<ConversationId>,
    /// Former peer, now back in the queue
    pub peer: Option<ParticipantId>,
    pub pairs_formed: usize,
}

/// What a disconnect did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The connection had already been replaced; nothing changed
    Stale,
    /// Unbound; any placement was kept
    Retained { conversation: Option<ConversationId> },
    /// Unbound and the conversation was torn down under `end_round`
    RoundEnded {
        conversation: ConversationId,
        peer: ParticipantId,
    },
}

impl PairingEngine {
    /// Round timer fired; returns false when the conversation was already closed
    pub fn expire_round(&self, conversation_id: ConversationId) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(conversation) =
            self.teardown_locked(&mut state, &conversation_id, TeardownReason::Expired)
        else {
            return Ok(false);
        };

        for participant_id in &conversation.participants {
            if state.requeue(participant_id) {
                self.metrics().record_enqueued();
            }
            let delivered = state
                .registry
                .send(participant_id, ServerMessage::TimeUp { conversation_id });
            if !delivered {
                self.metrics().record_notification_undelivered("time_up");
            }
        }

        state.stats.conversations_expired += 1;
        info!(
            "Conversation {} expired, requeued '{}' and '{}'",
            conversation_id, conversation.participants[0], conversation.participants[1]
        );

        self.matchmake_locked(&mut state);
        Ok(true)
    }

    /// Participant asked to end its round early and be paired again
    ///
    /// Fails with `PairingError::SkipRateLimited` inside the cooldown window.
    /// The remaining peer re-enters the queue ahead of the skipper.
    pub fn skip(&self, participant_id: &str) -> Result<SkipOutcome> {
        let timer = self.metrics().start_timer();
        let cooldown = self.config().skip_cooldown;
        let mut state = self.lock()?;

        let participant = state.participants.get_mut(participant_id).ok_or_else(|| {
            PairingError::ParticipantNotFound {
                participant_id: participant_id.to_string(),
            }
        })?;

        if let Some(last_skip) = participant.last_skip_at {
            let since = last_skip.elapsed();
            if since < cooldown {
                let retry_after_ms = (cooldown - since).as_millis().max(1) as u64;
                state.stats.skips_rate_limited += 1;
                self.metrics().record_skip_rate_limited();
                warn!(
                    "Skip rate limited for '{}', retry in {}ms",
                    participant_id, retry_after_ms
                );
                return Err(PairingError::SkipRateLimited {
                    participant_id: participant_id.to_string(),
                    retry_after_ms,
                }
                .into());
            }
        }
        participant.last_skip_at = Some(Instant::now());

        let mut outcome = SkipOutcome {
            ended: None,
            peer: None,
            pairs_formed: 0,
        };

        if let Some(conversation_id) = state.table.conversation_of(participant_id) {
            if let Some(conversation) =
                self.teardown_locked(&mut state, &conversation_id, TeardownReason::Skipped)
            {
                let peer = conversation.peer_of(participant_id).cloned();
                if let Some(peer) = &peer {
                    if state.requeue(peer) {
                        self.metrics().record_enqueued();
                    }
                    let delivered = state
                        .registry
                        .send(peer, ServerMessage::PeerLeft { conversation_id });
                    if !delivered {
                        self.metrics().record_notification_undelivered("peer_left");
                    }
                }

                state.stats.conversations_skipped += 1;
                info!(
                    "Participant '{}' skipped conversation {}",
                    participant_id, conversation_id
                );
                outcome.ended = Some(conversation_id);
                outcome.peer = peer;
            }
        } else {
            debug!("Participant '{}' skipped while not in a conversation", participant_id);
        }

        if state.requeue(participant_id) {
            self.metrics().record_enqueued();
        }

        outcome.pairs_formed = self.matchmake_locked(&mut state);
        drop(state);

        self.metrics().record_engine_operation("skip", timer.stop());
        Ok(outcome)
    }

    /// Participant's connection went away
    ///
    /// Only the connection that is currently bound can unbind; a late handler
    /// for a replaced connection gets `DisconnectOutcome::Stale`.
    pub fn disconnect(
        &self,
        participant_id: &str,
        connection_id: ConnectionId,
    ) -> Result<DisconnectOutcome> {
        let mut state = self.lock()?;

        if state.registry.unbind(participant_id, connection_id).is_none() {
            debug!(
                "Ignoring disconnect of stale {} for '{}'",
                connection_id, participant_id
            );
            return Ok(DisconnectOutcome::Stale);
        }

        if let Some(participant) = state.participants.get_mut(participant_id) {
            participant.connection = None;
            participant.disconnected_at = Some(Instant::now());
        }
        self.metrics().record_disconnected();

        let conversation = state.table.conversation_of(participant_id);
        let outcome = match (self.config().disconnect_policy, conversation) {
            (DisconnectPolicy::EndRound, Some(conversation_id)) => {
                match self.teardown_locked(&mut state, &conversation_id, TeardownReason::Disconnected)
                {
                    Some(conversation) => {
                        // The disconnected side is left idle; it re-enters on reconnect
                        let peer = conversation
                            .peer_of(participant_id)
                            .cloned()
                            .unwrap_or_default();
                        if state.requeue(&peer) {
                            self.metrics().record_enqueued();
                        }
                        let delivered = state
                            .registry
                            .send(&peer, ServerMessage::PeerLeft { conversation_id });
                        if !delivered {
                            self.metrics().record_notification_undelivered("peer_left");
                        }

                        state.stats.conversations_abandoned += 1;
                        info!(
                            "Participant '{}' disconnected, ended conversation {}",
                            participant_id, conversation_id
                        );
                        self.matchmake_locked(&mut state);

                        DisconnectOutcome::RoundEnded {
                            conversation: conversation_id,
                            peer,
                        }
                    }
                    None => DisconnectOutcome::Retained { conversation: None },
                }
            }
            (_, conversation) => {
                info!(
                    "Participant '{}' disconnected on {} (conversation kept: {})",
                    participant_id,
                    connection_id,
                    conversation.is_some()
                );
                DisconnectOutcome::Retained { conversation }
            }
        };

        Ok(outcome)
    }

    /// Remove waiters that have had no connection for at least `max_idle`
    pub fn prune_stale_waiting(&self, max_idle: Duration) -> Result<Vec<ParticipantId>> {
        let mut state = self.lock()?;
        let EngineState {
            queue,
            registry,
            participants,
            ..
        } = &mut *state;

        let stale: Vec<ParticipantId> = queue
            .retain(|entry| {
                if registry.is_connected(&entry.participant_id) {
                    return true;
                }
                match participants.get(&entry.participant_id) {
                    Some(participant) => match participant.disconnected_at {
                        Some(since) => since.elapsed() < max_idle,
                        // Bound but with a dead writer; wait for the unbind
                        None => true,
                    },
                    None => false,
                }
            })
            .into_iter()
            .map(|entry| entry.participant_id)
            .collect();

        if !stale.is_empty() {
            self.metrics().record_stale_waiters_pruned(stale.len());
            info!("Pruned {} stale waiters from the queue", stale.len());
        }
        Ok(stale)
    }

    /// Detach a conversation for teardown, self-healing if it is in a bad state
    fn teardown_locked(
        &self,
        state: &mut EngineState,
        conversation_id: &ConversationId,
        reason: TeardownReason,
    ) -> Option<Conversation> {
        let conversation = match state.table.take_for_teardown(conversation_id, reason) {
            Ok(conversation) => conversation,
            Err(e) => {
                self.report_violation(&e.to_string());
                state.table.remove(conversation_id).map(|mut conversation| {
                    conversation.close();
                    conversation
                })
            }
        }?;

        let lifetime = (Utc::now() - conversation.created_at)
            .to_std()
            .unwrap_or_default();
        self.metrics().record_conversation_closed(reason, lifetime);
        Some(conversation)
    }
}
