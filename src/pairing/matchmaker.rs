//! Matchmaker: forms pairs out of the waiting queue
//!
//! The pass runs entirely under the engine lock so concurrent triggers can never
//! form more pairs than there are waiting participants.

use crate::error::Result;
use crate::pairing::conversation::Conversation;
use crate::pairing::engine::{EngineState, PairingEngine};
use crate::types::{ConversationId, ParticipantId, ServerMessage};
use crate::utils::generate_conversation_id;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Trait for pair selection strategies
pub trait PairSelector: Send + Sync {
    /// Pick the next pair to form as `(x, y)` indices into `waiting`, `x < y`
    ///
    /// Both entries must satisfy `is_eligible` and hold distinct ids. `None`
    /// means nothing can be paired right now.
    fn select_pair(
        &self,
        waiting: &[ParticipantId],
        is_eligible: &dyn Fn(&str) -> bool,
    ) -> Option<(usize, usize)>;
}

/// Picks the lexicographically smallest eligible index pair
///
/// This approximates FIFO: earlier entries are preferred, but an ineligible
/// entry at the head does not hold up the ones behind it.
#[derive(Debug, Default)]
pub struct FirstEligiblePairSelector;

impl FirstEligiblePairSelector {
    pub fn new() -> Self {
        Self
    }
}

impl PairSelector for FirstEligiblePairSelector {
    fn select_pair(
        &self,
        waiting: &[ParticipantId],
        is_eligible: &dyn Fn(&str) -> bool,
    ) -> Option<(usize, usize)> {
        let mut first: Option<usize> = None;

        for (index, id) in waiting.iter().enumerate() {
            if !is_eligible(id) {
                continue;
            }
            match first {
                None => first = Some(index),
                Some(x) if waiting[x] != *id => return Some((x, index)),
                Some(_) => {}
            }
        }

        None
    }
}

impl PairingEngine {
    /// Run a matchmaker pass; returns how many pairs were formed
    pub fn run_matchmaker(&self) -> Result<usize> {
        let mut state = self.lock()?;
        Ok(self.matchmake_locked(&mut state))
    }

    /// Pair waiting participants until no eligible pair is left
    pub(super) fn matchmake_locked(&self, state: &mut EngineState) -> usize {
        let timer = self.metrics().start_timer();
        let round = self.config().round_duration;
        let mut waiting = state.queue.ids();
        let mut pairs = 0;

        loop {
            let pick = {
                let registry = &state.registry;
                self.selector()
                    .select_pair(&waiting, &|id| registry.is_connected(id))
            };
            let Some((x, y)) = pick else {
                break;
            };

            if x >= y || y >= waiting.len() || waiting[x] == waiting[y] {
                self.report_violation(&format!(
                    "pair selector returned invalid pair ({}, {}) for {} waiting",
                    x,
                    y,
                    waiting.len()
                ));
                break;
            }

            let removed = state.queue.remove_at(&[x, y]);
            waiting.remove(y);
            waiting.remove(x);
            if removed.len() != 2 {
                self.report_violation("waiting queue diverged from its snapshot during a pass");
                waiting = state.queue.ids();
                continue;
            }

            let first = removed[0].participant_id.clone();
            let second = removed[1].participant_id.clone();
            let waits = [removed[0].waited(), removed[1].waited()];

            let conversation_id = generate_conversation_id();
            let conversation =
                Conversation::new(conversation_id, first.clone(), second.clone(), round);
            let expires_at = conversation.expires_at;
            let deadline = conversation.deadline;

            if let Err(e) = state.table.insert(conversation) {
                self.report_violation(&e.to_string());
                state.requeue(&first);
                state.requeue(&second);
                waiting = state.queue.ids();
                continue;
            }

            let timer_handle = self.schedule_expiry(conversation_id, deadline);
            if let Some(conversation) = state.table.get_mut(&conversation_id) {
                conversation.attach_timer(timer_handle);
            }

            for (me, peer) in [(&first, &second), (&second, &first)] {
                let delivered = state.registry.send(
                    me,
                    ServerMessage::Paired {
                        conversation_id,
                        peer_handle: state.handle_of(peer),
                        expires_at,
                    },
                );
                if !delivered {
                    self.metrics().record_notification_undelivered("paired");
                }
            }

            state.stats.conversations_created += 1;
            self.metrics().record_paired(waits);
            pairs += 1;

            info!(
                "Paired '{}' with '{}' in conversation {} (expires at {})",
                first, second, conversation_id, expires_at
            );
        }

        self.metrics().record_matchmaker_pass(timer.stop(), pairs);
        if pairs == 0 && !waiting.is_empty() {
            debug!("Matchmaker found no eligible pair among {} waiting", waiting.len());
        }

        pairs
    }

    /// Spawn the round timer for a conversation
    fn schedule_expiry(&self, conversation_id: ConversationId, deadline: Instant) -> AbortHandle {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Err(e) = engine.expire_round(conversation_id) {
                error!("Failed to expire conversation {}: {}", conversation_id, e);
            }
        })
        .abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use crate::pairing::engine::{EngineConfig, Placement};
    use crate::pairing::registry::{Connection, Delivery};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ids(raw: &[&str]) -> Vec<ParticipantId> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn engine() -> PairingEngine {
        PairingEngine::new(
            EngineConfig::default(),
            Arc::new(MetricsCollector::new().unwrap()),
        )
    }

    #[test]
    fn test_selects_first_two_eligible() {
        let selector = FirstEligiblePairSelector::new();
        let waiting = ids(&["a", "b", "c"]);
        assert_eq!(selector.select_pair(&waiting, &|_| true), Some((0, 1)));
    }

    #[test]
    fn test_skips_ineligible_entries() {
        let selector = FirstEligiblePairSelector::new();
        let waiting = ids(&["a", "b", "c", "d"]);
        let offline: HashSet<&str> = ["a", "c"].into_iter().collect();

        assert_eq!(
            selector.select_pair(&waiting, &|id| !offline.contains(id)),
            Some((1, 3))
        );
    }

    #[test]
    fn test_never_pairs_an_id_with_itself() {
        let selector = FirstEligiblePairSelector::new();
        let waiting = ids(&["a", "a", "b"]);
        assert_eq!(selector.select_pair(&waiting, &|_| true), Some((0, 2)));

        let lonely = ids(&["a", "a"]);
        assert_eq!(selector.select_pair(&lonely, &|_| true), None);
    }

    #[test]
    fn test_no_pair_when_fewer_than_two_eligible() {
        let selector = FirstEligiblePairSelector::new();
        assert_eq!(selector.select_pair(&[], &|_| true), None);
        assert_eq!(selector.select_pair(&ids(&["a"]), &|_| true), None);
        assert_eq!(
            selector.select_pair(&ids(&["a", "b"]), &|id| id == "a"),
            None
        );
    }

    #[tokio::test]
    async fn test_two_connected_participants_form_one_conversation() {
        let engine = engine();
        let (a, mut rx_a) = Connection::channel();
        let (b, mut rx_b) = Connection::channel();

        engine.connect("a", a).unwrap();
        let outcome = engine.connect("b", b).unwrap();
        assert_eq!(outcome.pairs_formed, 1);

        let snapshot = engine.snapshot().unwrap();
        assert!(snapshot.waiting.is_empty());
        assert_eq!(snapshot.conversations.len(), 1);
        let conversation = &snapshot.conversations[0];
        assert_eq!(conversation.participants, ["a".to_string(), "b".to_string()]);

        for rx in [&mut rx_a, &mut rx_b] {
            let _welcome = rx.try_recv().unwrap();
            match rx.try_recv().unwrap() {
                Delivery::Message(ServerMessage::Paired {
                    conversation_id,
                    peer_handle,
                    expires_at,
                }) => {
                    assert_eq!(conversation_id, conversation.id);
                    assert_eq!(peer_handle, "stranger");
                    assert_eq!(expires_at, conversation.expires_at);
                }
                other => panic!("expected paired, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_matchmaker_is_idempotent() {
        let engine = engine();
        let (a, _rx_a) = Connection::channel();
        let (b, _rx_b) = Connection::channel();
        let (c, _rx_c) = Connection::channel();
        engine.connect("a", a).unwrap();
        engine.connect("b", b).unwrap();
        engine.connect("c", c).unwrap();

        assert_eq!(engine.run_matchmaker().unwrap(), 0);
        assert_eq!(engine.run_matchmaker().unwrap(), 0);
        assert_eq!(engine.placement_of("c").unwrap(), Placement::Waiting);
        engine.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_waiter_is_passed_over() {
        let engine = engine();
        let (a, rx_a) = Connection::channel();
        engine.connect("a", a).unwrap();
        drop(rx_a);

        let (b, _rx_b) = Connection::channel();
        let (c, _rx_c) = Connection::channel();
        engine.connect("b", b).unwrap();
        engine.connect("c", c).unwrap();

        assert_eq!(engine.placement_of("a").unwrap(), Placement::Waiting);
        assert!(matches!(
            engine.placement_of("b").unwrap(),
            Placement::InConversation(_)
        ));
        assert_eq!(engine.placement_of("b").unwrap(), engine.placement_of("c").unwrap());
    }

    #[tokio::test]
    async fn test_registered_handle_is_revealed_to_peer() {
        let engine = engine();
        engine.register_participant("a", Some("alice")).unwrap();
        let (a, _rx_a) = Connection::channel();
        let (b, mut rx_b) = Connection::channel();
        engine.connect("a", a).unwrap();
        engine.connect("b", b).unwrap();

        let _welcome = rx_b.try_recv().unwrap();
        match rx_b.try_recv().unwrap() {
            Delivery::Message(ServerMessage::Paired { peer_handle, .. }) => {
                assert_eq!(peer_handle, "alice")
            }
            other => panic!("expected paired, got {:?}", other),
        }
    }
}
