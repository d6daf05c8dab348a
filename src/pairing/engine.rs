//! The pairing engine: one explicitly owned authority per process
//!
//! The connection registry, waiting queue and conversation table live together
//! behind a single mutex so a participant can never be observed as both queued
//! and paired. Every public operation takes the lock once, does only in-memory
//! work plus non-blocking channel pushes, and releases it before anything that
//! could touch the network. Operations that start round timers must be called
//! from within a Tokio runtime.

use crate::config::PairingSettings;
use crate::error::{PairingError, Result};
use crate::metrics::MetricsCollector;
use crate::pairing::conversation::{ConversationSummary, ConversationTable};
use crate::pairing::matchmaker::{FirstEligiblePairSelector, PairSelector};
use crate::pairing::queue::WaitingQueue;
use crate::pairing::registry::{Connection, ConnectionRegistry, CLOSE_REPLACED};
use crate::types::{
    ConnectionId, ConversationId, DisconnectPolicy, Participant, ParticipantId, ServerMessage,
};
use crate::utils::current_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Tunables the engine needs at runtime
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed lifetime of a conversation
    pub round_duration: Duration,
    /// Minimum gap between two skips from the same participant
    pub skip_cooldown: Duration,
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round_duration: Duration::from_secs(180),
            skip_cooldown: Duration::from_secs(10),
            disconnect_policy: DisconnectPolicy::default(),
        }
    }
}

impl From<&PairingSettings> for EngineConfig {
    fn from(settings: &PairingSettings) -> Self {
        Self {
            round_duration: settings.round_duration(),
            skip_cooldown: settings.skip_cooldown(),
            disconnect_policy: settings.disconnect_policy,
        }
    }
}

/// Statistics about pairing engine operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairingStats {
    /// Total conversations created
    pub conversations_created: u64,
    /// Conversations that ran to the end of their round
    pub conversations_expired: u64,
    /// Conversations ended by a skip
    pub conversations_skipped: u64,
    /// Conversations ended because one side disconnected
    pub conversations_abandoned: u64,
    /// Chat messages forwarded
    pub messages_relayed: u64,
    /// Chat messages dropped as stale or misaddressed
    pub messages_dropped: u64,
    /// Skips rejected by the cooldown
    pub skips_rate_limited: u64,
    /// Current number of waiting participants
    pub participants_waiting: usize,
    /// Current number of active conversations
    pub active_conversations: usize,
    /// Current number of participants with a live connection
    pub connected_participants: usize,
    /// Participants known to the engine
    pub known_participants: usize,
}

/// Where a participant currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "conversation_id", rename_all = "snake_case")]
pub enum Placement {
    Idle,
    Waiting,
    InConversation(ConversationId),
}

/// Read-only copy of the engine state for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub waiting: Vec<ParticipantId>,
    pub conversations: Vec<ConversationSummary>,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a connect call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub connection_id: ConnectionId,
    pub replaced_previous: bool,
    pub pairs_formed: usize,
}

/// Everything guarded by the engine lock
#[derive(Debug, Default)]
pub(super) struct EngineState {
    pub(super) participants: HashMap<ParticipantId, Participant>,
    pub(super) registry: ConnectionRegistry,
    pub(super) queue: WaitingQueue,
    pub(super) table: ConversationTable,
    pub(super) stats: PairingStats,
}

impl EngineState {
    pub(super) fn placement(&self, participant_id: &str) -> Placement {
        if let Some(conversation_id) = self.table.conversation_of(participant_id) {
            Placement::InConversation(conversation_id)
        } else if self.queue.contains(participant_id) {
            Placement::Waiting
        } else {
            Placement::Idle
        }
    }

    /// Handle revealed to peers
    pub(super) fn handle_of(&self, participant_id: &str) -> String {
        self.participants
            .get(participant_id)
            .map(Participant::display_handle)
            .unwrap_or_else(|| crate::types::ANONYMOUS_HANDLE.to_string())
    }

    /// Put a participant back in the queue unless it already has a placement
    pub(super) fn requeue(&mut self, participant_id: &str) -> bool {
        if self.placement(participant_id) != Placement::Idle {
            return false;
        }
        self.queue.enqueue(participant_id).is_ok()
    }

    /// Collect every single-placement or table consistency violation
    pub(super) fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        let queued = self.queue.ids();
        let mut seen: HashSet<&str> = HashSet::new();
        for id in &queued {
            if !seen.insert(id.as_str()) {
                violations.push(format!("participant '{}' queued twice", id));
            }
            if self.table.contains_participant(id) {
                violations.push(format!("participant '{}' is queued and paired", id));
            }
        }

        let mut placed: HashSet<&str> = HashSet::new();
        for conversation in self.table.iter() {
            let [first, second] = &conversation.participants;
            if first == second {
                violations.push(format!(
                    "conversation {} pairs '{}' with itself",
                    conversation.id, first
                ));
            }
            if !conversation.is_active() {
                violations.push(format!(
                    "conversation {} left in state {:?}",
                    conversation.id,
                    conversation.state()
                ));
            }
            for id in &conversation.participants {
                if !placed.insert(id.as_str()) {
                    violations.push(format!("participant '{}' in two conversations", id));
                }
                if self.table.conversation_of(id) != Some(conversation.id) {
                    violations.push(format!(
                        "participant '{}' not indexed to conversation {}",
                        id, conversation.id
                    ));
                }
            }
        }

        for (id, conversation_id) in self.table.index() {
            let consistent = self
                .table
                .get(conversation_id)
                .map(|conversation| conversation.contains(id))
                .unwrap_or(false);
            if !consistent {
                violations.push(format!(
                    "participant '{}' indexed to missing conversation {}",
                    id, conversation_id
                ));
            }
        }

        violations
    }

    /// Drop whatever entries break the invariants, keeping the rest
    pub(super) fn heal(&mut self) -> usize {
        let mut dropped = 0;

        for id in self.queue.ids() {
            if self.table.contains_participant(&id) {
                self.queue.remove(&id);
                dropped += 1;
            }
        }

        let dangling: Vec<ParticipantId> = self
            .table
            .index()
            .filter(|(id, conversation_id)| {
                !self
                    .table
                    .get(conversation_id)
                    .map(|conversation| conversation.contains(id))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in dangling {
            self.table.unindex(&id);
            dropped += 1;
        }

        let broken: Vec<ConversationId> = self
            .table
            .iter()
            .filter(|conversation| {
                let [first, second] = &conversation.participants;
                first == second
                    || !conversation.is_active()
                    || conversation
                        .participants
                        .iter()
                        .any(|id| self.table.conversation_of(id) != Some(conversation.id))
            })
            .map(|conversation| conversation.id)
            .collect();
        for id in broken {
            if let Some(mut conversation) = self.table.remove(&id) {
                conversation.close();
                dropped += 1;
            }
        }

        dropped
    }
}

struct EngineInner {
    state: Mutex<EngineState>,
    config: EngineConfig,
    selector: Arc<dyn PairSelector>,
    metrics: Arc<MetricsCollector>,
}

/// The pairing engine
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct PairingEngine {
    inner: Arc<EngineInner>,
}

impl PairingEngine {
    /// Create an engine with the default pair selector
    pub fn new(config: EngineConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self::with_selector(config, Arc::new(FirstEligiblePairSelector::new()), metrics)
    }

    /// Create an engine with a custom pair selector
    pub fn with_selector(
        config: EngineConfig,
        selector: Arc<dyn PairSelector>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        info!(
            "Pairing engine created (round: {:?}, skip cooldown: {:?}, disconnect policy: {})",
            config.round_duration, config.skip_cooldown, config.disconnect_policy
        );

        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::default()),
                config,
                selector,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    pub(super) fn selector(&self) -> &dyn PairSelector {
        self.inner.selector.as_ref()
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.inner.state.lock().map_err(|_| {
            PairingError::InternalError {
                message: "Failed to acquire engine lock".to_string(),
            }
            .into()
        })
    }

    /// Log an invariant violation; panics in debug builds
    pub(super) fn report_violation(&self, message: &str) {
        error!("Invariant violation: {}", message);
        if cfg!(debug_assertions) {
            panic!("invariant violation: {}", message);
        }
    }

    /// Make sure a participant exists, optionally setting its username
    pub fn register_participant(&self, participant_id: &str, username: Option<&str>) -> Result<()> {
        let mut state = self.lock()?;
        let participant = state
            .participants
            .entry(participant_id.to_string())
            .or_insert_with(|| {
                debug!("Participant '{}' created", participant_id);
                Participant::new(participant_id.to_string())
            });

        if let Some(username) = username {
            participant.username = Some(username.to_string());
            info!(
                "Participant '{}' registered as '{}'",
                participant_id, username
            );
        }
        Ok(())
    }

    /// Change the handle of a known participant
    pub fn set_handle(&self, participant_id: &str, handle: Option<&str>) -> Result<()> {
        let mut state = self.lock()?;
        let participant = state.participants.get_mut(participant_id).ok_or_else(|| {
            PairingError::ParticipantNotFound {
                participant_id: participant_id.to_string(),
            }
        })?;
        participant.username = handle.map(str::to_string);
        Ok(())
    }

    /// Participant connected: bind, place in the queue if unplaced, pair
    ///
    /// A reconnect mid-round keeps the conversation and re-sends its `paired`
    /// notification on the new connection. The evicted connection (if any) is
    /// closed after the lock is released.
    pub fn connect(&self, participant_id: &str, connection: Connection) -> Result<ConnectOutcome> {
        let timer = self.inner.metrics.start_timer();
        let connection_id = connection.id();

        let (evicted, pairs_formed) = {
            let mut state = self.lock()?;

            let participant = state
                .participants
                .entry(participant_id.to_string())
                .or_insert_with(|| Participant::new(participant_id.to_string()));
            participant.connection = Some(connection_id);
            participant.disconnected_at = None;
            let handle = participant.display_handle();

            let evicted = state.registry.bind(participant_id, connection);

            state.registry.send(
                participant_id,
                ServerMessage::Welcome {
                    participant_id: participant_id.to_string(),
                    handle,
                    timestamp: current_timestamp(),
                },
            );

            match state.placement(participant_id) {
                Placement::Idle => {
                    if state.requeue(participant_id) {
                        self.inner.metrics.record_enqueued();
                        debug!("Participant '{}' joined the waiting queue", participant_id);
                    }
                }
                Placement::Waiting => {}
                Placement::InConversation(conversation_id) => {
                    self.resend_paired(&state, participant_id, conversation_id);
                }
            }

            let pairs = self.matchmake_locked(&mut state);
            (evicted, pairs)
        };

        let replaced_previous = evicted.is_some();
        if let Some(old) = evicted {
            old.close(CLOSE_REPLACED, "replaced by a newer connection");
        }

        self.inner.metrics.record_connected(replaced_previous);
        self.inner
            .metrics
            .record_engine_operation("connect", timer.stop());

        info!(
            "Participant '{}' connected on {} (replaced: {}, pairs formed: {})",
            participant_id, connection_id, replaced_previous, pairs_formed
        );

        Ok(ConnectOutcome {
            connection_id,
            replaced_previous,
            pairs_formed,
        })
    }

    fn resend_paired(&self, state: &EngineState, participant_id: &str, conversation_id: ConversationId) {
        let Some(conversation) = state.table.get(&conversation_id) else {
            return;
        };
        let Some(peer) = conversation.peer_of(participant_id) else {
            return;
        };

        debug!(
            "Participant '{}' resumed conversation {}",
            participant_id, conversation_id
        );
        state.registry.send(
            participant_id,
            ServerMessage::Paired {
                conversation_id,
                peer_handle: state.handle_of(peer),
                expires_at: conversation.expires_at,
            },
        );
    }

    /// Current placement of a participant
    pub fn placement_of(&self, participant_id: &str) -> Result<Placement> {
        Ok(self.lock()?.placement(participant_id))
    }

    pub fn is_connected(&self, participant_id: &str) -> Result<bool> {
        Ok(self.lock()?.registry.is_connected(participant_id))
    }

    /// Read-only copy of queue and conversations
    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        let state = self.lock()?;
        Ok(EngineSnapshot {
            waiting: state.queue.ids(),
            conversations: state.table.summaries(),
            taken_at: current_timestamp(),
        })
    }

    /// Get engine statistics
    pub fn get_stats(&self) -> Result<PairingStats> {
        let state = self.lock()?;
        let mut stats = state.stats.clone();
        stats.participants_waiting = state.queue.len();
        stats.active_conversations = state.table.len();
        stats.connected_participants = state
            .participants
            .keys()
            .filter(|id| state.registry.is_connected(id))
            .count();
        stats.known_participants = state.participants.len();
        Ok(stats)
    }

    /// Verify the single placement invariant and table consistency
    pub fn check_invariants(&self) -> Result<()> {
        let violations = self.lock()?.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(PairingError::InvariantViolation {
                message: violations.join("; "),
            }
            .into())
        }
    }

    /// Drop every entry that breaks the invariants; returns how many went
    ///
    /// Run periodically by the cleanup task. Each violation is logged before
    /// the repair so the bad state is never silently kept.
    pub fn heal_invariants(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let violations = state.violations();
        if violations.is_empty() {
            return Ok(0);
        }

        for violation in &violations {
            error!("Invariant violation: {}", violation);
        }
        let dropped = state.heal();
        let remaining = state.violations();
        drop(state);

        warn!(
            "Self-healed {} entries after {} invariant violations",
            dropped,
            violations.len()
        );
        if !remaining.is_empty() {
            return Err(PairingError::InvariantViolation {
                message: remaining.join("; "),
            }
            .into());
        }
        Ok(dropped)
    }

    /// Cancel every round timer, used on shutdown
    pub fn shutdown(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let ids: Vec<ConversationId> = state.table.iter().map(|c| c.id).collect();
        for id in &ids {
            if let Some(conversation) = state.table.get_mut(id) {
                conversation.cancel_timer();
            }
        }
        if !ids.is_empty() {
            warn!("Cancelled {} round timers on shutdown", ids.len());
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::registry::Delivery;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn engine() -> PairingEngine {
        PairingEngine::new(
            EngineConfig::default(),
            Arc::new(MetricsCollector::new().unwrap()),
        )
    }

    fn drain(rx: &mut UnboundedReceiver<Delivery>) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            out.push(delivery);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_sends_welcome_and_queues() {
        let engine = engine();
        let (conn, mut rx) = Connection::channel();

        let outcome = engine.connect("a", conn).unwrap();
        assert!(!outcome.replaced_previous);
        assert_eq!(outcome.pairs_formed, 0);
        assert_eq!(engine.placement_of("a").unwrap(), Placement::Waiting);

        let deliveries = drain(&mut rx);
        assert!(matches!(
            deliveries.as_slice(),
            [Delivery::Message(ServerMessage::Welcome { participant_id, .. })] if participant_id == "a"
        ));
    }

    #[tokio::test]
    async fn test_reconnect_closes_old_connection() {
        let engine = engine();
        let (first, mut first_rx) = Connection::channel();
        let (second, _second_rx) = Connection::channel();

        engine.connect("a", first).unwrap();
        let outcome = engine.connect("a", second).unwrap();
        assert!(outcome.replaced_previous);

        let deliveries = drain(&mut first_rx);
        assert!(deliveries
            .iter()
            .any(|d| matches!(d, Delivery::Close { code, .. } if *code == CLOSE_REPLACED)));

        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.waiting, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_register_and_set_handle() {
        let engine = engine();
        engine.register_participant("a", Some("alice")).unwrap();
        engine.set_handle("a", Some("alicia")).unwrap();
        assert!(engine.set_handle("ghost", Some("x")).is_err());

        let (conn, mut rx) = Connection::channel();
        engine.connect("a", conn).unwrap();
        match drain(&mut rx).first() {
            Some(Delivery::Message(ServerMessage::Welcome { handle, .. })) => {
                assert_eq!(handle, "alicia")
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stats_track_current_state() {
        let engine = engine();
        let (a, _rx_a) = Connection::channel();
        let (b, _rx_b) = Connection::channel();
        let (c, _rx_c) = Connection::channel();
        engine.connect("a", a).unwrap();
        engine.connect("b", b).unwrap();
        engine.connect("c", c).unwrap();

        let stats = engine.get_stats().unwrap();
        assert_eq!(stats.conversations_created, 1);
        assert_eq!(stats.active_conversations, 1);
        assert_eq!(stats.participants_waiting, 1);
        assert_eq!(stats.connected_participants, 3);
        assert_eq!(stats.known_participants, 3);
        engine.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_timers() {
        let engine = engine();
        let (a, _rx_a) = Connection::channel();
        let (b, _rx_b) = Connection::channel();
        engine.connect("a", a).unwrap();
        engine.connect("b", b).unwrap();

        assert_eq!(engine.shutdown().unwrap(), 1);
    }

    #[test]
    fn test_heal_drops_double_placement() {
        use crate::pairing::conversation::Conversation;

        let mut state = EngineState::default();
        state
            .table
            .insert(Conversation::new(
                crate::utils::generate_conversation_id(),
                "a".to_string(),
                "b".to_string(),
                Duration::from_secs(60),
            ))
            .unwrap();
        state.queue.enqueue("a").unwrap();
        state.queue.enqueue("c").unwrap();

        assert_eq!(state.violations().len(), 1);
        assert_eq!(state.heal(), 1);
        assert!(state.violations().is_empty());
        assert_eq!(state.queue.ids(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_heal_invariants_repairs_live_engine() {
        let engine = engine();
        let (a, _rx_a) = Connection::channel();
        let (b, _rx_b) = Connection::channel();
        engine.connect("a", a).unwrap();
        engine.connect("b", b).unwrap();
        assert_eq!(engine.heal_invariants().unwrap(), 0);

        // Corrupt the state: "a" is both paired and queued
        engine.lock().unwrap().queue.enqueue("a").unwrap();
        assert!(engine.check_invariants().is_err());

        assert_eq!(engine.heal_invariants().unwrap(), 1);
        engine.check_invariants().unwrap();
        assert!(matches!(
            engine.placement_of("a").unwrap(),
            Placement::InConversation(_)
        ));
        assert_eq!(engine.get_stats().unwrap().participants_waiting, 0);
    }
}
