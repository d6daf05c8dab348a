//! Waiting queue of participants awaiting a partner
//!
//! Plain FIFO storage. Callers hold the engine lock for every mutation, so the
//! queue itself does no synchronisation.

use crate::error::{PairingError, Result};
use crate::types::ParticipantId;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// A participant id waiting in the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub participant_id: ParticipantId,
    pub enqueued_at: Instant,
}

impl WaitingEntry {
    /// How long this entry has been waiting
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// FIFO of waiting participants
#[derive(Debug, Default)]
pub struct WaitingQueue {
    entries: VecDeque<WaitingEntry>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a participant; rejects an id that is already waiting
    pub fn enqueue(&mut self, participant_id: &str) -> Result<()> {
        if self.contains(participant_id) {
            return Err(PairingError::AlreadyQueued {
                participant_id: participant_id.to_string(),
            }
            .into());
        }

        self.entries.push_back(WaitingEntry {
            participant_id: participant_id.to_string(),
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Remove the entries at `indices`, returned in the order the indices were given
    ///
    /// Removal runs from the highest index down so earlier indices stay valid.
    /// Out-of-range or repeated indices are ignored.
    pub fn remove_at(&mut self, indices: &[usize]) -> Vec<WaitingEntry> {
        let mut order: Vec<usize> = indices.to_vec();
        order.sort_unstable();
        order.dedup();

        let mut removed: Vec<(usize, WaitingEntry)> = Vec::with_capacity(order.len());
        for &index in order.iter().rev() {
            if let Some(entry) = self.entries.remove(index) {
                removed.push((index, entry));
            }
        }

        indices
            .iter()
            .filter_map(|index| {
                removed
                    .iter()
                    .position(|(i, _)| i == index)
                    .map(|pos| removed.swap_remove(pos).1)
            })
            .collect()
    }

    /// Remove a participant wherever it sits; returns the entry if it was queued
    pub fn remove(&mut self, participant_id: &str) -> Option<WaitingEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.participant_id == participant_id)?;
        self.entries.remove(index)
    }

    /// Keep the entries for which `keep` holds; returns the dropped ones in queue order
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<WaitingEntry>
    where
        F: FnMut(&WaitingEntry) -> bool,
    {
        let mut dropped = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if keep(&entry) {
                kept.push_back(entry);
            } else {
                dropped.push(entry);
            }
        }
        self.entries = kept;
        dropped
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.participant_id == participant_id)
    }

    /// Participant ids in queue order
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.entries
            .iter()
            .map(|entry| entry.participant_id.clone())
            .collect()
    }

    /// Read-only copy for diagnostics
    pub fn snapshot(&self) -> Vec<WaitingEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(ids: &[&str]) -> WaitingQueue {
        let mut queue = WaitingQueue::new();
        for id in ids {
            queue.enqueue(id).unwrap();
        }
        queue
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let queue = queue_of(&["a", "b", "c"]);
        assert_eq!(queue.ids(), vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_duplicate_enqueue_rejected() {
        let mut queue = queue_of(&["a"]);
        let err = queue.enqueue("a").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PairingError>(),
            Some(PairingError::AlreadyQueued { .. })
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_at_keeps_remaining_order() {
        let mut queue = queue_of(&["a", "b", "c", "d", "e"]);
        let removed = queue.remove_at(&[1, 3]);

        let removed_ids: Vec<_> = removed.into_iter().map(|e| e.participant_id).collect();
        assert_eq!(removed_ids, vec!["b", "d"]);
        assert_eq!(queue.ids(), vec!["a", "c", "e"]);
    }

    #[test]
    fn test_remove_at_ignores_out_of_range() {
        let mut queue = queue_of(&["a", "b"]);
        let removed = queue.remove_at(&[0, 7]);
        assert_eq!(removed.len(), 1);
        assert_eq!(queue.ids(), vec!["b"]);
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = queue_of(&["a", "b", "c"]);
        assert!(queue.remove("b").is_some());
        assert!(queue.remove("b").is_none());
        assert!(!queue.contains("b"));
        assert_eq!(queue.ids(), vec!["a", "c"]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut queue = queue_of(&["a", "b"]);
        let snapshot = queue.snapshot();
        queue.remove("a");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retain_keeps_order_and_returns_dropped() {
        let mut queue = queue_of(&["a", "b", "c", "d"]);
        let dropped = queue.retain(|entry| !["b", "d"].contains(&entry.participant_id.as_str()));

        let dropped: Vec<_> = dropped.into_iter().map(|e| e.participant_id).collect();
        assert_eq!(dropped, vec!["b".to_string(), "d".to_string()]);
        assert_eq!(queue.ids(), vec!["a".to_string(), "c".to_string()]);
    }
}
