//! Utility functions for the pairing service

use crate::types::{ConnectionId, ConversationId, ParticipantId};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique conversation ID
pub fn generate_conversation_id() -> ConversationId {
    Uuid::new_v4()
}

/// Generate a new opaque participant ID
pub fn generate_participant_id() -> ParticipantId {
    Uuid::new_v4().simple().to_string()
}

/// Generate an opaque session token
pub fn generate_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Allocate a process-unique connection ID
pub fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Wall-clock deadline `duration` from now
pub fn deadline_after(duration: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    current_timestamp() + delta
}
