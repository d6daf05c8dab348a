//! Identity and session handling
//!
//! The pairing engine never looks inside a token: it only asks a
//! `SessionResolver` which participant a credential belongs to.

pub mod store;

pub use store::{InMemorySessionStore, IssuedSession, SessionKind};

use crate::error::Result;
use crate::types::ParticipantId;
use async_trait::async_trait;

/// Resolves an opaque credential to a participant
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Fails with `PairingError::InvalidCredentials` or `PairingError::SessionExpired`
    async fn resolve(&self, token: &str) -> Result<ParticipantId>;
}
