//! In-memory session and account store
//!
//! Tokens are random opaque strings mapped to a participant and an expiry.
//! Accounts are a username to participant mapping; nothing is persisted.

use crate::config::SessionSettings;
use crate::error::{PairingError, Result};
use crate::session::SessionResolver;
use crate::types::ParticipantId;
use crate::utils::{generate_participant_id, generate_token};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

const MAX_USERNAME_LEN: usize = 32;

/// How long an expired token keeps resolving as expired rather than unknown
const EXPIRED_TOKEN_GRACE: Duration = Duration::from_secs(3600);

/// How a session was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Anonymous,
    Registered,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Anonymous => "anonymous",
            SessionKind::Registered => "registered",
        }
    }
}

/// A freshly issued session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedSession {
    pub token: String,
    pub participant_id: ParticipantId,
    pub kind: SessionKind,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    participant_id: ParticipantId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<String, SessionRecord>,
    /// Expired token -> when to forget it
    expired: HashMap<String, Instant>,
    /// username -> participant
    accounts: HashMap<String, ParticipantId>,
    /// participant -> username
    usernames: HashMap<ParticipantId, String>,
}

/// Session store backed by process memory
#[derive(Clone)]
pub struct InMemorySessionStore {
    state: Arc<RwLock<StoreState>>,
    anonymous_ttl: Duration,
    registered_ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(settings: &SessionSettings) -> Self {
        Self::with_ttls(settings.anonymous_ttl(), settings.registered_ttl())
    }

    pub fn with_ttls(anonymous_ttl: Duration, registered_ttl: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            anonymous_ttl,
            registered_ttl,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| {
            PairingError::InternalError {
                message: "Failed to acquire session store read lock".to_string(),
            }
            .into()
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| {
            PairingError::InternalError {
                message: "Failed to acquire session store write lock".to_string(),
            }
            .into()
        })
    }

    fn issue(
        &self,
        state: &mut StoreState,
        participant_id: &str,
        kind: SessionKind,
    ) -> IssuedSession {
        let expires_in = match kind {
            SessionKind::Anonymous => self.anonymous_ttl,
            SessionKind::Registered => self.registered_ttl,
        };
        let token = generate_token();
        state.sessions.insert(
            token.clone(),
            SessionRecord {
                participant_id: participant_id.to_string(),
                expires_at: Instant::now() + expires_in,
            },
        );

        IssuedSession {
            token,
            participant_id: participant_id.to_string(),
            kind,
            expires_in,
        }
    }

    /// Issue a token for a brand-new anonymous participant
    pub fn create_anonymous(&self) -> Result<IssuedSession> {
        let mut state = self.write()?;
        let participant_id = generate_participant_id();
        let session = self.issue(&mut state, &participant_id, SessionKind::Anonymous);

        info!("Anonymous session created for '{}'", participant_id);
        Ok(session)
    }

    /// Claim a username, linking it to the caller's participant when `existing_token` is valid
    ///
    /// An invalid or expired `existing_token` is ignored and a new participant is created.
    pub fn register(&self, username: &str, existing_token: Option<&str>) -> Result<IssuedSession> {
        let username = validate_username(username)?;
        let mut state = self.write()?;

        if state.accounts.contains_key(&username) {
            return Err(PairingError::UsernameTaken { username }.into());
        }

        let existing = existing_token
            .and_then(|token| state.sessions.get(token))
            .filter(|record| record.expires_at > Instant::now())
            .map(|record| record.participant_id.clone());
        let participant_id = existing.unwrap_or_else(generate_participant_id);

        if let Some(previous) = state.usernames.remove(&participant_id) {
            state.accounts.remove(&previous);
            debug!("Participant '{}' released username '{}'", participant_id, previous);
        }
        state.accounts.insert(username.clone(), participant_id.clone());
        state
            .usernames
            .insert(participant_id.clone(), username.clone());

        let session = self.issue(&mut state, &participant_id, SessionKind::Registered);
        info!("Participant '{}' registered as '{}'", participant_id, username);
        Ok(session)
    }

    /// Issue a token for an existing account
    pub fn login(&self, username: &str) -> Result<IssuedSession> {
        let mut state = self.write()?;
        let participant_id = state
            .accounts
            .get(username.trim())
            .cloned()
            .ok_or(PairingError::InvalidCredentials)?;

        let session = self.issue(&mut state, &participant_id, SessionKind::Registered);
        info!("Participant '{}' logged in as '{}'", participant_id, username);
        Ok(session)
    }

    pub fn username_of(&self, participant_id: &str) -> Result<Option<String>> {
        Ok(self.read()?.usernames.get(participant_id).cloned())
    }

    /// Drop expired tokens; returns how many were removed
    ///
    /// Removed tokens are remembered for a grace period so they still resolve
    /// as expired instead of unknown.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut state = self.write()?;
        let now = Instant::now();

        let expired: Vec<(String, Instant)> = state
            .sessions
            .iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(token, record)| (token.clone(), record.expires_at))
            .collect();
        for (token, expires_at) in &expired {
            state.sessions.remove(token);
            state
                .expired
                .insert(token.clone(), *expires_at + EXPIRED_TOKEN_GRACE);
        }
        state.expired.retain(|_, forget_at| *forget_at > now);

        if !expired.is_empty() {
            debug!("Purged {} expired sessions", expired.len());
        }
        Ok(expired.len())
    }

    pub fn session_count(&self) -> Result<usize> {
        Ok(self.read()?.sessions.len())
    }
}

#[async_trait]
impl SessionResolver for InMemorySessionStore {
    async fn resolve(&self, token: &str) -> Result<ParticipantId> {
        {
            let state = self.read()?;
            match state.sessions.get(token) {
                Some(record) if record.expires_at > Instant::now() => {
                    return Ok(record.participant_id.clone())
                }
                Some(_) => {}
                None if state.expired.contains_key(token) => {
                    return Err(PairingError::SessionExpired.into())
                }
                None => return Err(PairingError::InvalidCredentials.into()),
            }
        }

        let mut state = self.write()?;
        if let Some(record) = state.sessions.remove(token) {
            state
                .expired
                .insert(token.to_string(), record.expires_at + EXPIRED_TOKEN_GRACE);
        }
        Err(PairingError::SessionExpired.into())
    }
}

fn validate_username(raw: &str) -> Result<String> {
    let username = raw.trim();
    let reason = if username.is_empty() {
        Some("must not be empty")
    } else if username.chars().count() > MAX_USERNAME_LEN {
        Some("must be at most 32 characters")
    } else if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        Some("may only contain letters, digits, '_', '-' and '.'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PairingError::InvalidUsername {
            username: raw.to_string(),
            reason: reason.to_string(),
        }
        .into()),
        None => Ok(username.to_string()),
    }
}
