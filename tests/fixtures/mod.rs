//! Test fixtures: channel-backed clients and a canned session resolver

#![allow(dead_code)]

use async_trait::async_trait;
use ephemeral_chat::error::{PairingError, Result};
use ephemeral_chat::metrics::MetricsCollector;
use ephemeral_chat::pairing::{Connection, Delivery, EngineConfig, PairingEngine, Placement};
use ephemeral_chat::session::SessionResolver;
use ephemeral_chat::types::{ConnectionId, ConversationId, DisconnectPolicy, ServerMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;

pub fn test_engine(policy: DisconnectPolicy) -> PairingEngine {
    PairingEngine::new(
        EngineConfig {
            round_duration: Duration::from_secs(180),
            skip_cooldown: Duration::from_secs(10),
            disconnect_policy: policy,
        },
        Arc::new(MetricsCollector::new().expect("Failed to create collector")),
    )
}

/// A participant connected through an in-memory channel instead of a socket
pub struct TestClient {
    pub id: String,
    pub connection_id: ConnectionId,
    rx: UnboundedReceiver<Delivery>,
}

impl TestClient {
    pub fn connect(engine: &PairingEngine, id: &str) -> Self {
        let (connection, rx) = Connection::channel();
        let outcome = engine
            .connect(id, connection)
            .expect("connect should succeed");
        Self {
            id: id.to_string(),
            connection_id: outcome.connection_id,
            rx,
        }
    }

    pub fn disconnect(&self, engine: &PairingEngine) {
        engine
            .disconnect(&self.id, self.connection_id)
            .expect("disconnect should succeed");
    }

    /// Everything queued so far, closes included
    pub fn drain(&mut self) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = self.rx.try_recv() {
            out.push(delivery);
        }
        out
    }

    /// Only the messages queued so far
    pub fn messages(&mut self) -> Vec<ServerMessage> {
        self.drain()
            .into_iter()
            .filter_map(|delivery| match delivery {
                Delivery::Message(message) => Some(message),
                Delivery::Close { .. } => None,
            })
            .collect()
    }

    pub fn conversation(&self, engine: &PairingEngine) -> Option<ConversationId> {
        match engine.placement_of(&self.id).ok()? {
            Placement::InConversation(id) => Some(id),
            _ => None,
        }
    }
}

/// Resolver with a fixed token table
#[derive(Debug, Default)]
pub struct StaticSessionResolver {
    tokens: Mutex<HashMap<String, std::result::Result<String, &'static str>>>,
}

impl StaticSessionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, token: &str, participant_id: &str) -> Self {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(token.to_string(), Ok(participant_id.to_string()));
        }
        self
    }

    pub fn with_expired(self, token: &str) -> Self {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(token.to_string(), Err("expired"));
        }
        self
    }
}

#[async_trait]
impl SessionResolver for StaticSessionResolver {
    async fn resolve(&self, token: &str) -> Result<String> {
        let entry = self
            .tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(token).cloned());

        match entry {
            Some(Ok(participant_id)) => Ok(participant_id),
            Some(Err(_)) => Err(PairingError::SessionExpired.into()),
            None => Err(PairingError::InvalidCredentials.into()),
        }
    }
}
