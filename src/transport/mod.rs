//! HTTP and WebSocket surface of the chat service
//!
//! Handlers resolve credentials through the session store and then call into
//! the pairing engine. They never touch a socket while the engine lock is held:
//! the engine only pushes into each connection's channel and the connection's
//! writer task owns the socket.

pub mod http;
pub mod ws;

use crate::metrics::MetricsCollector;
use crate::pairing::PairingEngine;
use crate::session::{InMemorySessionStore, SessionResolver};
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use http::ApiError;

/// Shared state for the chat API
#[derive(Clone)]
pub struct ApiState {
    pub engine: PairingEngine,
    /// Issues and tracks session tokens
    pub sessions: InMemorySessionStore,
    /// Resolves tokens to participants; the session store unless overridden
    pub resolver: Arc<dyn SessionResolver>,
    pub metrics: Arc<MetricsCollector>,
    /// Base for `websocket_url`; the request's Host header is used when absent
    pub public_base_url: Option<String>,
}

impl ApiState {
    pub fn new(
        engine: PairingEngine,
        sessions: InMemorySessionStore,
        metrics: Arc<MetricsCollector>,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            engine,
            resolver: Arc::new(sessions.clone()),
            sessions,
            metrics,
            public_base_url,
        }
    }
}

/// Build the chat API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(http::ping))
        .route("/session/anonymous", post(http::create_anonymous_session))
        .route("/session/skip", post(http::skip))
        .route("/account/register", post(http::register))
        .route("/login", post(http::login))
        .route("/me", get(http::me))
        .route("/ws/chat", get(ws::ws_upgrade))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// Count requests per matched route and status
async fn track_requests(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    state
        .metrics
        .record_http_request(&route, response.status().as_u16());
    response
}
