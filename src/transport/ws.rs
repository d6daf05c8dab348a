//! WebSocket endpoint: one actor per connection
//!
//! The reader loop feeds client frames into the engine. A writer task owns the
//! socket sink and drains both the engine's `Delivery` channel and a control
//! channel used for ping, pong and close frames.

use crate::error::{pairing_error, PairingError};
use crate::pairing::{Connection, Delivery};
use crate::transport::ApiState;
use crate::types::{ClientMessage, ParticipantId, ServerMessage};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Session token expired
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
/// Session token unknown
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// GET /ws/chat?token=...
///
/// Authentication failures still upgrade, then close with 4001 or 4002 so
/// browsers can see the reason.
pub async fn ws_upgrade(
    State(state): State<ApiState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.resolver.resolve(&params.token).await {
        Ok(participant_id) => {
            ws.on_upgrade(move |socket| run_connection(socket, state, participant_id))
        }
        Err(err) => {
            let frame = auth_close_frame(&err);
            warn!("WebSocket auth failed ({}): {}", frame.code, err);

            ws.on_upgrade(move |mut socket| async move {
                let _ = socket.send(Message::Close(Some(frame))).await;
            })
        }
    }
}

/// Close frame for a token the resolver rejected
fn auth_close_frame(err: &anyhow::Error) -> CloseFrame {
    let (code, reason) = match pairing_error(err) {
        Some(PairingError::SessionExpired) => (CLOSE_TOKEN_EXPIRED, "Token expired"),
        _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
    };
    CloseFrame {
        code,
        reason: reason.into(),
    }
}

/// Drive one authenticated connection until either side goes away
pub async fn run_connection(socket: WebSocket, state: ApiState, participant_id: ParticipantId) {
    let (ws_sender, ws_receiver) = socket.split();
    serve_connection(ws_sender, ws_receiver, state, participant_id).await;
}

async fn serve_connection<S, R, E>(
    ws_sender: S,
    mut ws_receiver: R,
    state: ApiState,
    participant_id: ParticipantId,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let (connection, deliveries) = Connection::channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Message>();

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, deliveries, control_rx));

    let connection_id = match state.engine.connect(&participant_id, connection.clone()) {
        Ok(outcome) => outcome.connection_id,
        Err(e) => {
            error!("Failed to connect participant '{}': {}", participant_id, e);
            connection.close(1011, "internal error");
            let _ = writer_handle.await;
            return;
        }
    };

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_tx = control_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ticker = interval(PING_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = ws_receiver.next() => frame,
            _ = &mut writer_handle => {
                debug!("Writer for '{}' finished, ending connection", participant_id);
                break;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                handle_client_text(&state, &participant_id, &connection, text.as_str());
            }
            Some(Ok(Message::Binary(_))) => {
                connection.send(ServerMessage::Error {
                    message: "binary frames are not supported".to_string(),
                });
            }
            Some(Ok(Message::Pong(_))) => {
                let _ = pong_tx.send(());
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = control_tx.send(Message::Pong(data));
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("Client '{}' initiated close: {:?}", participant_id, frame);
                break;
            }
            Some(Err(e)) => {
                warn!("WebSocket receive error for '{}': {}", participant_id, e);
                break;
            }
            None => break,
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    match state.engine.disconnect(&participant_id, connection_id) {
        Ok(outcome) => debug!(
            "Connection {} for '{}' closed: {:?}",
            connection_id, participant_id, outcome
        ),
        Err(e) => error!(
            "Failed to disconnect participant '{}': {}",
            participant_id, e
        ),
    }
}

fn handle_client_text(state: &ApiState, participant_id: &str, connection: &Connection, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Malformed frame from '{}': {}", participant_id, e);
            connection.send(ServerMessage::Error {
                message: format!("malformed message: {}", e),
            });
            return;
        }
    };

    match message {
        ClientMessage::Chat {
            conversation_id,
            text,
        } => {
            if let Err(e) = state
                .engine
                .relay_client_chat(participant_id, &conversation_id, &text)
            {
                error!("Relay failed for '{}': {}", participant_id, e);
                connection.send(ServerMessage::Error {
                    message: "internal error".to_string(),
                });
            }
        }
        ClientMessage::Skip => match state.engine.skip(participant_id) {
            Ok(_) => {}
            Err(e) => match pairing_error(&e) {
                Some(PairingError::SkipRateLimited { retry_after_ms, .. }) => {
                    connection.send(ServerMessage::SkipRejected {
                        retry_after_ms: *retry_after_ms,
                    });
                }
                _ => {
                    error!("Skip failed for '{}': {}", participant_id, e);
                    connection.send(ServerMessage::Error {
                        message: "internal error".to_string(),
                    });
                }
            },
        },
    }
}

/// Owns the sink; ends after sending a close frame or when the socket fails
async fn writer_task<S>(
    mut sink: S,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut control: mpsc::UnboundedReceiver<Message>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let message = tokio::select! {
            delivery = deliveries.recv() => match delivery {
                Some(Delivery::Message(message)) => match serde_json::to_string(&message) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        error!("Failed to encode {} message: {}", message.kind(), e);
                        continue;
                    }
                },
                Some(Delivery::Close { code, reason }) => Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                None => break,
            },
            control = control.recv() => match control {
                Some(message) => message,
                None => break,
            },
        };

        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            info!("Closed connection from server side");
            break;
        }
    }
}
