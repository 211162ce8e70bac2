use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ApiError, SharedState};
use super::auth::token_from_headers;
use super::db::DbHandle;
use super::models::*;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    NotificationCreated {
        notification: Notification,
    },
    PickupUpdated {
        pickup: PickupRequest,
    },
    OrderUpdated {
        order: MarketOrder,
    },
}

/// A serialized message addressed to one user's sockets.
#[derive(Debug, Clone)]
pub struct WsEnvelope {
    pub user_id: i64,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct WsAuth {
    pub token: Option<String>,
}

// ── WebSocket handler ────────────────────────────────────────────────

/// Upgrade to a notification stream for the authenticated user. Browsers
/// cannot set headers on a WebSocket handshake, so `?token=` is accepted as
/// well as the usual bearer header and session cookie.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(auth): Query<WsAuth>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = auth
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| token_from_headers(&headers))
        .ok_or_else(|| ApiError::Unauthorized("Authentication required".into()))?;
    let session_token = token.clone();
    let user = state.db.call(move |db| db.authenticate(&session_token)).await?;
    let session = SocketSession {
        db: state.db.clone(),
        token,
        user_id: user.id,
    };
    let rx = state.ws_tx.subscribe();
    tracing::debug!(user_id = user.id, "websocket connected");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session, rx)))
}

/// The session a socket was opened with, re-checked on every keepalive.
struct SocketSession {
    db: DbHandle,
    token: String,
    user_id: i64,
}

/// Whether `token` still resolves to an active session for `user_id`.
async fn session_still_valid(db: &DbHandle, token: &str, user_id: i64) -> bool {
    let token = token.to_string();
    match db.call(move |db| db.authenticate(&token)).await {
        Ok(user) => user.id == user_id,
        Err(e) => {
            tracing::debug!(user_id, error = %e, "websocket session ended");
            false
        }
    }
}

async fn handle_socket(socket: WebSocket, session: SocketSession, rx: broadcast::Receiver<WsEnvelope>) {
    let user_id = session.user_id;
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, session).await;
    tracing::debug!(user_id, "websocket closed");
}

/// Forward the user's messages and answer keepalive pongs. Exits when the
/// client goes away or misses a pong for longer than [`PONG_TIMEOUT`], and
/// on the first ping tick after the session stops authenticating.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<WsEnvelope>,
    session: SocketSession,
) {
    let user_id = session.user_id;
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if !session_still_valid(&session.db, &session.token, user_id).await {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(envelope) if envelope.user_id == user_id => {
                        if sender.send(Message::Text(envelope.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(user_id, skipped, "websocket client lagged");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helpers ────────────────────────────────────────────────

/// Serialize and send a message to one user's connected sockets.
/// Returns silently even if nobody is listening.
pub fn send_to_user(tx: &broadcast::Sender<WsEnvelope>, user_id: i64, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(payload) => {
            let _ = tx.send(WsEnvelope { user_id, payload });
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize websocket message");
        }
    }
}

/// Push freshly committed notifications to their owners.
pub fn push_notifications(tx: &broadcast::Sender<WsEnvelope>, notifications: Vec<Notification>) {
    for notification in notifications {
        let user_id = notification.user_id;
        send_to_user(tx, user_id, &WsMessage::NotificationCreated { notification });
    }
}
