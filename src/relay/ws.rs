//! Websocket endpoint: fans out relay events to every connected client and
//! records acknowledgements sent back over the same connection.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::{BroadcastBus, NOTIFICATIONS_TOPIC};
use crate::db::{self, Pool};

// Close codes in the application range; each failure mode gets its own.
pub const CLOSE_INVALID_JSON: u16 = 4000;
pub const CLOSE_INVALID_MESSAGE_FORMAT: u16 = 4001;
pub const CLOSE_USER_DOES_NOT_EXIST: u16 = 4002;
pub const CLOSE_NOTIFICATION_DOES_NOT_EXIST: u16 = 4003;

#[derive(Clone)]
pub struct WsState {
    pub pool: Pool,
    pub bus: Arc<BroadcastBus>,
}

pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws/notifications", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Inbound acknowledgement message. Ids arrive as strings on the wire.
#[derive(Debug, Deserialize)]
struct AckMessage {
    user_id: String,
    notification_id: String,
    #[serde(default)]
    message: Option<String>,
}

/// How an acknowledgement attempt failed: the error payload to answer with
/// and the close code to hang up with.
#[derive(Debug, PartialEq, Eq)]
pub struct AckFailure {
    pub payload: String,
    pub close_code: u16,
}

impl AckFailure {
    fn new(reason: &str, close_code: u16) -> Self {
        Self {
            payload: json!({ "error": reason }).to_string(),
            close_code,
        }
    }
}

/// Validate and apply one inbound acknowledgement. Split from the socket
/// loop so the protocol is testable without a connection.
pub async fn handle_ack(pool: &Pool, text: &str) -> Result<String, AckFailure> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|_| AckFailure::new("invalid JSON", CLOSE_INVALID_JSON))?;
    let msg: AckMessage = serde_json::from_value(value)
        .map_err(|_| AckFailure::new("invalid message format", CLOSE_INVALID_MESSAGE_FORMAT))?;

    let user_id: i64 = msg
        .user_id
        .parse()
        .map_err(|_| AckFailure::new("invalid message format", CLOSE_INVALID_MESSAGE_FORMAT))?;
    let notification_id: i64 = msg
        .notification_id
        .parse()
        .map_err(|_| AckFailure::new("invalid message format", CLOSE_INVALID_MESSAGE_FORMAT))?;

    let user = db::get_user(pool, user_id)
        .await
        .map_err(|_| AckFailure::new("user lookup failed", CLOSE_USER_DOES_NOT_EXIST))?;
    if user.is_none() {
        return Err(AckFailure::new(
            "user does not exist",
            CLOSE_USER_DOES_NOT_EXIST,
        ));
    }
    let notification = db::get_notification(pool, notification_id)
        .await
        .map_err(|_| {
            AckFailure::new(
                "notification lookup failed",
                CLOSE_NOTIFICATION_DOES_NOT_EXIST,
            )
        })?;
    if notification.is_none() {
        return Err(AckFailure::new(
            "notification does not exist",
            CLOSE_NOTIFICATION_DOES_NOT_EXIST,
        ));
    }

    db::acknowledge_notification(pool, notification_id, user_id, msg.message.as_deref())
        .await
        .map_err(|_| {
            AckFailure::new(
                "notification lookup failed",
                CLOSE_NOTIFICATION_DOES_NOT_EXIST,
            )
        })?;

    Ok(json!({ "status": "acknowledged" }).to_string())
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.bus.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) if event.topic == NOTIFICATIONS_TOPIC => {
                        if sender.send(Message::Text(event.payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged; events dropped for this client");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match handle_ack(&state.pool, &text).await {
                            Ok(response) => {
                                if sender.send(Message::Text(response)).await.is_err() {
                                    break;
                                }
                            }
                            Err(failure) => {
                                let _ = sender.send(Message::Text(failure.payload.clone())).await;
                                let _ = sender
                                    .send(Message::Close(Some(CloseFrame {
                                        code: failure.close_code,
                                        reason: Cow::Borrowed("acknowledgement rejected"),
                                    })))
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("websocket client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(?err, "websocket error");
                        break;
                    }
                }
            }
        }
    }
}
