use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bson::oid::ObjectId;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::{GatewayState, Outbound};
use crate::auth::validate_token;
use crate::broker::events::{typing_key, BrokerEvent, PresenceFrame, TypingFrame, TypingTag};
use crate::models::UserStatus;

/// Control pings are emitted on this cadence...
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// ...and a connection that has not answered for this long is stale.
const STALE_AFTER: Duration = Duration::from_secs(60);

// ============================================================================
// Query params
// ============================================================================

/// JWT is passed as a query parameter because WebSocket upgrade requests are
/// plain GET requests and cannot carry an Authorization header reliably
/// across all client environments.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
}

// ============================================================================
// Inbound frames
// ============================================================================

/// A parsed client text frame. Anything that is not a typing notification is
/// treated as a message submission and forwarded to the message service.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientFrame {
    Typing(ClientTypingFrame),
    Submission(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct ClientTypingFrame {
    #[serde(rename = "type")]
    _tag: TypingTag,
    receiver_id: String,
    is_typing: bool,
}

// ============================================================================
// Upgrade handler
// ============================================================================

/// GET /ws?token=<jwt> — upgrade to a WebSocket connection.
///
/// The JWT is validated before the upgrade is accepted; invalid, expired, or
/// malformed tokens get a plain 401 with no side effects.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<GatewayState>,
) -> Response {
    let claims = match validate_token(&params.token, &state.jwt_secret) {
        Ok(c) => c,
        Err(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid or expired token" })),
            )
                .into_response();
        }
    };

    let user_id = claims.user_id.clone();
    let token = params.token;
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, token, state))
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn handle_socket(socket: WebSocket, user_id: String, token: String, state: GatewayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Registering closes any previous connection for this user while the
    // table's write lock is held, so split delivery is impossible.
    let conn_id = state.connections.register(&user_id, tx.clone()).await;
    publish_presence(&state, &user_id, UserStatus::Online).await;
    set_stored_status(&state, &user_id, &token, UserStatus::Online);

    // Forward outbound events from the channel to the socket. Runs until the
    // channel closes or a Close directive arrives.
    let mut send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Ping => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Read inbound frames and drive the keepalive clock.
    let recv_state = state.clone();
    let recv_user = user_id.clone();
    let recv_token = token.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if last_pong.elapsed() > STALE_AFTER {
                        tracing::info!(user_id = %recv_user, "Connection stale (no pong within window); closing");
                        break;
                    }
                    if tx.send(Outbound::Ping).is_err() {
                        break;
                    }
                }
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        // Any inbound traffic proves the peer is alive.
                        last_pong = Instant::now();
                        handle_text_frame(&recv_state, &recv_user, &recv_token, &tx, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    // Axum answers control pings with pongs transparently.
                    Some(Ok(Message::Ping(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(
                            user_id = %recv_user,
                            error = ?e,
                            "Socket receive error; closing connection"
                        );
                        break;
                    }
                }
            }
        }
    });

    // Wait for either task to finish — then abort the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Only the connection that still owns the table slot reports offline; a
    // superseded connection's cleanup must not shadow its replacement.
    if state.connections.remove(&user_id, conn_id).await {
        publish_presence(&state, &user_id, UserStatus::Offline).await;
        set_stored_status(&state, &user_id, &token, UserStatus::Offline);
    }
}

// ============================================================================
// Inbound frame handling
// ============================================================================

async fn handle_text_frame(
    state: &GatewayState,
    user_id: &str,
    token: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    text: &str,
) {
    // Application-level keepalive, kept alongside the control ping/pong
    // track for clients that cannot send control frames.
    if text == "ping" {
        let _ = tx.send(Outbound::Frame("pong".to_string()));
        return;
    }

    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        // Ignore unparseable frames — don't disconnect for bad JSON.
        return;
    };

    match frame {
        ClientFrame::Typing(typing) => {
            relay_typing(state, user_id, typing).await;
        }
        ClientFrame::Submission(_) => {
            submit_message(state, token, text).await;
        }
    }
}

/// Stamp the authenticated sender and a server-side timestamp, then publish
/// to the receiver's typing topic.
async fn relay_typing(state: &GatewayState, user_id: &str, typing: ClientTypingFrame) {
    let Ok(receiver_id) = ObjectId::parse_str(&typing.receiver_id) else {
        tracing::debug!(user_id = %user_id, "Typing frame with malformed receiver id; ignored");
        return;
    };

    let event = BrokerEvent::Typing(TypingFrame {
        tag: TypingTag::Typing,
        sender_id: user_id.to_string(),
        receiver_id: typing.receiver_id,
        is_typing: typing.is_typing,
        timestamp: Utc::now(),
    });

    if let Err(e) = state.broker.publish(&typing_key(&receiver_id), &event).await {
        tracing::warn!(user_id = %user_id, error = ?e, "Failed to publish typing event");
    }
}

/// Forward a socket message submission to the message service with the
/// connection's own bearer token. The created message comes back to the
/// participants through the broker, so the socket frame is never echoed.
async fn submit_message(state: &GatewayState, token: &str, body: &str) {
    let url = format!("{}/messages", state.message_service_url);
    let result = state
        .http
        .post(&url)
        .bearer_auth(token)
        .header("content-type", "application/json")
        .body(body.to_owned())
        .timeout(Duration::from_secs(5))
        .send()
        .await;

    match result {
        Ok(response) if !response.status().is_success() => {
            tracing::warn!(
                status = %response.status(),
                "Message service rejected socket submission"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = ?e, "Failed to forward socket submission to message service");
        }
    }
}

// ============================================================================
// Presence
// ============================================================================

/// Publish a presence event for this user. Failures are logged and never
/// break the connection.
pub async fn publish_presence(state: &GatewayState, user_id: &str, status: UserStatus) {
    let Ok(oid) = ObjectId::parse_str(user_id) else {
        return;
    };
    let event = BrokerEvent::Presence(PresenceFrame {
        user_id: user_id.to_string(),
        status,
    });

    if let Err(e) = state
        .broker
        .publish(&crate::broker::events::presence_key(&oid), &event)
        .await
    {
        tracing::warn!(user_id = %user_id, status = %status, error = ?e, "Failed to publish presence event");
    }
}

/// Best-effort write-through of the user's stored status via the user
/// service, using the connection's own credentials.
fn set_stored_status(state: &GatewayState, user_id: &str, token: &str, status: UserStatus) {
    let url = format!("{}/users/{}/status", state.user_service_url, user_id);
    let client = state.http.clone();
    let token = token.to_owned();
    let user_id = user_id.to_owned();

    tokio::spawn(async move {
        let result = client
            .patch(&url)
            .bearer_auth(token)
            .json(&json!({ "status": status }))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(user_id = %user_id, error = ?e, "Failed to persist presence status");
        }
    });
}

// Frame parsing is pure; exercised here without a socket.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_frames_parse_as_typing() {
        let text = r#"{"type":"typing","receiver_id":"507f1f77bcf86cd799439011","is_typing":true}"#;
        match serde_json::from_str::<ClientFrame>(text).unwrap() {
            ClientFrame::Typing(t) => {
                assert_eq!(t.receiver_id, "507f1f77bcf86cd799439011");
                assert!(t.is_typing);
            }
            ClientFrame::Submission(_) => panic!("typing frame parsed as submission"),
        }
    }

    #[test]
    fn submissions_parse_as_submission() {
        let text = r#"{"receiver_id":"507f1f77bcf86cd799439011","content":"hi"}"#;
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(text).unwrap(),
            ClientFrame::Submission(_)
        ));
    }

    #[test]
    fn unknown_type_field_is_a_submission() {
        // Only `type:"typing"` selects the typing path; other tags fall
        // through to the submission forwarder.
        let text = r#"{"type":"something-else","receiver_id":"x","is_typing":true}"#;
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(text).unwrap(),
            ClientFrame::Submission(_)
        ));
    }
}
