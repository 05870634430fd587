pub mod consumer;
pub mod fanout;
pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::auth::JwtSecret;
use crate::broker::events::BrokerEvent;
use crate::broker::{Broker, MESSAGE_EVENTS_QUEUE};
use crate::db::Store;

/// Shared message service state.
#[derive(Clone)]
pub struct MessageState {
    pub store: Store,
    pub broker: Broker,
    pub jwt_secret: Arc<str>,
}

impl FromRef<MessageState> for JwtSecret {
    fn from_ref(state: &MessageState) -> JwtSecret {
        JwtSecret(state.jwt_secret.clone())
    }
}

pub fn router(state: MessageState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/messages", post(handlers::send_message))
        // NOTE: /messages/search must not be captured by the :target route;
        // axum prefers the static segment, but keep it registered first so
        // the precedence is visible.
        .route("/messages/search", get(handlers::search_messages))
        .route("/messages/:target", get(handlers::get_conversation))
        // Same capture name as the conversation route; the router requires a
        // consistent parameter name at a shared position.
        .route("/messages/:target/status", patch(handlers::update_status))
        .with_state(state)
}

async fn health_check(State(state): State<MessageState>) -> (StatusCode, Json<Value>) {
    let db_ok = match state.store.health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = ?e, "Health check: document store ping failed");
            false
        }
    };
    let broker_ok = state.broker.is_connected().await;

    let http_status = if db_ok && broker_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": if db_ok && broker_ok { "ok" } else { "degraded" },
            "service": "courier-message-service",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "ok" } else { "unavailable" },
            "broker": if broker_ok { "ok" } else { "unavailable" },
        })),
    )
}

/// Publish to the topic exchange; if that fails, fall back to a direct
/// publish into the message service's own durable queue. A message that
/// survives neither path is already persisted, so callers log and move on —
/// delivery is best-effort until broker recovery.
pub(crate) async fn publish_with_fallback(broker: &Broker, routing_key: &str, event: &BrokerEvent) {
    if let Err(e) = broker.publish(routing_key, event).await {
        warn!(
            routing_key = %routing_key,
            error = ?e,
            "Exchange publish failed; falling back to direct queue publish"
        );
        if let Err(e) = broker.publish_direct(MESSAGE_EVENTS_QUEUE, event).await {
            error!(
                routing_key = %routing_key,
                error = ?e,
                "Direct queue publish failed; delivery is best-effort until broker recovery"
            );
        }
    }
}
