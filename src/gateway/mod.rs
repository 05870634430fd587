pub mod connection_manager;
pub mod consumer;
pub mod handler;
pub mod proxy;

pub use connection_manager::{ConnectionManager, Outbound};
pub use handler::websocket_handler;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};

use crate::broker::Broker;
use crate::models::UserStatus;

/// Shared gateway state. Everything here is cheaply cloneable; cloning per
/// request and per connection is expected.
#[derive(Clone)]
pub struct GatewayState {
    pub connections: ConnectionManager,
    pub broker: Broker,
    pub jwt_secret: Arc<str>,
    pub http: reqwest::Client,
    pub message_service_url: String,
    pub user_service_url: String,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // WebSocket gateway
        .route("/ws", get(handler::websocket_handler))
        // Message service pass-through
        .route("/messages", any(proxy::proxy_messages))
        .route("/messages/*path", any(proxy::proxy_messages))
        // User service pass-through
        .route("/users/*path", any(proxy::proxy_users))
        .route("/groups", any(proxy::proxy_users))
        .route("/groups/*path", any(proxy::proxy_users))
        .with_state(state)
}

async fn health_check(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
    let broker_ok = state.broker.is_connected().await;
    let connections = state.connections.connection_count().await;

    let http_status = if broker_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": if broker_ok { "ok" } else { "degraded" },
            "service": "courier-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "broker": if broker_ok { "ok" } else { "unavailable" },
            "connections": connections,
        })),
    )
}

/// Graceful shutdown: close every socket cleanly and publish best-effort
/// offline presence for each drained user.
pub async fn shutdown(state: &GatewayState) {
    let users = state.connections.drain("server shutting down").await;
    for user_id in users {
        handler::publish_presence(state, &user_id, UserStatus::Offline).await;
    }
}
