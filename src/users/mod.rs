pub mod contacts;
pub mod groups;
pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::JwtSecret;
use crate::db::Store;

/// Shared user service state.
#[derive(Clone)]
pub struct UserState {
    pub store: Store,
    pub jwt_secret: Arc<str>,
    pub jwt_expiration_hours: i64,
}

impl FromRef<UserState> for JwtSecret {
    fn from_ref(state: &UserState) -> JwtSecret {
        JwtSecret(state.jwt_secret.clone())
    }
}

pub fn router(state: UserState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Public auth surface
        .route("/users/register", post(handlers::register))
        .route("/users/login", post(handlers::login))
        // NOTE: the literal segments /users/search and /users/contacts must
        // not be swallowed by the :id capture; axum prefers static segments,
        // but keep them registered first so the precedence is visible.
        .route("/users/search", get(handlers::search_users))
        .route("/users/contacts", get(contacts::list_contacts))
        .route("/users/contacts", post(contacts::add_contact))
        .route("/users/contacts/:id", delete(contacts::remove_contact))
        .route("/users/:id", get(handlers::get_user))
        .route("/users/:id", put(handlers::update_user))
        .route("/users/:id/status", patch(handlers::update_status))
        // Group directory
        .route("/groups", post(groups::create_group))
        .route("/groups", get(groups::list_groups))
        .with_state(state)
}

async fn health_check(State(state): State<UserState>) -> (StatusCode, Json<Value>) {
    let db_ok = match state.store.health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = ?e, "Health check: document store ping failed");
            false
        }
    };

    let http_status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "service": "courier-user-service",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "ok" } else { "unavailable" },
        })),
    )
}
