use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mongodb::error::{ErrorKind, WriteError, WriteFailure};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(mongodb::error::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// An upstream service the gateway proxies to could not be reached.
    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    #[error("Internal server error")]
    Internal,
}

/// Map MongoDB errors to AppError, with special handling for duplicate-key
/// violations (server code 11000) so they surface as 409 Conflict rather
/// than 500 Internal Server Error.
impl From<mongodb::error::Error> for AppError {
    fn from(e: mongodb::error::Error) -> Self {
        if let Some(write_error) = duplicate_key_error(&e) {
            let message = if write_error.message.contains("username") {
                "Username already taken"
            } else if write_error.message.contains("email") {
                "Email already registered"
            } else {
                "Resource already exists"
            };
            return AppError::Conflict(message.into());
        }
        AppError::Database(e)
    }
}

fn duplicate_key_error(e: &mongodb::error::Error) -> Option<&WriteError> {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000 => Some(we),
        _ => None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".into())
            }
            AppError::Broker(e) => {
                tracing::error!("Broker error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Broker error".into())
            }
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal => {
                tracing::error!("Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
