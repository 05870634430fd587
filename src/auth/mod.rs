use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
    Json, RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use bson::oid::ObjectId;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::error::{AppError, AppResult};

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Hex-encoded document id of the authenticated user.
    #[serde(rename = "UserID")]
    pub user_id: String,
    pub username: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    fn new(user_id: ObjectId, username: String, expiration_hours: i64) -> Self {
        let now = Utc::now();
        let exp = now + Duration::hours(expiration_hours);

        Claims {
            user_id: user_id.to_hex(),
            username,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn user_object_id(&self) -> AppResult<ObjectId> {
        ObjectId::parse_str(&self.user_id)
            .map_err(|_| AppError::Auth("Invalid user ID in token".into()))
    }
}

// ============================================================================
// JWT Operations
// ============================================================================

/// Mint an HS256 token for the given user; returns the token together with
/// its expiry so login responses can report `expires_at`.
pub fn create_token(
    user_id: ObjectId,
    username: String,
    secret: &str,
    expiration_hours: i64,
) -> AppResult<(String, DateTime<Utc>)> {
    let claims = Claims::new(user_id, username, expiration_hours);
    let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(AppError::Internal)?;

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!("Failed to create token: {:?}", e);
        AppError::Auth("Failed to create token".into())
    })?;

    Ok((token, expires_at))
}

pub fn validate_token(token: &str, secret: &str) -> AppResult<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::warn!("Token validation failed: {:?}", e);
        AppError::Auth("Invalid or expired token".into())
    })
}

// ============================================================================
// Password Hashing
// ============================================================================

pub fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, 12).map_err(|e| {
        tracing::error!("Failed to hash password: {:?}", e);
        AppError::Internal
    })
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| {
        tracing::error!("Failed to verify password: {:?}", e);
        AppError::Internal
    })
}

// ============================================================================
// Auth Middleware
// ============================================================================

/// Signing secret newtype so every service state can hand the extractor its
/// secret via `FromRef` without the extractor depending on a concrete state.
#[derive(Clone)]
pub struct JwtSecret(pub Arc<str>);

/// Authenticated user extracted from a valid bearer token.
///
/// Fields are private: the only valid constructor is the `FromRequestParts`
/// impl, preventing handlers from forging an `AuthUser` via struct literal.
pub struct AuthUser {
    user_id: ObjectId,
    username: String,
}

impl AuthUser {
    pub fn user_id(&self) -> ObjectId {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

type AuthRejection = (StatusCode, Json<serde_json::Value>);

fn auth_error(message: &str) -> AuthRejection {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message })))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    JwtSecret: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| auth_error("Missing or invalid Authorization header"))?;

        let secret = JwtSecret::from_ref(state);
        let claims = validate_token(bearer.token(), &secret.0)
            .map_err(|_| auth_error("Invalid or expired token"))?;

        let user_id = claims
            .user_object_id()
            .map_err(|_| auth_error("Invalid token subject"))?;

        Ok(AuthUser {
            user_id,
            username: claims.username,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
