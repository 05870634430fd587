use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use bson::{doc, oid::ObjectId};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::options::ReturnDocument;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::UserState;
use crate::{
    auth::{create_token, hash_password, verify_password, AuthUser},
    broker::events::PresenceFrame,
    error::{AppError, AppResult},
    models::{User, UserDto, UserStatus},
};

static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_]{3,32}$").expect("username regex is valid")
});

// ============================================================================
// Input validation
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(regex(
        path = *USERNAME_REGEX,
        message = "Username must be 3–32 characters of letters, digits, or underscores"
    ))]
    pub username: String,
    #[validate(length(min = 8, max = 128, message = "Password must be 8–128 characters"))]
    pub password: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(max = 128))]
    pub full_name: Option<String>,
    #[validate(url(message = "avatar_url must be a valid URL"))]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserDto,
}

#[derive(Debug, Deserialize)]
pub struct SearchUsersQuery {
    pub query: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(length(max = 128))]
    pub full_name: Option<String>,
    #[validate(url(message = "avatar_url must be a valid URL"))]
    pub avatar_url: Option<String>,
    pub status: Option<UserStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: UserStatus,
}

pub(crate) fn validation_error(e: validator::ValidationErrors) -> AppError {
    AppError::Validation(
        e.field_errors()
            .values()
            .flat_map(|v| v.iter())
            .filter_map(|e| e.message.as_ref())
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

pub(crate) fn parse_id(value: &str, what: &str) -> AppResult<ObjectId> {
    ObjectId::parse_str(value).map_err(|_| AppError::Validation(format!("Invalid {what} id")))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /users/register — create an account.
///
/// Uniqueness is enforced by the store's unique indexes; a duplicate
/// username or email surfaces as 409 through the error layer.
pub async fn register(
    State(state): State<UserState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<UserDto>)> {
    req.validate().map_err(validation_error)?;

    let now = Utc::now();
    let mut user = User {
        id: None,
        username: req.username,
        email: req.email,
        password_hash: hash_password(&req.password)?,
        full_name: req.full_name,
        avatar_url: req.avatar_url,
        status: UserStatus::Offline,
        created_at: now,
        updated_at: now,
        last_login: now,
    };

    let inserted = state.store.users().insert_one(&user).await?;
    user.id = inserted.inserted_id.as_object_id();

    info!(username = %user.username, "Registered new user");
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// POST /users/login — verify credentials and mint a bearer token.
pub async fn login(
    State(state): State<UserState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let user = state
        .store
        .users()
        .find_one(doc! { "username": &req.username })
        .await?
        .ok_or_else(|| AppError::Auth("Invalid username or password".into()))?;

    if !verify_password(&req.password, &user.password_hash)? {
        return Err(AppError::Auth("Invalid username or password".into()));
    }

    let user_id = user.id.ok_or(AppError::Internal)?;
    let (token, expires_at) = create_token(
        user_id,
        user.username.clone(),
        &state.jwt_secret,
        state.jwt_expiration_hours,
    )?;

    // Best effort; login must not fail on a bookkeeping write.
    let _ = state
        .store
        .users()
        .update_one(
            doc! { "_id": user_id },
            doc! { "$set": { "last_login": bson::DateTime::from_chrono(Utc::now()) } },
        )
        .await;

    Ok(Json(LoginResponse {
        token,
        expires_at,
        user: user.into(),
    }))
}

/// GET /users/search?query&limit — substring match on username or full name,
/// excluding the caller.
pub async fn search_users(
    State(state): State<UserState>,
    auth: AuthUser,
    Query(params): Query<SearchUsersQuery>,
) -> AppResult<Json<Vec<UserDto>>> {
    let needle = params
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::Validation("Search query must not be empty".into()))?;

    let pattern = doc! { "$regex": regex::escape(needle), "$options": "i" };
    let limit = params.limit.unwrap_or(20).clamp(1, 100);

    let users: Vec<User> = state
        .store
        .users()
        .find(doc! {
            "_id": { "$ne": auth.user_id() },
            "$or": [
                { "username": pattern.clone() },
                { "full_name": pattern },
            ],
        })
        .sort(doc! { "username": 1 })
        .limit(limit)
        .await?
        .try_collect()
        .await?;

    Ok(Json(users.into_iter().map(UserDto::from).collect()))
}

/// GET /users/:id — public user summary.
pub async fn get_user(
    State(state): State<UserState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<UserDto>> {
    let user_id = parse_id(&id, "user")?;
    let user = state
        .store
        .users()
        .find_one(doc! { "_id": user_id })
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(Json(user.into()))
}

/// PUT /users/:id — update own profile. Only provided fields are written.
pub async fn update_user(
    State(state): State<UserState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> AppResult<Json<UserDto>> {
    req.validate().map_err(validation_error)?;

    let user_id = parse_id(&id, "user")?;
    if user_id != auth.user_id() {
        return Err(AppError::Forbidden("Cannot update another user".into()));
    }

    let mut set = doc! { "updated_at": bson::DateTime::from_chrono(Utc::now()) };
    if let Some(full_name) = req.full_name {
        set.insert("full_name", full_name);
    }
    if let Some(avatar_url) = req.avatar_url {
        set.insert("avatar_url", avatar_url);
    }
    if let Some(status) = req.status {
        set.insert("status", status.to_string());
    }

    let updated = state
        .store
        .users()
        .find_one_and_update(doc! { "_id": user_id }, doc! { "$set": set })
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(Json(updated.into()))
}

/// PATCH /users/:id/status — set own presence status in the directory.
/// Called by the user's client, and by the gateway (with the connection's
/// token) on connect/disconnect.
pub async fn update_status(
    State(state): State<UserState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> AppResult<Json<PresenceFrame>> {
    let user_id = parse_id(&id, "user")?;
    if user_id != auth.user_id() {
        return Err(AppError::Forbidden(
            "Cannot update another user's status".into(),
        ));
    }

    let result = state
        .store
        .users()
        .update_one(
            doc! { "_id": user_id },
            doc! { "$set": {
                "status": req.status.to_string(),
                "updated_at": bson::DateTime::from_chrono(Utc::now()),
            }},
        )
        .await?;

    if result.matched_count == 0 {
        return Err(AppError::NotFound("User not found".into()));
    }

    Ok(Json(PresenceFrame {
        user_id: user_id.to_hex(),
        status: req.status,
    }))
}

// ============================================================================
// Tests
// ============================================================================
