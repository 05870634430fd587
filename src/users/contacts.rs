use std::collections::HashSet;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bson::{doc, oid::ObjectId, Bson};
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::handlers::parse_id;
use super::UserState;
use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{Contact, User, UserDto},
};

#[derive(Debug, Deserialize)]
pub struct AddContactRequest {
    pub contact_id: String,
}

/// Collapse the raw `distinct` results and explicit contact rows into a
/// unique id set, never including the caller themselves.
fn unique_counterparties(
    caller: ObjectId,
    explicit: Vec<ObjectId>,
    distinct_ids: Vec<Bson>,
) -> Vec<ObjectId> {
    let mut seen: HashSet<ObjectId> = explicit.into_iter().collect();
    for value in distinct_ids {
        if let Bson::ObjectId(id) = value {
            seen.insert(id);
        }
    }
    seen.remove(&caller);
    seen.into_iter().collect()
}

/// GET /users/contacts — the caller's contact list: explicitly added
/// contacts plus everyone they have exchanged 1:1 messages with.
pub async fn list_contacts(
    State(state): State<UserState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<UserDto>>> {
    let caller = auth.user_id();

    let explicit: Vec<ObjectId> = state
        .store
        .contacts()
        .find(doc! { "user_id": caller })
        .await?
        .try_collect::<Vec<Contact>>()
        .await?
        .into_iter()
        .map(|c| c.contact_id)
        .collect();

    let senders = state
        .store
        .messages()
        .distinct("sender_id", doc! { "receiver_id": caller })
        .await?;
    let receivers = state
        .store
        .messages()
        .distinct("receiver_id", doc! { "sender_id": caller })
        .await?;

    let mut ids = unique_counterparties(
        caller,
        explicit,
        senders.into_iter().chain(receivers).collect(),
    );
    if ids.is_empty() {
        return Ok(Json(vec![]));
    }
    ids.sort();

    let users: Vec<User> = state
        .store
        .users()
        .find(doc! { "_id": { "$in": ids } })
        .sort(doc! { "username": 1 })
        .await?
        .try_collect()
        .await?;

    Ok(Json(users.into_iter().map(UserDto::from).collect()))
}

/// POST /users/contacts — add a contact. Idempotent: adding an existing
/// contact returns 200 instead of 201.
pub async fn add_contact(
    State(state): State<UserState>,
    auth: AuthUser,
    Json(req): Json<AddContactRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let caller = auth.user_id();
    let contact_id = parse_id(&req.contact_id, "contact")?;

    if contact_id == caller {
        return Err(AppError::Validation(
            "Cannot add yourself as a contact".into(),
        ));
    }

    let contact_user = state
        .store
        .users()
        .find_one(doc! { "_id": contact_id })
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    let existing = state
        .store
        .contacts()
        .find_one(doc! { "user_id": caller, "contact_id": contact_id })
        .await?;
    if existing.is_some() {
        return Ok((
            StatusCode::OK,
            Json(json!({ "message": "Contact already exists" })),
        ));
    }

    state
        .store
        .contacts()
        .insert_one(&Contact {
            id: None,
            user_id: caller,
            contact_id,
            created_at: Utc::now(),
        })
        .await?;

    let dto: UserDto = contact_user.into();
    Ok((StatusCode::CREATED, Json(serde_json::to_value(dto).map_err(|_| AppError::Internal)?)))
}

/// DELETE /users/contacts/:id — remove a contact row.
pub async fn remove_contact(
    State(state): State<UserState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let contact_id = parse_id(&id, "contact")?;

    let result = state
        .store
        .contacts()
        .delete_one(doc! { "user_id": auth.user_id(), "contact_id": contact_id })
        .await?;

    if result.deleted_count == 0 {
        return Err(AppError::NotFound("Contact not found".into()));
    }

    Ok(Json(json!({ "message": "Contact removed" })))
}
