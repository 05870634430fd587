use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use bson::{doc, oid::ObjectId};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Deserialize;
use validator::Validate;

use super::{fanout, publish_with_fallback, MessageState};
use crate::{
    auth::AuthUser,
    broker::events::{
        batch_status_key, message_key, status_key, BatchStatusFrame, BrokerEvent, MessageFrame,
        StatusFrame,
    },
    error::{AppError, AppResult},
    models::{Group, Message, MessageStatus},
};

// ============================================================================
// Input validation
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    /// 1:1 recipient. Exactly one of `receiver_id` / `group_id` must be set.
    pub receiver_id: Option<String>,
    pub group_id: Option<String>,
    #[validate(length(
        min = 1,
        max = 4000,
        message = "Message content must be 1–4 000 characters"
    ))]
    pub content: String,
    #[validate(url(message = "media_url must be a valid URL"))]
    pub media_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    /// Maximum number of messages to return (default 50, max 100).
    pub limit: Option<i64>,
    /// RFC3339 cursor: return messages created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Explicit 1:1 counterpart, overriding the path target.
    pub with: Option<String>,
    /// Explicit group id, overriding the group-probe heuristic.
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    /// Narrow the search to one conversation (group id or 1:1 counterpart).
    pub contact_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: MessageStatus,
}

fn validation_error(e: validator::ValidationErrors) -> AppError {
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

// ============================================================================
// Private helpers
// ============================================================================

/// Where a new message is headed.
#[derive(Debug, PartialEq, Eq)]
enum Recipient {
    Direct(ObjectId),
    Group(ObjectId),
}

/// Enforce the recipient discriminator invariant: exactly one of
/// `receiver_id` / `group_id`, and it must be a well-formed id.
fn resolve_recipient(
    receiver_id: Option<&str>,
    group_id: Option<&str>,
) -> AppResult<Recipient> {
    match (receiver_id, group_id) {
        (Some(receiver), None) => ObjectId::parse_str(receiver)
            .map(Recipient::Direct)
            .map_err(|_| AppError::Validation("Invalid receiver id".into())),
        (None, Some(group)) => ObjectId::parse_str(group)
            .map(Recipient::Group)
            .map_err(|_| AppError::Validation("Invalid group id".into())),
        _ => Err(AppError::Validation(
            "Specify exactly one of receiver_id or group_id".into(),
        )),
    }
}

fn page_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(50).clamp(1, 100)
}

fn parse_id(value: &str, what: &str) -> AppResult<ObjectId> {
    ObjectId::parse_str(value).map_err(|_| AppError::Validation(format!("Invalid {what} id")))
}

async fn fetch_group(state: &MessageState, group_id: ObjectId) -> AppResult<Group> {
    state
        .store
        .groups()
        .find_one(doc! { "_id": group_id })
        .await?
        .ok_or_else(|| AppError::NotFound("Group not found".into()))
}

fn require_member(group: &Group, user_id: &ObjectId) -> AppResult<()> {
    if group.is_member(user_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden("Not a member of this group".into()))
    }
}

/// Batch-resolve sender usernames for a page of messages. One query
/// regardless of page size (no N+1 on the hot read path).
async fn enrich_messages(
    state: &MessageState,
    messages: Vec<Message>,
) -> AppResult<Vec<MessageFrame>> {
    if messages.is_empty() {
        return Ok(vec![]);
    }

    let sender_ids: Vec<ObjectId> = messages
        .iter()
        .map(|m| m.sender_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let users: Vec<crate::models::User> = state
        .store
        .users()
        .find(doc! { "_id": { "$in": sender_ids } })
        .await?
        .try_collect()
        .await?;

    let usernames: HashMap<ObjectId, String> = users
        .into_iter()
        .filter_map(|u| u.id.map(|id| (id, u.username)))
        .collect();

    Ok(messages
        .iter()
        .map(|m| {
            let username = usernames.get(&m.sender_id).cloned().unwrap_or_default();
            MessageFrame::from_message(m, username)
        })
        .collect())
}

fn status_frame(message: &Message, status: MessageStatus, updated_at: DateTime<Utc>) -> StatusFrame {
    StatusFrame {
        message_id: message.id.map(|id| id.to_hex()).unwrap_or_default(),
        status,
        updated_at,
        sender_id: Some(message.sender_id.to_hex()),
        receiver_id: message.receiver_id.map(|id| id.to_hex()),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /messages — persist a message and hand it to the broker.
///
/// The message is durable once the insert succeeds; broker trouble degrades
/// delivery to best-effort but never fails the request.
pub async fn send_message(
    State(state): State<MessageState>,
    auth: AuthUser,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<MessageFrame>)> {
    req.validate().map_err(validation_error)?;

    let recipient = resolve_recipient(req.receiver_id.as_deref(), req.group_id.as_deref())?;
    let sender_id = auth.user_id();

    let (receiver_id, group) = match recipient {
        Recipient::Direct(receiver) => {
            if receiver == sender_id {
                return Err(AppError::Validation(
                    "Cannot send a message to yourself".into(),
                ));
            }
            state
                .store
                .users()
                .find_one(doc! { "_id": receiver })
                .await?
                .ok_or_else(|| AppError::NotFound("Recipient not found".into()))?;
            (Some(receiver), None)
        }
        Recipient::Group(group_id) => {
            let group = fetch_group(&state, group_id).await?;
            require_member(&group, &sender_id)?;
            (None, Some(group))
        }
    };

    let now = Utc::now();
    let mut message = Message {
        id: None,
        sender_id,
        receiver_id,
        group_id: group.as_ref().and_then(|g| g.id),
        content: req.content,
        media_url: req.media_url,
        status: MessageStatus::Sent,
        created_at: now,
        updated_at: now,
    };

    let inserted = state.store.messages().insert_one(&message).await?;
    message.id = inserted.inserted_id.as_object_id();

    let sender_username = state
        .store
        .users()
        .find_one(doc! { "_id": sender_id })
        .await?
        .map(|u| u.username)
        .unwrap_or_else(|| auth.username().to_string());

    let frame = MessageFrame::from_message(&message, sender_username);

    match (receiver_id, group) {
        (Some(receiver), _) => {
            publish_with_fallback(
                &state.broker,
                &message_key(&receiver),
                &BrokerEvent::Message(frame.clone()),
            )
            .await;
        }
        (None, Some(group)) => {
            // Fan-out happens off the request path so client latency does
            // not scale with group size.
            tokio::spawn(fanout::fan_out(state.clone(), frame.clone(), group));
        }
        (None, None) => unreachable!("recipient resolution guarantees a target"),
    }

    Ok((StatusCode::CREATED, Json(frame)))
}

/// GET /messages/:target — newest-first page of one conversation.
///
/// `target` is resolved by probing `groups`: a match means a group thread,
/// anything else is treated as the 1:1 counterpart. Callers that want
/// determinism pass the explicit `group_id` (or `with`) query instead.
pub async fn get_conversation(
    State(state): State<MessageState>,
    auth: AuthUser,
    Path(target): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> AppResult<Json<Vec<MessageFrame>>> {
    let caller = auth.user_id();
    let limit = page_limit(query.limit);

    let scope = conversation_scope(&state, &caller, &target, &query).await?;
    let mut filter = match scope {
        ConversationScope::Group(group_id) => doc! { "group_id": group_id },
        ConversationScope::Direct(other) => doc! {
            "$or": [
                { "sender_id": caller, "receiver_id": other },
                { "sender_id": other, "receiver_id": caller },
            ]
        },
    };
    if let Some(before) = query.before {
        filter.insert("created_at", doc! { "$lt": bson::DateTime::from_chrono(before) });
    }

    let messages: Vec<Message> = state
        .store
        .messages()
        .find(filter)
        .sort(doc! { "created_at": -1 })
        .limit(limit)
        .await?
        .try_collect()
        .await?;

    let frames = enrich_messages(&state, messages).await?;

    // Read-on-fetch: opening a 1:1 thread marks the unread tail as read,
    // off the request path. Group threads have no single receiver and are
    // left untouched.
    if let ConversationScope::Direct(other) = scope {
        let state = state.clone();
        tokio::spawn(async move {
            mark_conversation_read(state, other, caller).await;
        });
    }

    Ok(Json(frames))
}

#[derive(Clone, Copy)]
enum ConversationScope {
    Direct(ObjectId),
    Group(ObjectId),
}

async fn conversation_scope(
    state: &MessageState,
    caller: &ObjectId,
    target: &str,
    query: &ConversationQuery,
) -> AppResult<ConversationScope> {
    if let Some(gid) = &query.group_id {
        let group_id = parse_id(gid, "group")?;
        let group = fetch_group(state, group_id).await?;
        require_member(&group, caller)?;
        return Ok(ConversationScope::Group(group_id));
    }

    if let Some(with) = &query.with {
        return Ok(ConversationScope::Direct(parse_id(with, "user")?));
    }

    let target_id = parse_id(target, "target")?;
    if let Some(group) = state
        .store
        .groups()
        .find_one(doc! { "_id": target_id })
        .await?
    {
        require_member(&group, caller)?;
        return Ok(ConversationScope::Group(target_id));
    }
    Ok(ConversationScope::Direct(target_id))
}

/// Bulk-mark every unread message from `sender` to `receiver` as read, then
/// publish one composite batch event so the sender's client can clear the
/// whole tail at once.
async fn mark_conversation_read(state: MessageState, sender: ObjectId, receiver: ObjectId) {
    let now = Utc::now();
    let result = state
        .store
        .messages()
        .update_many(
            doc! {
                "sender_id": sender,
                "receiver_id": receiver,
                "status": { "$ne": "read" },
            },
            doc! {
                "$set": {
                    "status": "read",
                    "updated_at": bson::DateTime::from_chrono(now),
                }
            },
        )
        .await;

    match result {
        Ok(outcome) if outcome.modified_count > 0 => {
            let event =
                BrokerEvent::BatchStatus(BatchStatusFrame::read(&sender, &receiver, now));
            publish_with_fallback(&state.broker, &batch_status_key(&sender, &receiver), &event)
                .await;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(
                sender_id = %sender,
                receiver_id = %receiver,
                error = ?e,
                "Read-on-fetch bulk update failed"
            );
        }
    }
}

/// PATCH /messages/:id/status — advance a message's delivery status.
///
/// Only the receiver may advance it, and transitions are monotone: a
/// downgrade (or repeat) is acknowledged without a write or an event.
pub async fn update_status(
    State(state): State<MessageState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> AppResult<Json<StatusFrame>> {
    let message_id = parse_id(&id, "message")?;

    let message = state
        .store
        .messages()
        .find_one(doc! { "_id": message_id })
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;

    if message.receiver_id != Some(auth.user_id()) {
        return Err(AppError::Forbidden(
            "Only the receiver may update message status".into(),
        ));
    }

    if !message.status.advances_to(req.status) {
        return Ok(Json(status_frame(&message, message.status, message.updated_at)));
    }

    let now = Utc::now();
    // Filter on the observed status so concurrent updates cannot regress a
    // transition that already happened.
    let result = state
        .store
        .messages()
        .update_one(
            doc! { "_id": message_id, "status": message.status.to_string() },
            doc! {
                "$set": {
                    "status": req.status.to_string(),
                    "updated_at": bson::DateTime::from_chrono(now),
                }
            },
        )
        .await?;

    if result.modified_count == 0 {
        // Another writer advanced this message between the read and the
        // guarded write (auto-deliver, read-on-fetch, or a duplicate PATCH).
        // Report the state that actually persisted; the winning writer
        // already published its own event.
        let current = state
            .store
            .messages()
            .find_one(doc! { "_id": message_id })
            .await?
            .ok_or_else(|| AppError::NotFound("Message not found".into()))?;
        return Ok(Json(status_frame(&current, current.status, current.updated_at)));
    }

    let frame = status_frame(&message, req.status, now);
    publish_with_fallback(
        &state.broker,
        &status_key(&message_id),
        &BrokerEvent::MessageStatus(frame.clone()),
    )
    .await;

    Ok(Json(frame))
}

/// GET /messages/search — case-insensitive substring search over content,
/// scoped to the caller's own conversations.
pub async fn search_messages(
    State(state): State<MessageState>,
    auth: AuthUser,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Vec<MessageFrame>>> {
    let caller = auth.user_id();
    let needle = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::Validation("Search query must not be empty".into()))?;

    let content_filter = doc! { "$regex": regex::escape(needle), "$options": "i" };
    let limit = page_limit(query.limit);

    let filter = match &query.contact_id {
        Some(contact) => {
            let contact_id = parse_id(contact, "contact")?;
            match state
                .store
                .groups()
                .find_one(doc! { "_id": contact_id })
                .await?
            {
                Some(group) => {
                    require_member(&group, &caller)?;
                    doc! { "content": content_filter, "group_id": contact_id }
                }
                None => doc! {
                    "content": content_filter,
                    "$or": [
                        { "sender_id": caller, "receiver_id": contact_id },
                        { "sender_id": contact_id, "receiver_id": caller },
                    ]
                },
            }
        }
        None => {
            let group_ids: Vec<ObjectId> = state
                .store
                .groups()
                .find(doc! { "member_ids": caller })
                .await?
                .try_collect::<Vec<Group>>()
                .await?
                .into_iter()
                .filter_map(|g| g.id)
                .collect();

            doc! {
                "content": content_filter,
                "$or": [
                    { "sender_id": caller },
                    { "receiver_id": caller },
                    { "group_id": { "$in": group_ids } },
                ]
            }
        }
    };

    let messages: Vec<Message> = state
        .store
        .messages()
        .find(filter)
        .sort(doc! { "created_at": -1 })
        .limit(limit)
        .await?
        .try_collect()
        .await?;

    Ok(Json(enrich_messages(&state, messages).await?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_recipient_requires_exactly_one_discriminator() {
        let id = ObjectId::new().to_hex();

        assert!(matches!(
            resolve_recipient(Some(&id), None),
            Ok(Recipient::Direct(_))
        ));
        assert!(matches!(
            resolve_recipient(None, Some(&id)),
            Ok(Recipient::Group(_))
        ));
        assert!(resolve_recipient(Some(&id), Some(&id)).is_err());
        assert!(resolve_recipient(None, None).is_err());
    }

    #[test]
    fn resolve_recipient_rejects_malformed_ids() {
        assert!(resolve_recipient(Some("nope"), None).is_err());
        assert!(resolve_recipient(None, Some("nope")).is_err());
    }

    #[test]
    fn page_limit_defaults_and_clamps() {
        assert_eq!(page_limit(None), 50);
        assert_eq!(page_limit(Some(10)), 10);
        assert_eq!(page_limit(Some(0)), 1);
        assert_eq!(page_limit(Some(-5)), 1);
        assert_eq!(page_limit(Some(1000)), 100);
    }

    #[test]
    fn status_frame_populates_both_endpoints_for_direct_messages() {
        let sender = ObjectId::new();
        let receiver = ObjectId::new();
        let message = Message {
            id: Some(ObjectId::new()),
            sender_id: sender,
            receiver_id: Some(receiver),
            group_id: None,
            content: "hi".into(),
            media_url: None,
            status: MessageStatus::Sent,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let frame = status_frame(&message, MessageStatus::Delivered, Utc::now());
        assert_eq!(frame.sender_id.as_deref(), Some(sender.to_hex().as_str()));
        assert_eq!(
            frame.receiver_id.as_deref(),
            Some(receiver.to_hex().as_str())
        );
        assert_eq!(frame.status, MessageStatus::Delivered);
    }

    #[test]
    fn search_needle_is_regex_escaped() {
        // A literal ".*" in the query must not become a wildcard.
        assert_eq!(regex::escape("a.*b"), "a\\.\\*b");
    }
}
