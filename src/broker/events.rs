use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageStatus, UserStatus};

// ============================================================================
// Routing keys
// ============================================================================

pub fn message_key(user_id: &ObjectId) -> String {
    format!("message.{}", user_id.to_hex())
}

pub fn status_key(message_id: &ObjectId) -> String {
    format!("status.{}", message_id.to_hex())
}

pub fn batch_status_key(sender_id: &ObjectId, receiver_id: &ObjectId) -> String {
    format!(
        "status.batch.{}.{}",
        sender_id.to_hex(),
        receiver_id.to_hex()
    )
}

pub fn presence_key(user_id: &ObjectId) -> String {
    format!("status.user.{}", user_id.to_hex())
}

pub fn typing_key(user_id: &ObjectId) -> String {
    format!("typing.{}", user_id.to_hex())
}

// ============================================================================
// Literal frame tags
// ============================================================================

/// The `"type": "typing"` literal on typing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypingTag {
    #[serde(rename = "typing")]
    Typing,
}

/// The `"type": "batch"` literal on batch status frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchTag {
    #[serde(rename = "batch")]
    Batch,
}

// ============================================================================
// Wire frames (socket bodies and broker payloads)
// ============================================================================

/// Full message object as returned by POST /messages and delivered to the
/// receiving client's socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFrame {
    pub id: String,
    pub sender_id: String,
    pub sender_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl MessageFrame {
    pub fn from_message(message: &Message, sender_username: String) -> Self {
        MessageFrame {
            id: message.id.map(|id| id.to_hex()).unwrap_or_default(),
            sender_id: message.sender_id.to_hex(),
            sender_username,
            receiver_id: message.receiver_id.map(|id| id.to_hex()),
            group_id: message.group_id.map(|id| id.to_hex()),
            content: message.content.clone(),
            media_url: message.media_url.clone(),
            created_at: message.created_at,
            status: message.status,
        }
    }
}

/// Per-message status update, routed to the sender so their client can
/// advance the sent/delivered/read ticks.
///
/// Producers always populate `sender_id` and `receiver_id`; consumers must
/// tolerate their absence (older producers omitted them).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFrame {
    pub message_id: String,
    pub status: MessageStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
}

/// Composite status update covering the whole unread tail of a 1:1
/// conversation, produced by read-on-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusFrame {
    #[serde(rename = "type")]
    pub tag: BatchTag,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: MessageStatus,
    pub updated_at: DateTime<Utc>,
}

impl BatchStatusFrame {
    pub fn read(sender_id: &ObjectId, receiver_id: &ObjectId, updated_at: DateTime<Utc>) -> Self {
        BatchStatusFrame {
            tag: BatchTag::Batch,
            sender_id: sender_id.to_hex(),
            receiver_id: receiver_id.to_hex(),
            status: MessageStatus::Read,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingFrame {
    #[serde(rename = "type")]
    pub tag: TypingTag,
    pub sender_id: String,
    pub receiver_id: String,
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
}

/// Presence change for a user, published by gateways on connect/disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceFrame {
    #[serde(rename = "UserID")]
    pub user_id: String,
    pub status: UserStatus,
}

// ============================================================================
// Broker envelope
// ============================================================================

/// Every payload on the `messages` exchange is one of these, discriminated
/// by the `kind` field. Gateways match on the tag instead of sniffing the
/// payload shape, and forward the inner frame (without the tag) to sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEvent {
    Message(MessageFrame),
    MessageStatus(StatusFrame),
    BatchStatus(BatchStatusFrame),
    Typing(TypingFrame),
    Presence(PresenceFrame),
}

/// Where a gateway should deliver a consumed event.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryTarget<'a> {
    /// Deliver to the single locally-connected user with this id, if any.
    User(&'a str),
    /// Deliver to every locally-connected user except the subject.
    BroadcastExcept(&'a str),
    /// Nothing to deliver (e.g. a status event without a sender id).
    Drop,
}

impl BrokerEvent {
    /// Select the local delivery target per the gateway dispatch table:
    /// messages and typing go to the receiver, status updates go back to the
    /// sender, presence fans out to everyone else.
    pub fn delivery_target(&self) -> DeliveryTarget<'_> {
        match self {
            BrokerEvent::Message(m) => match m.receiver_id.as_deref() {
                Some(receiver) => DeliveryTarget::User(receiver),
                None => DeliveryTarget::Drop,
            },
            BrokerEvent::Typing(t) => DeliveryTarget::User(&t.receiver_id),
            BrokerEvent::MessageStatus(s) => match s.sender_id.as_deref() {
                Some(sender) => DeliveryTarget::User(sender),
                None => DeliveryTarget::Drop,
            },
            BrokerEvent::BatchStatus(b) => DeliveryTarget::User(&b.sender_id),
            BrokerEvent::Presence(p) => DeliveryTarget::BroadcastExcept(&p.user_id),
        }
    }

    /// Serialize the inner frame the way clients expect it (§6.2 shapes,
    /// no envelope tag).
    pub fn client_frame(&self) -> serde_json::Result<String> {
        match self {
            BrokerEvent::Message(m) => serde_json::to_string(m),
            BrokerEvent::MessageStatus(s) => serde_json::to_string(s),
            BrokerEvent::BatchStatus(b) => serde_json::to_string(b),
            BrokerEvent::Typing(t) => serde_json::to_string(t),
            BrokerEvent::Presence(p) => serde_json::to_string(p),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
