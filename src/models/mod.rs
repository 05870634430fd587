use bson::oid::ObjectId;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ============================================================================
// Status enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
}

/// Delivery status of a message. Transitions are monotone along
/// sent → delivered → read; downgrades are ignored everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub const fn rank(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }

    /// True when moving from `self` to `next` advances the status.
    pub fn advances_to(self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

// ============================================================================
// User documents
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub status: UserStatus,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub last_login: DateTime<Utc>,
}

/// Wire representation of a user. The password hash never leaves the
/// document layer; this type simply has no field for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDto {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserDto {
    fn from(user: User) -> Self {
        UserDto {
            id: user.id.map(|id| id.to_hex()).unwrap_or_default(),
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            avatar_url: user.avatar_url,
            status: user.status,
            created_at: user.created_at,
        }
    }
}

// ============================================================================
// Message documents
// ============================================================================

/// A persisted message. Exactly one of `receiver_id` / `group_id` is set:
/// `receiver_id` for a 1:1 message, `group_id` for a group message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub sender_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<ObjectId>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub status: MessageStatus,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}

// ============================================================================
// Group documents
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner_id: ObjectId,
    pub member_ids: Vec<ObjectId>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn is_member(&self, user_id: &ObjectId) -> bool {
        self.member_ids.contains(user_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupDto {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner_id: String,
    pub member_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Group> for GroupDto {
    fn from(group: Group) -> Self {
        GroupDto {
            id: group.id.map(|id| id.to_hex()).unwrap_or_default(),
            name: group.name,
            description: group.description,
            owner_id: group.owner_id.to_hex(),
            member_ids: group.member_ids.iter().map(|id| id.to_hex()).collect(),
            avatar_url: group.avatar_url,
            created_at: group.created_at,
        }
    }
}

// ============================================================================
// Contact documents
// ============================================================================

/// Directed contact relation; `{user_id, contact_id}` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: ObjectId,
    pub contact_id: ObjectId,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_rank_is_monotone() {
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
    }

    #[test]
    fn advances_to_rejects_downgrades_and_noops() {
        assert!(MessageStatus::Sent.advances_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.advances_to(MessageStatus::Read));
        assert!(MessageStatus::Delivered.advances_to(MessageStatus::Read));

        assert!(!MessageStatus::Read.advances_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Read.advances_to(MessageStatus::Sent));
        assert!(!MessageStatus::Delivered.advances_to(MessageStatus::Delivered));
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageStatus::Delivered).unwrap(),
            "\"delivered\""
        );
        assert_eq!(
            serde_json::to_string(&UserStatus::Online).unwrap(),
            "\"online\""
        );
    }

    #[test]
    fn status_parses_from_wire_strings() {
        let parsed: MessageStatus = serde_json::from_str("\"read\"").unwrap();
        assert_eq!(parsed, MessageStatus::Read);

        assert!(serde_json::from_str::<MessageStatus>("\"seen\"").is_err());
    }

    #[test]
    fn user_dto_never_carries_password_hash() {
        let user = User {
            id: Some(ObjectId::new()),
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: "$2b$12$secret".into(),
            full_name: None,
            avatar_url: None,
            status: UserStatus::Offline,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_login: Utc::now(),
        };

        let json = serde_json::to_value(UserDto::from(user)).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["username"], "alice");
    }

    #[test]
    fn group_membership_check() {
        let owner = ObjectId::new();
        let member = ObjectId::new();
        let outsider = ObjectId::new();

        let group = Group {
            id: Some(ObjectId::new()),
            name: "team".into(),
            description: None,
            owner_id: owner,
            member_ids: vec![owner, member],
            avatar_url: None,
            created_at: Utc::now(),
        };

        assert!(group.is_member(&owner));
        assert!(group.is_member(&member));
        assert!(!group.is_member(&outsider));
    }

    #[test]
    fn message_discriminator_helpers() {
        let base = Message {
            id: Some(ObjectId::new()),
            sender_id: ObjectId::new(),
            receiver_id: Some(ObjectId::new()),
            group_id: None,
            content: "hi".into(),
            media_url: None,
            status: MessageStatus::Sent,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!base.is_group());

        let group_message = Message {
            receiver_id: None,
            group_id: Some(ObjectId::new()),
            ..base
        };
        assert!(group_message.is_group());
    }
}
