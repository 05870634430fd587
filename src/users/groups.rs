use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use bson::{doc, oid::ObjectId};
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use super::handlers::{parse_id, validation_error};
use super::UserState;
use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{Group, GroupDto},
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateGroupRequest {
    #[validate(length(min = 1, max = 100, message = "Group name must be 1–100 characters"))]
    pub name: String,
    #[validate(length(max = 500))]
    pub description: Option<String>,
    pub member_ids: Vec<String>,
    #[validate(url(message = "avatar_url must be a valid URL"))]
    pub avatar_url: Option<String>,
}

/// Deduplicate the requested members and make sure the owner is among them.
fn assemble_members(owner: ObjectId, requested: Vec<ObjectId>) -> Vec<ObjectId> {
    let mut members = vec![owner];
    for id in requested {
        if !members.contains(&id) {
            members.push(id);
        }
    }
    members
}

/// POST /groups — create a group. The caller becomes the owner and is added
/// to the member set automatically; a group needs at least two members.
pub async fn create_group(
    State(state): State<UserState>,
    auth: AuthUser,
    Json(req): Json<CreateGroupRequest>,
) -> AppResult<(StatusCode, Json<GroupDto>)> {
    req.validate().map_err(validation_error)?;

    let owner = auth.user_id();
    let requested = req
        .member_ids
        .iter()
        .map(|id| parse_id(id, "member"))
        .collect::<AppResult<Vec<_>>>()?;

    let member_ids = assemble_members(owner, requested);
    if member_ids.len() < 2 {
        return Err(AppError::Validation(
            "A group needs at least 2 members".into(),
        ));
    }

    let found = state
        .store
        .users()
        .count_documents(doc! { "_id": { "$in": member_ids.clone() } })
        .await?;
    if found as usize != member_ids.len() {
        return Err(AppError::NotFound("One or more members not found".into()));
    }

    let mut group = Group {
        id: None,
        name: req.name,
        description: req.description,
        owner_id: owner,
        member_ids,
        avatar_url: req.avatar_url,
        created_at: Utc::now(),
    };

    let inserted = state.store.groups().insert_one(&group).await?;
    group.id = inserted.inserted_id.as_object_id();

    info!(
        group = %group.name,
        owner_id = %owner,
        members = group.member_ids.len(),
        "Created group"
    );
    Ok((StatusCode::CREATED, Json(group.into())))
}

/// GET /groups — every group the caller belongs to.
pub async fn list_groups(
    State(state): State<UserState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<GroupDto>>> {
    let groups: Vec<Group> = state
        .store
        .groups()
        .find(doc! { "member_ids": auth.user_id() })
        .sort(doc! { "created_at": 1 })
        .await?
        .try_collect()
        .await?;

    Ok(Json(groups.into_iter().map(GroupDto::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_is_always_a_member() {
        let owner = ObjectId::new();
        let other = ObjectId::new();

        let members = assemble_members(owner, vec![other]);
        assert_eq!(members, vec![owner, other]);
    }

    #[test]
    fn duplicate_members_collapse() {
        let owner = ObjectId::new();
        let other = ObjectId::new();

        // Owner listed again and a member repeated — both collapse.
        let members = assemble_members(owner, vec![owner, other, other]);
        assert_eq!(members, vec![owner, other]);
    }

    #[test]
    fn owner_alone_is_too_small() {
        let owner = ObjectId::new();
        let members = assemble_members(owner, vec![owner]);
        assert!(members.len() < 2);
    }
}
