//! End-to-end message flows driven through the message service router
//! against a live document store and broker: persistence, the recipient
//! discriminator rules, status monotonicity, read-on-fetch, group
//! membership, and search scoping.
#![cfg(feature = "live_tests")]

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use bson::oid::ObjectId;
use serde_json::json;

// ============================================================================
// Test fixture helpers
// ============================================================================

/// Register two fresh users; returns (token_a, id_a, token_b, id_b).
async fn setup_two_users(user_app: axum::Router) -> (String, String, String, String) {
    let (token_a, id_a) =
        common::register_and_login(user_app.clone(), &common::unique_username(), "pass12345")
            .await;
    let (token_b, id_b) =
        common::register_and_login(user_app, &common::unique_username(), "pass12345").await;
    (token_a, id_a, token_b, id_b)
}

/// One store + broker pair shared by both routers, as in a deployment.
async fn setup_apps() -> (axum::Router, axum::Router) {
    let store = common::test_store().await;
    let broker = common::test_broker().await;
    (
        common::user_app(store.clone()),
        common::message_app(store, broker),
    )
}

// ============================================================================
// POST /messages — direct messages
// ============================================================================

#[tokio::test]
async fn send_direct_message_persists_with_sent_status() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, id_a, _token_b, id_b) = setup_two_users(user_app).await;

    let (status, body) = common::post_json_authed(
        message_app,
        "/messages",
        &token_a,
        json!({ "receiver_id": id_b, "content": "hi" }),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(body["id"].as_str().is_some());
    assert_eq!(body["sender_id"], id_a);
    assert_eq!(body["receiver_id"], id_b);
    assert_eq!(body["status"], "sent");
    assert!(body["sender_username"].as_str().is_some());
    assert!(body.get("group_id").is_none());
}

#[tokio::test]
async fn send_requires_exactly_one_recipient_discriminator() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(user_app).await;

    let (both, _) = common::post_json_authed(
        message_app.clone(),
        "/messages",
        &token_a,
        json!({
            "receiver_id": id_b,
            "group_id": ObjectId::new().to_hex(),
            "content": "hi",
        }),
    )
    .await;
    assert_eq!(both, StatusCode::BAD_REQUEST);

    let (neither, body) = common::post_json_authed(
        message_app,
        "/messages",
        &token_a,
        json!({ "content": "hi" }),
    )
    .await;
    assert_eq!(neither, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn send_to_self_is_rejected() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, id_a, _token_b, _id_b) = setup_two_users(user_app).await;

    let (status, _) = common::post_json_authed(
        message_app,
        "/messages",
        &token_a,
        json!({ "receiver_id": id_a, "content": "note to self" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn send_to_unknown_recipient_returns_404() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, _id_a, _token_b, _id_b) = setup_two_users(user_app).await;

    let (status, _) = common::post_json_authed(
        message_app,
        "/messages",
        &token_a,
        json!({ "receiver_id": ObjectId::new().to_hex(), "content": "hello?" }),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// PATCH /messages/:id/status
// ============================================================================

#[tokio::test]
async fn update_status_is_receiver_only() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(user_app).await;

    let (_, message) = common::post_json_authed(
        message_app.clone(),
        "/messages",
        &token_a,
        json!({ "receiver_id": id_b, "content": "hi" }),
    )
    .await;
    let message_id = message["id"].as_str().unwrap();

    // The sender cannot advance their own message's status.
    let (status, _) = common::patch_json_authed(
        message_app,
        &format!("/messages/{message_id}/status"),
        &token_a,
        json!({ "status": "read" }),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn update_status_advances_and_ignores_downgrades() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, id_a, token_b, id_b) = setup_two_users(user_app).await;

    let (_, message) = common::post_json_authed(
        message_app.clone(),
        "/messages",
        &token_a,
        json!({ "receiver_id": id_b, "content": "hi" }),
    )
    .await;
    let message_id = message["id"].as_str().unwrap().to_owned();

    let (status, body) = common::patch_json_authed(
        message_app.clone(),
        &format!("/messages/{message_id}/status"),
        &token_b,
        json!({ "status": "delivered" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "delivered");
    assert_eq!(body["message_id"], message_id);
    assert_eq!(body["sender_id"], id_a);
    assert_eq!(body["receiver_id"], id_b);

    let (status, body) = common::patch_json_authed(
        message_app.clone(),
        &format!("/messages/{message_id}/status"),
        &token_b,
        json!({ "status": "read" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "read");

    // A downgrade is acknowledged but the persisted status stays `read`.
    let (status, body) = common::patch_json_authed(
        message_app,
        &format!("/messages/{message_id}/status"),
        &token_b,
        json!({ "status": "delivered" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "read");
}

// ============================================================================
// GET /messages/:target — pagination and read-on-fetch
// ============================================================================

#[tokio::test]
async fn conversation_page_is_newest_first_and_limited() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, id_a, token_b, id_b) = setup_two_users(user_app).await;

    for n in 1..=3 {
        let (status, _) = common::post_json_authed(
            message_app.clone(),
            "/messages",
            &token_a,
            json!({ "receiver_id": id_b, "content": format!("message {n}") }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, page) = common::get_authed(
        message_app.clone(),
        &format!("/messages/{id_a}?limit=2"),
        &token_b,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page.as_array().unwrap().len(), 2);

    let (_, full) =
        common::get_authed(message_app, &format!("/messages/{id_a}"), &token_b).await;
    let items = full.as_array().unwrap();
    assert!(items.len() >= 3);

    let timestamps: Vec<chrono::DateTime<chrono::Utc>> = items
        .iter()
        .map(|m| m["created_at"].as_str().unwrap().parse().unwrap())
        .collect();
    assert!(
        timestamps.windows(2).all(|w| w[0] >= w[1]),
        "page must be newest-first: {timestamps:?}"
    );
}

#[tokio::test]
async fn read_on_fetch_marks_inbound_messages_read() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, id_a, token_b, id_b) = setup_two_users(user_app).await;

    for n in 1..=2 {
        common::post_json_authed(
            message_app.clone(),
            "/messages",
            &token_a,
            json!({ "receiver_id": id_b, "content": format!("unread {n}") }),
        )
        .await;
    }

    // Opening the thread triggers the bulk read transition off the request
    // path; give the spawned task a moment before observing.
    let (status, _) =
        common::get_authed(message_app.clone(), &format!("/messages/{id_a}"), &token_b).await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (_, page) =
        common::get_authed(message_app, &format!("/messages/{id_a}"), &token_b).await;
    let inbound: Vec<_> = page
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["sender_id"] == id_a.as_str())
        .collect();

    assert!(!inbound.is_empty());
    assert!(
        inbound.iter().all(|m| m["status"] == "read"),
        "every inbound message must be read after the fetch: {page}"
    );
}

// ============================================================================
// Group messages
// ============================================================================

#[tokio::test]
async fn group_send_persists_and_respects_membership() {
    let (user_app, message_app) = setup_apps().await;
    let (token_o, _id_o, _token_x, id_x) = setup_two_users(user_app.clone()).await;
    let (token_z, _id_z) =
        common::register_and_login(user_app.clone(), &common::unique_username(), "pass12345")
            .await;

    let (status, group) = common::post_json_authed(
        user_app,
        "/groups",
        &token_o,
        json!({ "name": "trio", "member_ids": [id_x] }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let group_id = group["id"].as_str().unwrap().to_owned();
    assert_eq!(group["member_ids"].as_array().unwrap().len(), 2);

    let (status, message) = common::post_json_authed(
        message_app.clone(),
        "/messages",
        &token_o,
        json!({ "group_id": group_id, "content": "hello group" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["group_id"], group_id);
    assert!(message.get("receiver_id").is_none());

    // A non-member can neither post to nor read the thread.
    let (status, _) = common::post_json_authed(
        message_app.clone(),
        "/messages",
        &token_z,
        json!({ "group_id": group_id, "content": "let me in" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) =
        common::get_authed(message_app.clone(), &format!("/messages/{group_id}"), &token_z).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Members see exactly the persisted message.
    let (status, page) =
        common::get_authed(message_app, &format!("/messages/{group_id}"), &token_o).await;
    assert_eq!(status, StatusCode::OK);
    let items = page.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], message["id"]);
}

// ============================================================================
// GET /messages/search
// ============================================================================

#[tokio::test]
async fn search_is_case_insensitive_and_scoped_to_the_caller() {
    let (user_app, message_app) = setup_apps().await;
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(user_app.clone()).await;
    let (token_c, _id_c) =
        common::register_and_login(user_app, &common::unique_username(), "pass12345").await;

    let marker = ObjectId::new().to_hex();
    let (_, message) = common::post_json_authed(
        message_app.clone(),
        "/messages",
        &token_a,
        json!({ "receiver_id": id_b, "content": format!("Needle {marker}") }),
    )
    .await;
    let message_id = message["id"].as_str().unwrap();

    // Different case, same substring.
    let (status, hits) = common::get_authed(
        message_app.clone(),
        &format!("/messages/search?q=NEEDLE%20{marker}"),
        &token_a,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<_> = hits
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&message_id));

    // A stranger's search never surfaces someone else's conversation.
    let (status, hits) = common::get_authed(
        message_app,
        &format!("/messages/search?q={marker}"),
        &token_c,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(hits.as_array().unwrap().is_empty());
}
