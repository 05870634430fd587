use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use super::GatewayState;
use crate::error::AppError;

/// Upstream calls are cut off after this long; a slow service turns into a
/// 502 rather than a hung client connection.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest request body the proxy will buffer for forwarding.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub async fn proxy_messages(State(state): State<GatewayState>, req: Request) -> Response {
    let base = state.message_service_url.clone();
    forward(&state, &base, "message", req).await
}

pub async fn proxy_users(State(state): State<GatewayState>, req: Request) -> Response {
    let base = state.user_service_url.clone();
    forward(&state, &base, "user", req).await
}

/// Forward a request to an upstream service verbatim: same method, same path
/// and query, same body, Authorization and Content-Type passed through. The
/// upstream's status code and body are returned unchanged; only transport
/// failures produce a gateway-originated error.
async fn forward(state: &GatewayState, base: &str, upstream: &str, req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let url = format!("{base}{path_and_query}");

    // axum and the HTTP client disagree on `http` major versions, so the
    // method and headers cross the boundary as bytes.
    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            return AppError::Validation("Unsupported HTTP method".into()).into_response();
        }
    };
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return AppError::Validation("Request body too large".into()).into_response();
        }
    };

    let mut builder = state
        .http
        .request(method, &url)
        .timeout(UPSTREAM_TIMEOUT)
        .body(body.to_vec());
    if let Some(auth) = authorization {
        builder = builder.header(reqwest::header::AUTHORIZATION, auth);
    }
    if let Some(ct) = content_type {
        builder = builder.header(reqwest::header::CONTENT_TYPE, ct);
    }

    let upstream_response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(upstream = %upstream, url = %url, error = ?e, "Upstream request failed");
            return AppError::Upstream(format!("{upstream} service unavailable")).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let response_content_type = upstream_response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_owned();
    let bytes = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(upstream = %upstream, error = ?e, "Failed to read upstream response body");
            return AppError::Upstream(format!("{upstream} service unavailable")).into_response();
        }
    };

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, response_content_type)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
