//! HTTP blob store over the core storage backends.
//!
//! `GET/PUT /rooms/{room_id}` holds encrypted scene records and
//! `GET/PUT /files/{*key}` holds encrypted attachments. The server never sees
//! plaintext.

use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use inksync_core::storage::{StorageError, payload_too_large_message};
use std::sync::Arc;
use tracing::{debug, error};

/// Whether the request carries the configured bearer token.
pub fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(token) = state.config.auth_token.as_deref() else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|provided| provided == token)
}

fn error_response(key: &str, e: StorageError) -> Response {
    match e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND.into_response(),
        StorageError::PayloadTooLarge(message) => (StatusCode::PAYLOAD_TOO_LARGE, message).into_response(),
        e => {
            error!("Storage error for {}: {}", key, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn get_blob(state: &AppState, headers: &HeaderMap, key: String) -> Response {
    if !authorized(state, headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.store.get(&key).await {
        Ok(data) => ([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response(),
        Err(e) => error_response(&key, e),
    }
}

async fn put_blob(state: &AppState, headers: &HeaderMap, key: String, body: Bytes, limit: usize) -> Response {
    if !authorized(state, headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body.len() > limit {
        debug!("Rejecting {} bytes for {}", body.len(), key);
        return (StatusCode::PAYLOAD_TOO_LARGE, payload_too_large_message(body.len(), limit)).into_response();
    }
    match state.store.put(&key, body.to_vec()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&key, e),
    }
}

pub async fn get_room(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(room_id): Path<String>) -> Response {
    get_blob(&state, &headers, format!("rooms/{}", room_id)).await
}

pub async fn put_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    body: Bytes,
) -> Response {
    let limit = state.config.max_room_bytes;
    put_blob(&state, &headers, format!("rooms/{}", room_id), body, limit).await
}

pub async fn get_file(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    get_blob(&state, &headers, format!("files/{}", key)).await
}

pub async fn put_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let limit = state.config.max_file_bytes;
    put_blob(&state, &headers, format!("files/{}", key), body, limit).await
}
