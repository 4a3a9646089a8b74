//! HTTP blob store client.
//!
//! `GET {base_url}/{key}` reads a blob and `PUT {base_url}/{key}` replaces it.
//! Requests carry `Authorization: Bearer {token}` when a token is configured.

use super::{BoxFuture, RemoteStore, StorageError, StorageResult};
use reqwest::{Client, RequestBuilder, StatusCode};

/// [`RemoteStore`] over HTTP.
///
/// Built on async reqwest: its futures must be driven from inside a tokio
/// runtime, unlike [`MemoryStore`](super::MemoryStore) and
/// [`DirectoryStore`](super::DirectoryStore) which any executor can poll.
pub struct HttpStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            token,
        }
    }

    /// Full URL of a key.
    pub fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }
}

async fn error_for_status(key: &str, response: reqwest::Response) -> StorageResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(key.to_string()),
        StatusCode::PAYLOAD_TOO_LARGE => StorageError::PayloadTooLarge(body),
        _ => StorageError::Http(format!("{} {}", status, body)),
    })
}

impl RemoteStore for HttpStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        let key = key.to_string();
        let request = self.authorize(self.client.get(self.url(&key)));

        Box::pin(async move {
            let response = request.send().await.map_err(|e| StorageError::Http(e.to_string()))?;
            let response = error_for_status(&key, response).await?;
            let bytes = response.bytes().await.map_err(|e| StorageError::Http(e.to_string()))?;
            Ok(bytes.to_vec())
        })
    }

    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        let request = self
            .authorize(self.client.put(self.url(&key)))
            .header("Content-Type", "application/octet-stream")
            .body(data);

        Box::pin(async move {
            let response = request.send().await.map_err(|e| StorageError::Http(e.to_string()))?;
            error_for_status(&key, response).await?;
            Ok(())
        })
    }
}
