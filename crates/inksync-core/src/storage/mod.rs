//! Remote blob storage for room scenes and attachments.

mod memory;
mod scene;

#[cfg(not(target_arch = "wasm32"))]
mod directory;

#[cfg(not(target_arch = "wasm32"))]
mod http;

pub use memory::MemoryStore;
pub use scene::{RECORD_HEADER_BYTES, SaveOutcome, SceneStore, decode_record, encode_record};

#[cfg(not(target_arch = "wasm32"))]
pub use directory::DirectoryStore;

#[cfg(not(target_arch = "wasm32"))]
pub use http::HttpStore;

use crate::crypto::CryptoError;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    /// The store refused a payload over its size limit.
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Stored bytes could not be decoded or decrypted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether the failure means the payload is too big for the store.
    pub fn is_size_exceeded(&self) -> bool {
        if matches!(self, StorageError::PayloadTooLarge(_)) {
            return true;
        }
        let message = self.to_string();
        message
            .find("is longer than")
            .is_some_and(|at| message[at..].contains("bytes"))
    }
}

impl From<CryptoError> for StorageError {
    fn from(e: CryptoError) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future for async operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key/value blob store.
///
/// Keys are slash-separated paths such as `rooms/{room_id}` or
/// `files/rooms/{room_id}/{file_id}`.
pub trait RemoteStore: Send + Sync {
    /// Fetch a blob. Absent keys yield [`StorageError::NotFound`].
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>>;

    /// Store a blob, replacing any previous value.
    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>>;
}

impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        (**self).put(key, data)
    }
}

/// Message used by stores when a payload exceeds `limit`.
pub fn payload_too_large_message(size: usize, limit: usize) -> String {
    format!("Payload of {} bytes is longer than {} bytes", size, limit)
}
