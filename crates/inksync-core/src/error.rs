//! Session-level errors.

use crate::crypto::CryptoError;
use crate::socket::SocketError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the collaboration session and transport channel.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("No server url provided")]
    NoServerUrl,
    #[error("Could not open collaboration channel: {0}")]
    Connect(#[from] SocketError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The room closed while an operation was in flight.
    #[error("Operation aborted: no active room")]
    Aborted,
}

pub type CollabResult<T> = Result<T, CollabError>;
