//! In-memory blob store.

use super::{BoxFuture, RemoteStore, StorageError, StorageResult, payload_too_large_message};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory store for testing and ephemeral servers.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    max_bytes: Option<usize>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject payloads larger than `max_bytes`.
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..Self::default()
        }
    }

    /// Simulate an unreachable backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs
            .read()
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Http("Backend unavailable".to_string()));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_available()?;
            let blobs = self
                .blobs
                .read()
                .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))?;
            blobs.get(&key).cloned().ok_or(StorageError::NotFound(key))
        })
    }

    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_available()?;
            if let Some(limit) = self.max_bytes {
                if data.len() > limit {
                    return Err(StorageError::PayloadTooLarge(payload_too_large_message(data.len(), limit)));
                }
            }
            let mut blobs = self
                .blobs
                .write()
                .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))?;
            blobs.insert(key, data);
            Ok(())
        })
    }
}
