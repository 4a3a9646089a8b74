//! Directory-backed blob store for native platforms.

use super::{BoxFuture, RemoteStore, StorageError, StorageResult, payload_too_large_message};
use std::fs;
use std::path::{Path, PathBuf};

/// Stores each blob as a `.bin` file, nesting directories by key segment.
pub struct DirectoryStore {
    /// Base directory for blob storage.
    base_path: PathBuf,
    max_bytes: Option<usize>,
}

impl DirectoryStore {
    /// Create a new store rooted at `base_path`.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path)
                .map_err(|e| StorageError::Io(format!("Failed to create storage directory: {}", e)))?;
        }
        Ok(Self {
            base_path,
            max_bytes: None,
        })
    }

    /// Create a store in the default location.
    ///
    /// On Unix: `~/.local/share/inksync/blobs/`
    /// On Windows: `%LOCALAPPDATA%\inksync\blobs\`
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;

        Self::new(base.join("inksync").join("blobs"))
    }

    /// Reject payloads larger than `max_bytes`.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Get the file path for a key.
    fn blob_path(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        let segments: Vec<String> = key
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                segment
                    .chars()
                    .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '@' { c } else { '_' })
                    .collect()
            })
            .collect();
        if let Some((last, dirs)) = segments.split_last() {
            for dir in dirs {
                path.push(dir);
            }
            path.push(format!("{}.bin", last));
        } else {
            path.push("_.bin");
        }
        path
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl RemoteStore for DirectoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        let path = self.blob_path(key);
        let key = key.to_string();

        Box::pin(async move {
            if !path.exists() {
                return Err(StorageError::NotFound(key));
            }
            fs::read(&path).map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))
        })
    }

    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.blob_path(key);
        let max_bytes = self.max_bytes;

        Box::pin(async move {
            if let Some(limit) = max_bytes {
                if data.len() > limit {
                    return Err(StorageError::PayloadTooLarge(payload_too_large_message(data.len(), limit)));
                }
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Io(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
            fs::write(&path, data).map_err(|e| StorageError::Io(format!("Failed to write {}: {}", path.display(), e)))
        })
    }
}
