//! Collaboration timing and limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-file upload ceiling (3 MiB).
pub const DEFAULT_FILE_UPLOAD_MAX_BYTES: usize = 3 * 1024 * 1024;

/// Tunables for a collaboration session.
///
/// Every field has a default, so a partial JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// WebSocket relay URL.
    pub ws_server_url: Option<String>,
    /// HTTP blob store base URL.
    pub storage_backend_url: Option<String>,
    /// Bearer token for both the relay and the blob store.
    pub auth_token: Option<String>,
    /// Name shown to other collaborators.
    pub username: Option<String>,
    /// How long to wait for a peer's snapshot before loading from storage.
    pub initial_scene_update_timeout_ms: u64,
    /// Interval of throttled full-scene broadcasts and saves.
    pub sync_full_scene_interval_ms: u64,
    pub file_upload_timeout_ms: u64,
    pub load_images_timeout_ms: u64,
    pub cursor_sync_timeout_ms: u64,
    /// Pointer inactivity before reporting idle.
    pub idle_threshold_ms: u64,
    /// Heartbeat interval for re-reporting active.
    pub active_threshold_ms: u64,
    pub file_upload_max_bytes: usize,
    /// Age after which a pending/errored attachment is force-refetched.
    pub stale_file_grace_ms: u64,
    /// Age after which tombstones stop being synced.
    pub deleted_element_timeout_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            ws_server_url: None,
            storage_backend_url: None,
            auth_token: None,
            username: None,
            initial_scene_update_timeout_ms: 5_000,
            sync_full_scene_interval_ms: 20_000,
            file_upload_timeout_ms: 300,
            load_images_timeout_ms: 500,
            cursor_sync_timeout_ms: 33,
            idle_threshold_ms: 60_000,
            active_threshold_ms: 3_000,
            file_upload_max_bytes: DEFAULT_FILE_UPLOAD_MAX_BYTES,
            stale_file_grace_ms: 10_000,
            deleted_element_timeout_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl CollabConfig {
    /// Parse a config from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn initial_scene_update_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_scene_update_timeout_ms)
    }

    pub fn sync_full_scene_interval(&self) -> Duration {
        Duration::from_millis(self.sync_full_scene_interval_ms)
    }

    pub fn file_upload_timeout(&self) -> Duration {
        Duration::from_millis(self.file_upload_timeout_ms)
    }

    pub fn load_images_timeout(&self) -> Duration {
        Duration::from_millis(self.load_images_timeout_ms)
    }

    pub fn cursor_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.cursor_sync_timeout_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn active_threshold(&self) -> Duration {
        Duration::from_millis(self.active_threshold_ms)
    }

    pub fn deleted_element_timeout_ms(&self) -> i64 {
        i64::try_from(self.deleted_element_timeout_ms).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CollabConfig::from_json(r#"{"ws_server_url":"ws://localhost:3030/ws","idle_threshold_ms":1000}"#).unwrap();
        assert_eq!(config.ws_server_url.as_deref(), Some("ws://localhost:3030/ws"));
        assert_eq!(config.idle_threshold(), Duration::from_secs(1));
        assert_eq!(config.sync_full_scene_interval_ms, 20_000);
        assert_eq!(config.file_upload_max_bytes, DEFAULT_FILE_UPLOAD_MAX_BYTES);
    }
}
