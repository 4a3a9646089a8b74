use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default ceiling for a stored scene record (50 MiB).
pub const DEFAULT_MAX_ROOM_BYTES: usize = 50 * 1024 * 1024;
/// Default ceiling for one stored attachment (4 MiB).
pub const DEFAULT_MAX_FILE_BYTES: usize = 4 * 1024 * 1024;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:3030)
    pub bind: SocketAddr,
    /// Blob directory; blobs are kept in memory when unset
    pub storage_dir: Option<PathBuf>,
    /// Bearer token required on every request when set
    pub auth_token: Option<String>,
    pub max_room_bytes: usize,
    pub max_file_bytes: usize,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid INKSYNC_BIND address: {0}")]
    InvalidBind(String),
    #[error("Invalid byte limit in {0}")]
    InvalidLimit(&'static str),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3030)),
            storage_dir: None,
            auth_token: None,
            max_room_bytes: DEFAULT_MAX_ROOM_BYTES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind = match lookup("INKSYNC_BIND") {
            Some(addr) => addr.parse().map_err(|_| ConfigError::InvalidBind(addr))?,
            None => defaults.bind,
        };

        let limit = |name: &'static str, default: usize| match lookup(name) {
            Some(value) => value.parse::<usize>().map_err(|_| ConfigError::InvalidLimit(name)),
            None => Ok(default),
        };

        Ok(Self {
            bind,
            storage_dir: lookup("INKSYNC_STORAGE_DIR").map(PathBuf::from),
            auth_token: lookup("INKSYNC_AUTH_TOKEN").filter(|token| !token.is_empty()),
            max_room_bytes: limit("INKSYNC_MAX_ROOM_BYTES", defaults.max_room_bytes)?,
            max_file_bytes: limit("INKSYNC_MAX_FILE_BYTES", defaults.max_file_bytes)?,
        })
    }
}
