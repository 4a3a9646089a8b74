//! Socket transport abstraction.
//!
//! The portal talks to the relay through [`SocketTransport`]; a
//! [`SocketConnector`] opens new transports with the configured url and token.
//! Transports are polled: events accumulate until [`SocketTransport::poll_events`].

mod memory;

#[cfg(not(target_arch = "wasm32"))]
mod native;

pub use memory::{MemoryHub, MemorySocket};

#[cfg(not(target_arch = "wasm32"))]
pub use native::{NativeConnector, NativeWebSocket};

use crate::protocol::{ClientFrame, ServerFrame};
use thiserror::Error;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from a socket transport
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Connected to server
    Connected,
    /// Disconnected from server
    Disconnected,
    /// Connection could not be established
    ConnectError { message: String },
    /// Frame received from the server
    Frame(ServerFrame),
}

/// Socket transport errors.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Not connected")]
    NotConnected,
}

/// A bidirectional, room-scoped messaging socket.
pub trait SocketTransport {
    /// Queue a frame for the server.
    fn emit(&mut self, frame: &ClientFrame) -> Result<(), SocketError>;

    /// Drain pending events (non-blocking).
    fn poll_events(&mut self) -> Vec<SocketEvent>;

    /// Close the connection. Further emits fail with [`SocketError::NotConnected`].
    fn close(&mut self);

    fn state(&self) -> ConnectionState;
}

/// Opens transports.
pub trait SocketConnector {
    type Socket: SocketTransport;

    /// Start connecting to `url`, authenticating with `token` when given.
    ///
    /// Returns as soon as the attempt is underway; the outcome arrives as a
    /// [`SocketEvent`].
    fn connect(&mut self, url: &str, token: Option<&str>) -> Result<Self::Socket, SocketError>;
}
