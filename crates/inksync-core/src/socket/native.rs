//! Native WebSocket client.
//!
//! Uses a background thread running a blocking tungstenite socket; commands
//! and events cross over std channels.

use super::{ConnectionState, SocketConnector, SocketError, SocketEvent, SocketTransport};
use crate::protocol::{ClientFrame, ServerFrame};
use std::net::TcpStream;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, connect};
use url::Url;

/// Commands sent to the WebSocket thread.
enum WsCommand {
    Send(String),
    Close,
}

/// Short read timeout so the socket loop can service outgoing commands.
fn set_timeouts(stream: &mut MaybeTlsStream<TcpStream>) {
    let tcp = match stream {
        MaybeTlsStream::Plain(tcp) => tcp,
        MaybeTlsStream::Rustls(tls) => &mut tls.sock,
        _ => return,
    };
    let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
    let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
}

/// WebSocket client for native platforms.
///
/// Uses a background thread for non-blocking operation.
pub struct NativeWebSocket {
    state: ConnectionState,
    events: Vec<SocketEvent>,
    /// Channel to send commands to the WebSocket thread.
    cmd_tx: Option<Sender<WsCommand>>,
    /// Channel to receive events from the WebSocket thread.
    event_rx: Option<Receiver<SocketEvent>>,
    /// Handle to the WebSocket thread.
    _thread: Option<JoinHandle<()>>,
}

impl NativeWebSocket {
    /// Create a new disconnected WebSocket client.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            events: Vec::new(),
            cmd_tx: None,
            event_rx: None,
            _thread: None,
        }
    }

    /// Connect to a WebSocket server, sending `token` as a bearer credential.
    pub fn connect(&mut self, url: &str, token: Option<&str>) -> Result<(), SocketError> {
        if self.cmd_tx.is_some() {
            return Err(SocketError::Connect("Already connected".to_string()));
        }

        let parsed_url = Url::parse(url).map_err(|e| SocketError::InvalidUrl(e.to_string()))?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(SocketError::InvalidUrl(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed_url.scheme()
            )));
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| SocketError::InvalidUrl(e.to_string()))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SocketError::Connect(format!("Invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        self.state = ConnectionState::Connecting;

        let (cmd_tx, cmd_rx) = channel::<WsCommand>();
        let (event_tx, event_rx) = channel::<SocketEvent>();
        let url = url.to_string();

        let handle = thread::spawn(move || {
            log::info!("WebSocket thread: connecting to {}", url);

            match connect(request) {
                Ok((mut socket, response)) => {
                    log::info!("WebSocket connected, status: {}", response.status());
                    let _ = event_tx.send(SocketEvent::Connected);

                    set_timeouts(socket.get_mut());

                    loop {
                        match cmd_rx.try_recv() {
                            Ok(WsCommand::Send(msg)) => {
                                if let Err(e) = socket.send(Message::Text(msg)) {
                                    log::error!("WebSocket send error: {}", e);
                                    break;
                                }
                            }
                            Ok(WsCommand::Close) => {
                                log::info!("WebSocket close requested");
                                let _ = socket.close(None);
                                break;
                            }
                            Err(TryRecvError::Disconnected) => {
                                log::info!("WebSocket command channel disconnected");
                                break;
                            }
                            Err(TryRecvError::Empty) => {}
                        }

                        match socket.read() {
                            Ok(Message::Text(txt)) => match serde_json::from_str::<ServerFrame>(&txt) {
                                Ok(frame) => {
                                    let _ = event_tx.send(SocketEvent::Frame(frame));
                                }
                                Err(e) => log::warn!("Failed to parse server frame: {}", e),
                            },
                            Ok(Message::Ping(data)) => {
                                let _ = socket.send(Message::Pong(data));
                            }
                            Ok(Message::Close(_)) => {
                                log::info!("WebSocket received close frame");
                                break;
                            }
                            Ok(_) => {}
                            Err(tungstenite::Error::Io(ref e))
                                if e.kind() == std::io::ErrorKind::WouldBlock
                                    || e.kind() == std::io::ErrorKind::TimedOut =>
                            {
                                continue;
                            }
                            Err(e) => {
                                log::error!("WebSocket read error: {}", e);
                                break;
                            }
                        }
                    }

                    log::info!("WebSocket thread exiting");
                    let _ = event_tx.send(SocketEvent::Disconnected);
                }
                Err(e) => {
                    log::error!("WebSocket connection failed: {}", e);
                    let _ = event_tx.send(SocketEvent::ConnectError {
                        message: format!("Connection failed: {}", e),
                    });
                }
            }
        });

        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self._thread = Some(handle);

        Ok(())
    }

    /// Disconnect from the server.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(WsCommand::Close);
        }
        self.event_rx = None;
        self._thread = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for NativeWebSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTransport for NativeWebSocket {
    fn emit(&mut self, frame: &ClientFrame) -> Result<(), SocketError> {
        let tx = self.cmd_tx.as_ref().ok_or(SocketError::NotConnected)?;
        let json = serde_json::to_string(frame).map_err(|e| SocketError::Send(e.to_string()))?;
        tx.send(WsCommand::Send(json))
            .map_err(|e| SocketError::Send(e.to_string()))
    }

    fn poll_events(&mut self) -> Vec<SocketEvent> {
        if let Some(ref rx) = self.event_rx {
            while let Ok(event) = rx.try_recv() {
                match &event {
                    SocketEvent::Connected => self.state = ConnectionState::Connected,
                    SocketEvent::Disconnected => self.state = ConnectionState::Disconnected,
                    SocketEvent::ConnectError { .. } => self.state = ConnectionState::Error,
                    SocketEvent::Frame(_) => {}
                }
                self.events.push(event);
            }
        }

        std::mem::take(&mut self.events)
    }

    fn close(&mut self) {
        self.disconnect();
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

impl Drop for NativeWebSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Opens [`NativeWebSocket`] connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

impl SocketConnector for NativeConnector {
    type Socket = NativeWebSocket;

    fn connect(&mut self, url: &str, token: Option<&str>) -> Result<NativeWebSocket, SocketError> {
        let mut socket = NativeWebSocket::new();
        socket.connect(url, token)?;
        Ok(socket)
    }
}
