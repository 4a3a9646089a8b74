//! InkSync Relay Server
//!
//! Relays end-to-end encrypted whiteboard traffic between clients in the same
//! room and stores encrypted scenes and attachments. Payloads are opaque to the
//! server.
//!
//! ## Protocol
//!
//! WebSocket at `/ws`, JSON text frames:
//! ```json
//! { "type": "join-room", "room": "room-id" }
//! { "type": "server-broadcast", "room": "room-id", "data": "<base64>", "iv": "<base64>" }
//! { "type": "server-volatile-broadcast", "room": "room-id", "data": "<base64>", "iv": "<base64>" }
//! { "type": "user-follow", "user_to_follow": "socket-id", "action": "follow" }
//! ```
//!
//! Blob store over HTTP: `GET/PUT /rooms/{room_id}` and `GET/PUT /files/{*key}`.

mod blobs;
mod config;
mod relay;

use axum::{
    Router,
    extract::{
        DefaultBodyLimit, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use config::ServerConfig;
use futures_util::{SinkExt, StreamExt};
use inksync_core::protocol::{ClientFrame, ServerFrame};
use inksync_core::storage::{DirectoryStore, MemoryStore, RemoteStore};
use relay::{OUTBOX_CAPACITY, Relay};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared application state
pub struct AppState {
    pub config: ServerConfig,
    pub relay: Relay,
    pub store: Arc<dyn RemoteStore>,
}

impl AppState {
    fn new(config: ServerConfig, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            config,
            relay: Relay::new(),
            store,
        }
    }
}

fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_room_bytes.max(state.config.max_file_bytes) * 2;
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/rooms/{room_id}", get(blobs::get_room).put(blobs::put_room))
        .route("/files/{*key}", get(blobs::get_file).put(blobs::put_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inksync_server=info,tower_http=info".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let store: Arc<dyn RemoteStore> = match &config.storage_dir {
        Some(dir) => match DirectoryStore::new(dir.clone()) {
            Ok(store) => {
                info!("Storing blobs in {}", dir.display());
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to open storage directory: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            warn!("INKSYNC_STORAGE_DIR not set, blobs are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let addr = config.bind;
    let state = Arc::new(AppState::new(config, store));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("InkSync relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    if let Err(e) = axum::serve(listener, app(state)).await {
        error!("Server error: {}", e);
    }
}

/// Index page
async fn index() -> &'static str {
    "InkSync Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    if !blobs::authorized(&state, &headers) {
        warn!("WebSocket connection rejected: invalid or missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode_frame(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!("Failed to encode frame: {}", e);
            None
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let socket_id = Uuid::new_v4().to_string();
    info!("New connection: {}", socket_id);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOX_CAPACITY);

    // Writer: drain the outbox into the socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Some(message) = encode_frame(&frame) else {
                continue;
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    state.relay.connect(&socket_id, tx.clone()).await;
    info!("{} connections open", state.relay.client_count());

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => state.relay.handle(&socket_id, frame).await,
                Err(e) => {
                    warn!("Invalid message from {}: {}", socket_id, e);
                    let _ = tx
                        .send(ServerFrame::Error {
                            message: format!("Invalid message: {}", e),
                        })
                        .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Ignore binary and ping/pong
            Err(e) => {
                warn!("WebSocket error for {}: {}", socket_id, e);
                break;
            }
        }
    }

    // Cleanup on disconnect
    state.relay.disconnect(&socket_id).await;
    drop(tx);
    writer.abort();
    info!("Connection closed: {}", socket_id);
}
