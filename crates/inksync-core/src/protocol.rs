//! Wire protocol between clients and the relay server.
//!
//! Frames are JSON text messages. Scene and presence data never appear in the
//! clear: they are serialized to a [`SocketUpdate`], encrypted with the room
//! key, and carried as base64 `data` + `iv` inside a broadcast frame.

use crate::element::{Element, ElementId};
use crate::presence::{FollowAction, PointerButton, SocketId, UserIdleState};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Join a room
    JoinRoom { room: String },
    /// Durable broadcast to everyone else in `room`
    ServerBroadcast { room: String, data: String, iv: String },
    /// Best-effort broadcast, may be dropped under backpressure
    ServerVolatileBroadcast { room: String, data: String, iv: String },
    /// Start or stop following another user's viewport
    UserFollow {
        user_to_follow: SocketId,
        action: FollowAction,
    },
}

impl ClientFrame {
    /// Build an encrypted broadcast frame.
    pub fn broadcast(room: &str, iv: &[u8], ciphertext: &[u8], volatile: bool) -> Self {
        let room = room.to_string();
        let data = base64_encode(ciphertext);
        let iv = base64_encode(iv);
        if volatile {
            ClientFrame::ServerVolatileBroadcast { room, data, iv }
        } else {
            ClientFrame::ServerBroadcast { room, data, iv }
        }
    }

    pub fn is_volatile(&self) -> bool {
        matches!(self, ClientFrame::ServerVolatileBroadcast { .. })
    }
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Connection accepted; the client should now join its room
    InitRoom { socket_id: SocketId },
    /// We are the only member of the room
    FirstInRoom,
    /// Another peer joined and needs a full snapshot
    NewUser { socket_id: SocketId },
    /// Current room roster
    RoomUserChange { clients: Vec<SocketId> },
    /// Encrypted payload from another peer
    ClientBroadcast { data: String, iv: String },
    /// Users currently following us
    UserFollowRoomChange { followed_by: Vec<SocketId> },
    /// Error message
    Error { message: String },
}

/// Decrypted message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketUpdate {
    /// Full authoritative snapshot for a newly joined peer
    #[serde(rename = "SCENE_INIT")]
    Init { elements: Vec<Element> },
    /// Partial scene delta
    #[serde(rename = "SCENE_UPDATE")]
    Update { elements: Vec<Element> },
    MouseLocation {
        socket_id: SocketId,
        pointer: Point,
        button: PointerButton,
        selected_element_ids: Vec<ElementId>,
        #[serde(default)]
        username: Option<String>,
    },
    UserVisibleSceneBounds {
        socket_id: SocketId,
        #[serde(default)]
        username: Option<String>,
        scene_bounds: Rect,
    },
    IdleStatus {
        socket_id: SocketId,
        user_state: UserIdleState,
        #[serde(default)]
        username: Option<String>,
    },
    /// Sentinel for payloads that failed to decrypt or parse
    InvalidResponse,
}

/// Whether a scene broadcast is a full snapshot for new peers or a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneUpdateKind {
    Init,
    Update,
}

impl SceneUpdateKind {
    pub fn into_update(self, elements: Vec<Element>) -> SocketUpdate {
        match self {
            SceneUpdateKind::Init => SocketUpdate::Init { elements },
            SceneUpdateKind::Update => SocketUpdate::Update { elements },
        }
    }
}

pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn base64_decode(input: &str) -> Option<Vec<u8>> {
    STANDARD.decode(input).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_serialize() {
        let msg = ClientFrame::JoinRoom { room: "test-room".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"join-room","room":"test-room"}"#);
    }

    #[test]
    fn test_server_frame_deserialize() {
        let json = r#"{"type":"room-user-change","clients":["a","b"]}"#;
        let msg: ServerFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerFrame::RoomUserChange { clients: vec!["a".into(), "b".into()] }
        );

        let msg: ServerFrame = serde_json::from_str(r#"{"type":"first-in-room"}"#).unwrap();
        assert_eq!(msg, ServerFrame::FirstInRoom);
    }

    #[test]
    fn test_broadcast_frame_volatility() {
        let durable = ClientFrame::broadcast("r", b"iv", b"data", false);
        let volatile = ClientFrame::broadcast("r", b"iv", b"data", true);
        assert!(!durable.is_volatile());
        assert!(volatile.is_volatile());
        assert!(serde_json::to_string(&volatile).unwrap().contains("server-volatile-broadcast"));
    }

    #[test]
    fn test_socket_update_envelope() {
        let update = SocketUpdate::IdleStatus {
            socket_id: "s1".into(),
            user_state: UserIdleState::Idle,
            username: None,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "IDLE_STATUS");
        assert_eq!(json["payload"]["user_state"], "idle");

        let scene = SceneUpdateKind::Init.into_update(vec![]);
        let json = serde_json::to_value(&scene).unwrap();
        assert_eq!(json["type"], "SCENE_INIT");
    }

    #[test]
    fn test_base64_invalid_input() {
        assert_eq!(base64_decode(&base64_encode(b"abc")).unwrap(), b"abc");
        assert!(base64_decode("!!!").is_none());
    }
}
