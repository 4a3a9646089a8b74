//! Encrypted transport channel.
//!
//! The portal owns the socket for one room. Outgoing updates are serialized,
//! encrypted with the room key and emitted as durable or volatile broadcasts;
//! incoming broadcasts are decrypted back into [`SocketUpdate`]s. It also keeps
//! the ledger of element versions already broadcast, so scene deltas only carry
//! what changed.

use crate::crypto::{self, RoomKey};
use crate::element::{Element, ElementId, is_syncable_element, now_millis};
use crate::presence::{PointerButton, SocketId, UserFollowPayload, UserIdleState};
use crate::protocol::{ClientFrame, SceneUpdateKind, ServerFrame, SocketUpdate, base64_decode};
use crate::room::RoomLinkData;
use crate::socket::{SocketError, SocketEvent, SocketTransport};
use kurbo::{Point, Rect};
use std::collections::HashMap;

/// Lifecycle of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No socket.
    Closed,
    /// Socket handed over, connection not yet confirmed.
    Connecting,
    /// Connected, waiting for a peer snapshot or the first-in-room notice.
    AwaitingFirstPeerOrTimeout,
    /// Scene acquired while the connection is down.
    Initialized,
    /// Scene acquired and connected; broadcasts go out.
    Open,
}

/// What the session needs to react to, distilled from socket events.
#[derive(Debug, Clone, PartialEq)]
pub enum PortalEvent {
    /// We are alone in the room; the scene must come from storage.
    FirstInRoom,
    /// A peer joined and needs a full snapshot.
    NewUser(SocketId),
    RoomUserChange(Vec<SocketId>),
    /// Decrypted payload from a peer.
    Update(SocketUpdate),
    /// The set of users following us changed.
    FollowedBy(Vec<SocketId>),
    ConnectError(String),
    /// The connection dropped; the channel has to be closed.
    Disconnected,
    ServerError(String),
}

pub struct Portal<S> {
    socket: Option<S>,
    socket_id: Option<SocketId>,
    room: Option<RoomLinkData>,
    connected: bool,
    /// Whether the scene has been acquired (from a peer or storage).
    initialized: bool,
    broadcasted_element_versions: HashMap<ElementId, u32>,
    deleted_element_timeout_ms: i64,
}

impl<S: SocketTransport> Portal<S> {
    pub fn new(deleted_element_timeout_ms: i64) -> Self {
        Self {
            socket: None,
            socket_id: None,
            room: None,
            connected: false,
            initialized: false,
            broadcasted_element_versions: HashMap::new(),
            deleted_element_timeout_ms,
        }
    }

    /// Take ownership of a connecting socket for `room`.
    pub fn open(&mut self, socket: S, room: RoomLinkData) {
        self.close();
        self.socket = Some(socket);
        self.room = Some(room);
    }

    /// Close the socket and forget everything about the room.
    pub fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.socket_id = None;
        self.room = None;
        self.connected = false;
        self.initialized = false;
        self.broadcasted_element_versions.clear();
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.initialized && self.connected && self.socket.is_some() && self.room.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Mark the scene as acquired; from now on new peers get snapshots.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn state(&self) -> ChannelState {
        match (self.socket.is_some(), self.connected, self.initialized) {
            (false, _, _) => ChannelState::Closed,
            (true, true, true) => ChannelState::Open,
            (true, false, true) => ChannelState::Initialized,
            (true, true, false) => ChannelState::AwaitingFirstPeerOrTimeout,
            (true, false, false) => ChannelState::Connecting,
        }
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.socket_id.as_deref()
    }

    pub fn room(&self) -> Option<&RoomLinkData> {
        self.room.as_ref()
    }

    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    /// Last broadcast version of an element, if any.
    pub fn broadcasted_version(&self, id: &str) -> Option<u32> {
        self.broadcasted_element_versions.get(id).copied()
    }

    /// Drain the socket and translate its events.
    pub fn poll(&mut self) -> Vec<PortalEvent> {
        let events = match self.socket.as_mut() {
            Some(socket) => socket.poll_events(),
            None => return Vec::new(),
        };

        let mut out = Vec::new();
        for event in events {
            match event {
                SocketEvent::Connected => self.connected = true,
                SocketEvent::Disconnected => {
                    self.connected = false;
                    out.push(PortalEvent::Disconnected);
                }
                SocketEvent::ConnectError { message } => {
                    self.connected = false;
                    out.push(PortalEvent::ConnectError(message));
                }
                SocketEvent::Frame(frame) => {
                    if let Some(event) = self.handle_frame(frame) {
                        out.push(event);
                    }
                }
            }
        }
        out
    }

    fn handle_frame(&mut self, frame: ServerFrame) -> Option<PortalEvent> {
        match frame {
            ServerFrame::InitRoom { socket_id } => {
                self.connected = true;
                self.socket_id = Some(socket_id);
                let room_id = self.room.as_ref()?.room_id.clone();
                log::info!("Joining room {}", room_id);
                if let Err(e) = self.emit(&ClientFrame::JoinRoom { room: room_id }) {
                    log::error!("Failed to join room: {}", e);
                }
                None
            }
            ServerFrame::FirstInRoom => Some(PortalEvent::FirstInRoom),
            ServerFrame::NewUser { socket_id } => Some(PortalEvent::NewUser(socket_id)),
            ServerFrame::RoomUserChange { clients } => Some(PortalEvent::RoomUserChange(clients)),
            ServerFrame::ClientBroadcast { data, iv } => Some(PortalEvent::Update(self.decrypt_payload(&data, &iv))),
            ServerFrame::UserFollowRoomChange { followed_by } => Some(PortalEvent::FollowedBy(followed_by)),
            ServerFrame::Error { message } => Some(PortalEvent::ServerError(message)),
        }
    }

    /// Decrypt a broadcast payload. Any failure yields [`SocketUpdate::InvalidResponse`].
    pub fn decrypt_payload(&self, data: &str, iv: &str) -> SocketUpdate {
        let Some(room) = self.room.as_ref() else {
            return SocketUpdate::InvalidResponse;
        };
        let (Some(ciphertext), Some(iv)) = (base64_decode(data), base64_decode(iv)) else {
            log::warn!("Dropping broadcast with malformed encoding");
            return SocketUpdate::InvalidResponse;
        };
        decode_update(&room.room_key, &iv, &ciphertext)
    }

    fn emit(&mut self, frame: &ClientFrame) -> Result<(), SocketError> {
        self.socket.as_mut().ok_or(SocketError::NotConnected)?.emit(frame)
    }

    fn broadcast_socket_data(
        &mut self,
        update: &SocketUpdate,
        volatile: bool,
        room_override: Option<&str>,
    ) -> Result<bool, SocketError> {
        if !self.is_open() {
            return Ok(false);
        }
        let Some(room) = self.room.as_ref() else {
            return Ok(false);
        };
        let json = serde_json::to_vec(update).map_err(|e| SocketError::Send(e.to_string()))?;
        let encrypted = crypto::encrypt(&room.room_key, &json).map_err(|e| SocketError::Send(e.to_string()))?;
        let target = room_override.unwrap_or(&room.room_id);
        let frame = ClientFrame::broadcast(target, &encrypted.iv, &encrypted.ciphertext, volatile);
        self.emit(&frame)?;
        Ok(true)
    }

    /// Broadcast scene elements on the durable channel.
    ///
    /// Unless `sync_all` is set only elements whose version grew since their
    /// last broadcast are sent. Snapshots for new peers are always full.
    /// Old tombstones are never sent.
    pub fn broadcast_scene(
        &mut self,
        kind: SceneUpdateKind,
        elements: &[Element],
        sync_all: bool,
    ) -> Result<(), SocketError> {
        let sync_all = sync_all || kind == SceneUpdateKind::Init;
        let now = now_millis();

        let to_send: Vec<Element> = elements
            .iter()
            .filter(|element| {
                sync_all
                    || self
                        .broadcasted_element_versions
                        .get(&element.id)
                        .is_none_or(|&version| element.version > version)
            })
            .filter(|element| is_syncable_element(element, now, self.deleted_element_timeout_ms))
            .cloned()
            .collect();

        if to_send.is_empty() && kind == SceneUpdateKind::Update {
            return Ok(());
        }

        let versions: Vec<(ElementId, u32)> = to_send.iter().map(|el| (el.id.clone(), el.version)).collect();
        if self.broadcast_socket_data(&kind.into_update(to_send), false, None)? {
            self.broadcasted_element_versions.extend(versions);
        }
        Ok(())
    }

    pub fn broadcast_idle_change(&mut self, user_state: UserIdleState, username: Option<String>) -> Result<(), SocketError> {
        let Some(socket_id) = self.socket_id.clone() else {
            return Ok(());
        };
        let update = SocketUpdate::IdleStatus {
            socket_id,
            user_state,
            username,
        };
        self.broadcast_socket_data(&update, true, None).map(|_| ())
    }

    pub fn broadcast_mouse_location(
        &mut self,
        pointer: Point,
        button: PointerButton,
        selected_element_ids: Vec<ElementId>,
        username: Option<String>,
    ) -> Result<(), SocketError> {
        let Some(socket_id) = self.socket_id.clone() else {
            return Ok(());
        };
        let update = SocketUpdate::MouseLocation {
            socket_id,
            pointer,
            button,
            selected_element_ids,
            username,
        };
        self.broadcast_socket_data(&update, true, None).map(|_| ())
    }

    /// Send our viewport to `room` (our follow room).
    pub fn broadcast_visible_scene_bounds(
        &mut self,
        scene_bounds: Rect,
        username: Option<String>,
        room: &str,
    ) -> Result<(), SocketError> {
        let Some(socket_id) = self.socket_id.clone() else {
            return Ok(());
        };
        let update = SocketUpdate::UserVisibleSceneBounds {
            socket_id,
            username,
            scene_bounds,
        };
        self.broadcast_socket_data(&update, true, Some(room)).map(|_| ())
    }

    /// Tell the server we started or stopped following someone.
    pub fn broadcast_user_follow(&mut self, payload: &UserFollowPayload) -> Result<(), SocketError> {
        if !self.is_open() {
            return Ok(());
        }
        self.emit(&ClientFrame::UserFollow {
            user_to_follow: payload.user_to_follow.clone(),
            action: payload.action,
        })
    }
}

/// Decrypt and parse a broadcast body.
pub fn decode_update(key: &RoomKey, iv: &[u8], ciphertext: &[u8]) -> SocketUpdate {
    let plaintext = match crypto::decrypt(key, iv, ciphertext) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            log::warn!("Dropping undecryptable broadcast: {}", e);
            return SocketUpdate::InvalidResponse;
        }
    };
    serde_json::from_slice(&plaintext).unwrap_or_else(|e| {
        log::warn!("Dropping unparseable broadcast: {}", e);
        SocketUpdate::InvalidResponse
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{MemoryHub, MemorySocket};

    fn open_portal(hub: &MemoryHub, room: &RoomLinkData) -> Portal<MemorySocket> {
        let mut portal = Portal::new(i64::MAX);
        portal.open(hub.socket(), room.clone());
        // connect, then the join round-trip
        portal.poll();
        portal.poll();
        portal
    }

    fn last_broadcast_elements(hub: &MemoryHub, socket_id: &str, room: &RoomLinkData) -> Vec<Element> {
        let frame = hub.sent(socket_id).pop().unwrap();
        let ClientFrame::ServerBroadcast { data, iv, .. } = frame else {
            panic!("expected durable broadcast, got {:?}", frame);
        };
        match decode_update(&room.room_key, &base64_decode(&iv).unwrap(), &base64_decode(&data).unwrap()) {
            SocketUpdate::Update { elements } | SocketUpdate::Init { elements } => elements,
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[test]
    fn test_state_progression() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut portal: Portal<MemorySocket> = Portal::new(i64::MAX);
        assert_eq!(portal.state(), ChannelState::Closed);

        portal.open(hub.socket(), room.clone());
        assert_eq!(portal.state(), ChannelState::Connecting);

        assert!(portal.poll().is_empty());
        assert_eq!(portal.state(), ChannelState::AwaitingFirstPeerOrTimeout);
        assert_eq!(
            portal.poll(),
            vec![PortalEvent::FirstInRoom, PortalEvent::RoomUserChange(vec!["mem-1".into()])]
        );
        assert!(!portal.is_open());

        portal.mark_initialized();
        assert_eq!(portal.state(), ChannelState::Open);
        assert!(portal.is_open());

        portal.close();
        assert_eq!(portal.state(), ChannelState::Closed);
        assert!(portal.room().is_none());
    }

    #[test]
    fn test_join_emitted_on_init_room() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let portal = open_portal(&hub, &room);
        assert_eq!(portal.socket_id(), Some("mem-1"));
        assert_eq!(hub.sent("mem-1"), vec![ClientFrame::JoinRoom { room: room.room_id.clone() }]);
    }

    #[test]
    fn test_delta_broadcast_uses_ledger() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut portal = open_portal(&hub, &room);
        portal.mark_initialized();

        let a = Element::new("rectangle");
        let b = Element::new("ellipse");
        portal.broadcast_scene(SceneUpdateKind::Update, &[a.clone(), b.clone()], false).unwrap();
        assert_eq!(last_broadcast_elements(&hub, "mem-1", &room).len(), 2);
        assert_eq!(portal.broadcasted_version(&a.id), Some(a.version));

        let a2 = a.mutated(|_| {});
        portal.broadcast_scene(SceneUpdateKind::Update, &[a2.clone(), b.clone()], false).unwrap();
        let sent = last_broadcast_elements(&hub, "mem-1", &room);
        assert_eq!(sent, vec![a2.clone()]);

        // nothing changed: nothing sent
        let frames_before = hub.sent("mem-1").len();
        portal.broadcast_scene(SceneUpdateKind::Update, &[a2.clone(), b.clone()], false).unwrap();
        assert_eq!(hub.sent("mem-1").len(), frames_before);

        portal.broadcast_scene(SceneUpdateKind::Update, &[a2, b], true).unwrap();
        assert_eq!(last_broadcast_elements(&hub, "mem-1", &room).len(), 2);
    }

    #[test]
    fn test_no_broadcast_before_initialized() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut portal = open_portal(&hub, &room);
        let el = Element::new("rectangle");
        portal.broadcast_scene(SceneUpdateKind::Update, &[el.clone()], false).unwrap();
        assert_eq!(hub.sent("mem-1").len(), 1);
        assert_eq!(portal.broadcasted_version(&el.id), None);
    }

    #[test]
    fn test_close_resets_ledger() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut portal = open_portal(&hub, &room);
        portal.mark_initialized();
        let el = Element::new("rectangle");
        portal.broadcast_scene(SceneUpdateKind::Update, &[el.clone()], false).unwrap();
        portal.close();
        assert_eq!(portal.broadcasted_version(&el.id), None);
    }

    #[test]
    fn test_old_tombstones_not_broadcast() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut portal: Portal<MemorySocket> = Portal::new(1_000);
        portal.open(hub.socket(), room.clone());
        portal.poll();
        portal.poll();
        portal.mark_initialized();

        let live = Element::new("rectangle");
        let mut old = Element::new("rectangle").deleted();
        old.updated -= 10_000;
        portal.broadcast_scene(SceneUpdateKind::Init, &[live.clone(), old], true).unwrap();
        assert_eq!(last_broadcast_elements(&hub, "mem-1", &room), vec![live]);
    }

    #[test]
    fn test_peer_receives_decrypted_update() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut a = open_portal(&hub, &room);
        let mut b = open_portal(&hub, &room);
        a.poll();
        a.mark_initialized();

        a.broadcast_idle_change(UserIdleState::Away, Some("ada".into())).unwrap();
        let events = b.poll();
        assert!(events.contains(&PortalEvent::Update(SocketUpdate::IdleStatus {
            socket_id: "mem-1".into(),
            user_state: UserIdleState::Away,
            username: Some("ada".into()),
        })));
    }

    #[test]
    fn test_wrong_key_yields_invalid_response() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut a = open_portal(&hub, &room);
        let other = RoomLinkData::new(room.room_id.clone(), RoomKey::generate());
        let mut b = open_portal(&hub, &other);
        a.poll();
        a.mark_initialized();

        a.broadcast_scene(SceneUpdateKind::Update, &[Element::new("rectangle")], false).unwrap();
        a.broadcast_idle_change(UserIdleState::Idle, None).unwrap();
        let updates: Vec<_> = b
            .poll()
            .into_iter()
            .filter_map(|e| match e {
                PortalEvent::Update(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![SocketUpdate::InvalidResponse, SocketUpdate::InvalidResponse]);
    }

    #[test]
    fn test_malformed_payload_is_invalid_response() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let portal = open_portal(&hub, &room);
        assert_eq!(portal.decrypt_payload("***", "***"), SocketUpdate::InvalidResponse);
    }

    #[test]
    fn test_visible_bounds_go_to_follow_room() {
        let hub = MemoryHub::new();
        let room = RoomLinkData::generate();
        let mut portal = open_portal(&hub, &room);
        portal.mark_initialized();
        let follow_room = RoomLinkData::follow_room("mem-1");
        portal
            .broadcast_visible_scene_bounds(Rect::new(0.0, 0.0, 10.0, 10.0), None, &follow_room)
            .unwrap();
        match hub.sent("mem-1").pop().unwrap() {
            ClientFrame::ServerVolatileBroadcast { room, .. } => assert_eq!(room, follow_room),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
