//! In-process relay for tests and single-process embedding.
//!
//! [`MemoryHub`] routes frames between its sockets with the same room
//! semantics as the relay server, synchronously and without encryption
//! awareness.

use super::{ConnectionState, SocketConnector, SocketError, SocketEvent, SocketTransport};
use crate::presence::{FollowAction, SocketId};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::room::RoomLinkData;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
struct HubState {
    inboxes: HashMap<SocketId, Vec<SocketEvent>>,
    /// Room name -> members in join order.
    rooms: HashMap<String, Vec<SocketId>>,
    sent: HashMap<SocketId, Vec<ClientFrame>>,
    refuse_connections: Option<String>,
    drop_volatile: bool,
    next_id: u64,
}

impl HubState {
    fn push(&mut self, socket_id: &str, event: SocketEvent) {
        if let Some(inbox) = self.inboxes.get_mut(socket_id) {
            inbox.push(event);
        }
    }

    fn push_frame(&mut self, socket_id: &str, frame: ServerFrame) {
        self.push(socket_id, SocketEvent::Frame(frame));
    }

    fn members(&self, room: &str) -> Vec<SocketId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    fn join(&mut self, socket_id: &str, room: &str) {
        let members = self.rooms.entry(room.to_string()).or_default();
        if members.iter().any(|m| m == socket_id) {
            return;
        }
        members.push(socket_id.to_string());
        let members = members.clone();

        if members.len() == 1 {
            self.push_frame(socket_id, ServerFrame::FirstInRoom);
        } else {
            for other in members.iter().filter(|m| *m != socket_id) {
                self.push_frame(other, ServerFrame::NewUser { socket_id: socket_id.to_string() });
            }
        }
        self.announce_roster(room);
    }

    fn announce_roster(&mut self, room: &str) {
        let clients = self.members(room);
        for member in &clients {
            self.push_frame(member, ServerFrame::RoomUserChange { clients: clients.clone() });
        }
    }

    fn set_following(&mut self, socket_id: &str, target: &str, action: FollowAction) {
        let room = RoomLinkData::follow_room(target);
        let members = self.rooms.entry(room.clone()).or_default();
        match action {
            FollowAction::Follow => {
                if !members.iter().any(|m| m == socket_id) {
                    members.push(socket_id.to_string());
                }
            }
            FollowAction::Unfollow => members.retain(|m| m != socket_id),
        }
        let followed_by = self.members(&room);
        self.push_frame(target, ServerFrame::UserFollowRoomChange { followed_by });
    }

    fn leave_all(&mut self, socket_id: &str) {
        let joined: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == socket_id))
            .map(|(room, _)| room.clone())
            .collect();
        for room in joined {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.retain(|m| m != socket_id);
            }
            match room.strip_prefix("follow@") {
                Some(target) => {
                    let target = target.to_string();
                    let followed_by = self.members(&room);
                    self.push_frame(&target, ServerFrame::UserFollowRoomChange { followed_by });
                }
                None => self.announce_roster(&room),
            }
        }
        self.rooms.retain(|_, members| !members.is_empty());
    }

    fn route(&mut self, from: &str, frame: &ClientFrame) {
        match frame {
            ClientFrame::JoinRoom { room } => self.join(from, room),
            ClientFrame::ServerBroadcast { room, data, iv }
            | ClientFrame::ServerVolatileBroadcast { room, data, iv } => {
                if frame.is_volatile() && self.drop_volatile {
                    return;
                }
                for member in self.members(room).iter().filter(|m| *m != from) {
                    self.push_frame(
                        member,
                        ServerFrame::ClientBroadcast {
                            data: data.clone(),
                            iv: iv.clone(),
                        },
                    );
                }
            }
            ClientFrame::UserFollow { user_to_follow, action } => {
                self.set_following(from, user_to_follow, *action)
            }
        }
    }
}

/// Shared in-memory relay. Clones refer to the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Rc<RefCell<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connections fail with `message`, or accept them again with `None`.
    pub fn refuse_connections(&self, message: Option<&str>) {
        self.state.borrow_mut().refuse_connections = message.map(str::to_string);
    }

    /// Drop every volatile broadcast, as a congested relay would.
    pub fn drop_volatile(&self, drop: bool) {
        self.state.borrow_mut().drop_volatile = drop;
    }

    /// Frames a socket has emitted, oldest first.
    pub fn sent(&self, socket_id: &str) -> Vec<ClientFrame> {
        self.state.borrow().sent.get(socket_id).cloned().unwrap_or_default()
    }

    /// Current members of a room.
    pub fn members(&self, room: &str) -> Vec<SocketId> {
        self.state.borrow().members(room)
    }

    /// Drop a connection from the server side.
    pub fn disconnect(&self, socket_id: &str) {
        let mut state = self.state.borrow_mut();
        state.leave_all(socket_id);
        state.push(socket_id, SocketEvent::Disconnected);
    }

    /// Deliver an event to a socket as if it came from the server.
    pub fn inject(&self, socket_id: &str, event: SocketEvent) {
        self.state.borrow_mut().push(socket_id, event);
    }

    /// Open a socket on this hub.
    pub fn socket(&self) -> MemorySocket {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);

        let inbox = match &state.refuse_connections {
            Some(message) => vec![SocketEvent::ConnectError { message: message.clone() }],
            None => vec![
                SocketEvent::Connected,
                SocketEvent::Frame(ServerFrame::InitRoom { socket_id: id.clone() }),
            ],
        };
        state.inboxes.insert(id.clone(), inbox);

        MemorySocket {
            id,
            hub: Rc::clone(&self.state),
            state: ConnectionState::Connecting,
        }
    }
}

impl SocketConnector for MemoryHub {
    type Socket = MemorySocket;

    fn connect(&mut self, _url: &str, _token: Option<&str>) -> Result<MemorySocket, SocketError> {
        Ok(self.socket())
    }
}

/// One connection to a [`MemoryHub`].
pub struct MemorySocket {
    id: SocketId,
    hub: Rc<RefCell<HubState>>,
    state: ConnectionState,
}

impl MemorySocket {
    /// Id the hub assigned to this connection.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl SocketTransport for MemorySocket {
    fn emit(&mut self, frame: &ClientFrame) -> Result<(), SocketError> {
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Error) {
            return Err(SocketError::NotConnected);
        }
        let mut hub = self.hub.borrow_mut();
        hub.sent.entry(self.id.clone()).or_default().push(frame.clone());
        hub.route(&self.id, frame);
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<SocketEvent> {
        let events = self
            .hub
            .borrow_mut()
            .inboxes
            .get_mut(&self.id)
            .map(std::mem::take)
            .unwrap_or_default();
        for event in &events {
            match event {
                SocketEvent::Connected => self.state = ConnectionState::Connected,
                SocketEvent::Disconnected => self.state = ConnectionState::Disconnected,
                SocketEvent::ConnectError { .. } => self.state = ConnectionState::Error,
                SocketEvent::Frame(_) => {}
            }
        }
        events
    }

    fn close(&mut self) {
        let mut hub = self.hub.borrow_mut();
        hub.leave_all(&self.id);
        hub.inboxes.remove(&self.id);
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(socket: &mut MemorySocket, room: &str) {
        socket.emit(&ClientFrame::JoinRoom { room: room.into() }).unwrap();
    }

    #[test]
    fn test_connect_then_init_room() {
        let hub = MemoryHub::new();
        let mut socket = hub.socket();
        let events = socket.poll_events();
        assert_eq!(events[0], SocketEvent::Connected);
        assert_eq!(
            events[1],
            SocketEvent::Frame(ServerFrame::InitRoom { socket_id: socket.id().to_string() })
        );
        assert_eq!(socket.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_first_in_room_then_new_user() {
        let hub = MemoryHub::new();
        let mut a = hub.socket();
        let mut b = hub.socket();
        a.poll_events();
        b.poll_events();

        join(&mut a, "room");
        assert!(a.poll_events().contains(&SocketEvent::Frame(ServerFrame::FirstInRoom)));

        join(&mut b, "room");
        let a_events = a.poll_events();
        assert!(a_events.contains(&SocketEvent::Frame(ServerFrame::NewUser {
            socket_id: b.id().to_string()
        })));
        let b_events = b.poll_events();
        assert!(!b_events.contains(&SocketEvent::Frame(ServerFrame::FirstInRoom)));
        assert!(b_events.iter().any(|e| matches!(
            e,
            SocketEvent::Frame(ServerFrame::RoomUserChange { clients }) if clients.len() == 2
        )));
    }

    #[test]
    fn test_broadcast_skips_sender_and_volatile_can_drop() {
        let hub = MemoryHub::new();
        let mut a = hub.socket();
        let mut b = hub.socket();
        join(&mut a, "room");
        join(&mut b, "room");
        a.poll_events();
        b.poll_events();

        a.emit(&ClientFrame::broadcast("room", b"iv", b"x", false)).unwrap();
        assert!(a.poll_events().is_empty());
        assert_eq!(b.poll_events().len(), 1);

        hub.drop_volatile(true);
        a.emit(&ClientFrame::broadcast("room", b"iv", b"x", true)).unwrap();
        assert!(b.poll_events().is_empty());
    }

    #[test]
    fn test_refused_connection() {
        let mut hub = MemoryHub::new();
        hub.refuse_connections(Some("nope"));
        let mut socket = hub.connect("ws://ignored", None).unwrap();
        assert_eq!(
            socket.poll_events(),
            vec![SocketEvent::ConnectError { message: "nope".into() }]
        );
        assert!(socket.emit(&ClientFrame::JoinRoom { room: "r".into() }).is_err());
    }

    #[test]
    fn test_close_updates_roster_and_followers() {
        let hub = MemoryHub::new();
        let mut a = hub.socket();
        let mut b = hub.socket();
        join(&mut a, "room");
        join(&mut b, "room");
        b.emit(&ClientFrame::UserFollow {
            user_to_follow: a.id().to_string(),
            action: FollowAction::Follow,
        })
        .unwrap();
        let events = a.poll_events();
        assert!(events.contains(&SocketEvent::Frame(ServerFrame::UserFollowRoomChange {
            followed_by: vec![b.id().to_string()]
        })));

        b.close();
        let events = a.poll_events();
        assert!(events.contains(&SocketEvent::Frame(ServerFrame::RoomUserChange {
            clients: vec![a.id().to_string()]
        })));
        assert!(events.contains(&SocketEvent::Frame(ServerFrame::UserFollowRoomChange {
            followed_by: vec![]
        })));
    }
}
