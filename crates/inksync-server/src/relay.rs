//! Room membership and frame routing.
//!
//! Every connection owns a bounded outbox drained by its writer task. Durable
//! frames wait for room in the outbox; volatile frames are dropped when it is
//! full.

use dashmap::DashMap;
use inksync_core::protocol::{ClientFrame, ServerFrame};
use inksync_core::{FollowAction, RoomLinkData, SocketId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

/// Outbox capacity per connection
pub const OUTBOX_CAPACITY: usize = 256;

const FOLLOW_ROOM_PREFIX: &str = "follow@";

/// Shared relay state
#[derive(Default)]
pub struct Relay {
    /// Connected sockets and their outboxes
    clients: DashMap<SocketId, mpsc::Sender<ServerFrame>>,
    /// Room name -> members in join order
    rooms: DashMap<String, Vec<SocketId>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and greet it with its socket id.
    pub async fn connect(&self, socket_id: &str, outbox: mpsc::Sender<ServerFrame>) {
        self.clients.insert(socket_id.to_string(), outbox);
        self.deliver(socket_id, ServerFrame::InitRoom {
            socket_id: socket_id.to_string(),
        })
        .await;
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Current members of a room
    pub fn members(&self, room: &str) -> Vec<SocketId> {
        self.rooms.get(room).map(|members| members.clone()).unwrap_or_default()
    }

    /// Route one frame received from `from`.
    pub async fn handle(&self, from: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::JoinRoom { room } => self.join(from, &room).await,
            ClientFrame::ServerBroadcast { room, data, iv } => {
                self.broadcast(from, &room, ServerFrame::ClientBroadcast { data, iv }, false)
                    .await
            }
            ClientFrame::ServerVolatileBroadcast { room, data, iv } => {
                self.broadcast(from, &room, ServerFrame::ClientBroadcast { data, iv }, true)
                    .await
            }
            ClientFrame::UserFollow { user_to_follow, action } => self.follow(from, &user_to_follow, action).await,
        }
    }

    async fn join(&self, socket_id: &str, room: &str) {
        let members = {
            let mut members = self.rooms.entry(room.to_string()).or_default();
            if members.iter().any(|m| m == socket_id) {
                return;
            }
            members.push(socket_id.to_string());
            members.clone()
        };
        info!("Socket {} joined room {} ({} members)", socket_id, room, members.len());

        if members.len() == 1 {
            self.deliver(socket_id, ServerFrame::FirstInRoom).await;
        } else {
            for other in members.iter().filter(|m| *m != socket_id) {
                self.deliver(other, ServerFrame::NewUser {
                    socket_id: socket_id.to_string(),
                })
                .await;
            }
        }
        self.announce_roster(&members).await;
    }

    async fn announce_roster(&self, members: &[SocketId]) {
        for member in members {
            self.deliver(member, ServerFrame::RoomUserChange {
                clients: members.to_vec(),
            })
            .await;
        }
    }

    async fn broadcast(&self, from: &str, room: &str, frame: ServerFrame, volatile: bool) {
        let members = self.members(room);
        if !members.iter().any(|m| m == from) {
            debug!("Socket {} broadcast to room {} without joining it", from, room);
        }
        for member in members.iter().filter(|m| *m != from) {
            if volatile {
                self.deliver_volatile(member, frame.clone());
            } else {
                self.deliver(member, frame.clone()).await;
            }
        }
    }

    async fn follow(&self, socket_id: &str, target: &str, action: FollowAction) {
        let room = RoomLinkData::follow_room(target);
        let followed_by = {
            let mut members = self.rooms.entry(room.clone()).or_default();
            match action {
                FollowAction::Follow => {
                    if !members.iter().any(|m| m == socket_id) {
                        members.push(socket_id.to_string());
                    }
                }
                FollowAction::Unfollow => members.retain(|m| m != socket_id),
            }
            members.clone()
        };
        if followed_by.is_empty() {
            self.rooms.remove_if(&room, |_, members| members.is_empty());
        }
        debug!("Socket {} {:?} {}", socket_id, action, target);
        self.deliver(target, ServerFrame::UserFollowRoomChange { followed_by }).await;
    }

    /// Remove a socket from every room and tell the remaining members.
    pub async fn disconnect(&self, socket_id: &str) {
        self.clients.remove(socket_id);

        let mut changed: Vec<(String, Vec<SocketId>)> = Vec::new();
        self.rooms.retain(|room, members| {
            let before = members.len();
            members.retain(|m| m != socket_id);
            if members.len() != before {
                changed.push((room.clone(), members.clone()));
            }
            !members.is_empty()
        });

        for (room, members) in changed {
            match room.strip_prefix(FOLLOW_ROOM_PREFIX) {
                Some(target) => {
                    self.deliver(target, ServerFrame::UserFollowRoomChange { followed_by: members })
                        .await
                }
                None => self.announce_roster(&members).await,
            }
        }
    }

    fn outbox(&self, socket_id: &str) -> Option<mpsc::Sender<ServerFrame>> {
        self.clients.get(socket_id).map(|tx| tx.clone())
    }

    async fn deliver(&self, socket_id: &str, frame: ServerFrame) {
        let Some(tx) = self.outbox(socket_id) else {
            return;
        };
        if tx.send(frame).await.is_err() {
            debug!("Outbox of {} is closed", socket_id);
        }
    }

    fn deliver_volatile(&self, socket_id: &str, frame: ServerFrame) {
        let Some(tx) = self.outbox(socket_id) else {
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Dropping volatile frame for {}", socket_id),
            Err(TrySendError::Closed(_)) => debug!("Outbox of {} is closed", socket_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client(relay: &Relay, id: &str, capacity: usize) -> mpsc::Receiver<ServerFrame> {
        let (tx, mut rx) = mpsc::channel(capacity);
        relay.connect(id, tx).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerFrame::InitRoom {
                socket_id: id.to_string()
            }
        );
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn join(room: &str) -> ClientFrame {
        ClientFrame::JoinRoom { room: room.to_string() }
    }

    fn roster(ids: &[&str]) -> ServerFrame {
        ServerFrame::RoomUserChange {
            clients: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_join_notifies_members() {
        let relay = Relay::new();
        let mut a = client(&relay, "a", 16).await;
        let mut b = client(&relay, "b", 16).await;

        relay.handle("a", join("room")).await;
        assert_eq!(drain(&mut a), vec![ServerFrame::FirstInRoom, roster(&["a"])]);

        relay.handle("b", join("room")).await;
        assert_eq!(
            drain(&mut a),
            vec![
                ServerFrame::NewUser {
                    socket_id: "b".to_string()
                },
                roster(&["a", "b"])
            ]
        );
        assert_eq!(drain(&mut b), vec![roster(&["a", "b"])]);

        // joining twice changes nothing
        relay.handle("b", join("room")).await;
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let relay = Relay::new();
        let mut a = client(&relay, "a", 16).await;
        let mut b = client(&relay, "b", 16).await;
        relay.handle("a", join("room")).await;
        relay.handle("b", join("room")).await;
        drain(&mut a);
        drain(&mut b);

        relay
            .handle(
                "a",
                ClientFrame::ServerBroadcast {
                    room: "room".to_string(),
                    data: "ZGF0YQ==".to_string(),
                    iv: "aXY=".to_string(),
                },
            )
            .await;
        assert!(drain(&mut a).is_empty());
        assert_eq!(
            drain(&mut b),
            vec![ServerFrame::ClientBroadcast {
                data: "ZGF0YQ==".to_string(),
                iv: "aXY=".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_volatile_dropped_when_outbox_full() {
        let relay = Relay::new();
        let mut a = client(&relay, "a", 4).await;
        let mut b = client(&relay, "b", 1).await;
        relay.handle("a", join("room")).await;
        drain(&mut a);
        relay.handle("b", join("room")).await;
        drain(&mut b);

        // fill b's single slot, then the volatile frame has nowhere to go
        relay
            .handle(
                "a",
                ClientFrame::ServerBroadcast {
                    room: "room".to_string(),
                    data: "first".to_string(),
                    iv: "iv".to_string(),
                },
            )
            .await;
        relay
            .handle(
                "a",
                ClientFrame::ServerVolatileBroadcast {
                    room: "room".to_string(),
                    data: "cursor".to_string(),
                    iv: "iv".to_string(),
                },
            )
            .await;
        assert_eq!(
            drain(&mut b),
            vec![ServerFrame::ClientBroadcast {
                data: "first".to_string(),
                iv: "iv".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_follow_room_changes() {
        let relay = Relay::new();
        let _a = client(&relay, "a", 16).await;
        let mut b = client(&relay, "b", 16).await;

        relay
            .handle(
                "a",
                ClientFrame::UserFollow {
                    user_to_follow: "b".to_string(),
                    action: FollowAction::Follow,
                },
            )
            .await;
        assert_eq!(relay.members("follow@b"), vec!["a".to_string()]);
        assert_eq!(
            drain(&mut b),
            vec![ServerFrame::UserFollowRoomChange {
                followed_by: vec!["a".to_string()]
            }]
        );

        relay
            .handle(
                "a",
                ClientFrame::UserFollow {
                    user_to_follow: "b".to_string(),
                    action: FollowAction::Unfollow,
                },
            )
            .await;
        assert!(relay.members("follow@b").is_empty());
        assert_eq!(
            drain(&mut b),
            vec![ServerFrame::UserFollowRoomChange { followed_by: vec![] }]
        );
    }

    #[tokio::test]
    async fn test_disconnect_updates_rooms() {
        let relay = Relay::new();
        let _a = client(&relay, "a", 16).await;
        let mut b = client(&relay, "b", 16).await;
        relay.handle("a", join("room")).await;
        relay.handle("b", join("room")).await;
        relay
            .handle(
                "a",
                ClientFrame::UserFollow {
                    user_to_follow: "b".to_string(),
                    action: FollowAction::Follow,
                },
            )
            .await;
        drain(&mut b);

        relay.disconnect("a").await;
        assert_eq!(relay.client_count(), 1);
        assert_eq!(relay.members("room"), vec!["b".to_string()]);
        let frames = drain(&mut b);
        assert!(frames.contains(&roster(&["b"])));
        assert!(frames.contains(&ServerFrame::UserFollowRoomChange { followed_by: vec![] }));
    }
}
