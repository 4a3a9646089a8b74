//! Ephemeral per-peer presence: pointers, selections, idle state, follow mode.

use crate::element::ElementId;
use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transport-assigned connection identifier.
pub type SocketId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserIdleState {
    #[default]
    Active,
    Idle,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    Down,
    #[default]
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowAction {
    Follow,
    Unfollow,
}

/// Emitted by the host when the local user starts or stops following someone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFollowPayload {
    pub user_to_follow: SocketId,
    pub action: FollowAction,
}

/// What we know about one connected peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collaborator {
    pub pointer: Option<Point>,
    pub button: Option<PointerButton>,
    pub selected_element_ids: Vec<ElementId>,
    pub username: Option<String>,
    pub user_state: Option<UserIdleState>,
    pub is_current_user: bool,
}

/// Partial update applied from a presence message.
#[derive(Debug, Clone, Default)]
pub struct CollaboratorUpdate {
    pub pointer: Option<Point>,
    pub button: Option<PointerButton>,
    pub selected_element_ids: Option<Vec<ElementId>>,
    pub username: Option<String>,
    pub user_state: Option<UserIdleState>,
}

/// Roster of peers in the current room, keyed by socket id.
#[derive(Debug, Clone, Default)]
pub struct Collaborators {
    peers: HashMap<SocketId, Collaborator>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with `clients`, keeping known state for peers that stay.
    pub fn set_roster(&mut self, clients: &[SocketId], own_id: Option<&str>) {
        let mut next = HashMap::with_capacity(clients.len());
        for socket_id in clients {
            let mut peer = self.peers.remove(socket_id).unwrap_or_default();
            peer.is_current_user = own_id == Some(socket_id.as_str());
            next.insert(socket_id.clone(), peer);
        }
        self.peers = next;
    }

    /// Merge a presence update into a peer, creating it on first sight.
    pub fn update(&mut self, socket_id: &str, update: CollaboratorUpdate, own_id: Option<&str>) {
        let peer = self.peers.entry(socket_id.to_string()).or_default();
        if let Some(pointer) = update.pointer {
            peer.pointer = Some(pointer);
        }
        if let Some(button) = update.button {
            peer.button = Some(button);
        }
        if let Some(ids) = update.selected_element_ids {
            peer.selected_element_ids = ids;
        }
        if let Some(username) = update.username {
            peer.username = Some(username);
        }
        if let Some(state) = update.user_state {
            peer.user_state = Some(state);
        }
        peer.is_current_user = own_id == Some(socket_id);
    }

    pub fn get(&self, socket_id: &str) -> Option<&Collaborator> {
        self.peers.get(socket_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SocketId, &Collaborator)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
