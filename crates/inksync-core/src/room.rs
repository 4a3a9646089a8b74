//! Room credentials and shareable links.
//!
//! A link looks like `https://host/#room=<room_id>,<room_key>`. The key lives in
//! the fragment so it never reaches a server.

use crate::crypto::RoomKey;
use rand::RngCore;
use rand::rngs::OsRng;

const ROOM_ID_BYTES: usize = 10;
const ROOM_FRAGMENT: &str = "#room=";

/// Identifies a room and carries the key that encrypts everything in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLinkData {
    pub room_id: String,
    pub room_key: RoomKey,
}

impl RoomLinkData {
    pub fn new(room_id: impl Into<String>, room_key: RoomKey) -> Self {
        Self {
            room_id: room_id.into(),
            room_key,
        }
    }

    /// Fresh credentials for a brand-new room.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ROOM_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let room_id = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            room_id,
            room_key: RoomKey::generate(),
        }
    }

    /// Shareable link for `origin` (scheme + host, no fragment).
    pub fn link(&self, origin: &str) -> String {
        format!(
            "{}/{}{},{}",
            origin.trim_end_matches('/'),
            ROOM_FRAGMENT,
            self.room_id,
            self.room_key.encoded()
        )
    }

    /// Parse credentials from a shareable link. Returns `None` for anything else.
    pub fn parse_link(link: &str) -> Option<Self> {
        let start = link.find(ROOM_FRAGMENT)? + ROOM_FRAGMENT.len();
        let (room_id, room_key) = link[start..].split_once(',')?;
        let valid_id = !room_id.is_empty()
            && room_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_id {
            return None;
        }
        let room_key = RoomKey::from_encoded(room_key).ok()?;
        Some(Self::new(room_id, room_key))
    }

    /// Storage key of the encrypted scene record.
    pub fn scene_key(&self) -> String {
        format!("rooms/{}", self.room_id)
    }

    /// Storage prefix under which this room's attachments live.
    pub fn files_prefix(&self) -> String {
        format!("files/rooms/{}", self.room_id)
    }

    /// Broadcast room used to relay viewport bounds to followers of `socket_id`.
    pub fn follow_room(socket_id: &str) -> String {
        format!("follow@{}", socket_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_room_id() {
        let room = RoomLinkData::generate();
        assert_eq!(room.room_id.len(), ROOM_ID_BYTES * 2);
        assert!(room.room_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_link_roundtrip() {
        let room = RoomLinkData::generate();
        let link = room.link("https://draw.example.com/");
        assert!(link.starts_with("https://draw.example.com/#room="));
        assert_eq!(RoomLinkData::parse_link(&link), Some(room));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RoomLinkData::parse_link("https://draw.example.com/").is_none());
        assert!(RoomLinkData::parse_link("https://x/#room=abc").is_none());
        assert!(RoomLinkData::parse_link("https://x/#room=a b,AAAAAAAAAAAAAAAAAAAAAA").is_none());
        assert!(RoomLinkData::parse_link("https://x/#room=abc,tooshort").is_none());
    }

    #[test]
    fn test_storage_keys() {
        let room = RoomLinkData::new("abc123", RoomKey::generate());
        assert_eq!(room.scene_key(), "rooms/abc123");
        assert_eq!(room.files_prefix(), "files/rooms/abc123");
        assert_eq!(RoomLinkData::follow_room("sock-1"), "follow@sock-1");
    }
}
