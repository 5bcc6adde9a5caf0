//! Room membership: which connections are inside which conversation room.

use std::collections::HashMap;

use tvdesk_types::models::{Identity, RoomId};

use crate::presence::dedupe_by_user;
use crate::registry::ConnectionId;

/// Members of one room, in join order.
#[derive(Default)]
struct Room {
    members: Vec<(ConnectionId, Identity)>,
}

/// Rooms are created on first join and discarded once empty.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    /// Adds the connection to the room. Returns false if it was already in.
    pub fn join(&mut self, room_id: &str, connection_id: ConnectionId, identity: &Identity) -> bool {
        let room = self.rooms.entry(room_id.to_string()).or_default();
        if room.members.iter().any(|(id, _)| *id == connection_id) {
            return false;
        }
        room.members.push((connection_id, identity.clone()));
        true
    }

    /// Removes the connection. Returns false if it was not a member.
    /// An emptied room is dropped.
    pub fn leave(&mut self, room_id: &str, connection_id: ConnectionId) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let before = room.members.len();
        room.members.retain(|(id, _)| *id != connection_id);
        let removed = room.members.len() != before;
        if room.members.is_empty() {
            self.rooms.remove(room_id);
        }
        removed
    }

    pub fn exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Distinct members by `userId`; several sockets of one user appear once.
    pub fn members(&self, room_id: &str) -> Vec<Identity> {
        self.rooms
            .get(room_id)
            .map(|room| dedupe_by_user(room.members.iter().map(|(_, identity)| identity)))
            .unwrap_or_default()
    }

    pub fn connections(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    pub fn contains_user(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.members.iter().any(|(_, i)| i.user_id == user_id))
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
