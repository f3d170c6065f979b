//! Room membership tracking within a namespace.
//!
//! Rooms come into existence when their first member joins and vanish when
//! their last member leaves; there is no separate create or delete step. The
//! directory keeps a reverse index from socket to joined rooms so detach-time
//! cleanup does not scan every room.

use std::collections::{HashMap, HashSet};

use crate::socket::SocketId;

/// Room membership for one namespace.
///
/// Two maps are kept in lockstep:
///
/// ```text
/// rooms:       { "chat": {s1, s2}, "files": {s2} }
/// memberships: { s1: {"chat"}, s2: {"chat", "files"} }
/// ```
///
/// `rooms` answers broadcast selection in O(members); `memberships` answers
/// per-socket cleanup in O(joined rooms).
pub struct RoomDirectory {
    /// Room name -> member sockets.
    rooms: HashMap<String, HashSet<SocketId>>,

    /// Reverse index: socket -> rooms it has joined.
    memberships: HashMap<SocketId, HashSet<String>>,
}

impl RoomDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
        }
    }

    /// Add a socket to a room, creating the room if needed.
    ///
    /// Returns `false` if the socket was already a member.
    pub fn join(&mut self, socket: &SocketId, room: &str) -> bool {
        let added = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(socket.clone());
        if added {
            self.memberships
                .entry(socket.clone())
                .or_default()
                .insert(room.to_string());
        }
        added
    }

    /// Remove a socket from a room, dropping the room once empty.
    ///
    /// Returns `false` if the socket was not a member.
    pub fn leave(&mut self, socket: &SocketId, room: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        if !members.remove(socket) {
            return false;
        }
        if members.is_empty() {
            self.rooms.remove(room);
        }
        if let Some(joined) = self.memberships.get_mut(socket) {
            joined.remove(room);
            if joined.is_empty() {
                self.memberships.remove(socket);
            }
        }
        true
    }

    /// Remove a socket from every room it joined.
    ///
    /// Returns the rooms it was removed from.
    pub fn leave_all(&mut self, socket: &SocketId) -> Vec<String> {
        let Some(joined) = self.memberships.remove(socket) else {
            return Vec::new();
        };
        for room in &joined {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(socket);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        joined.into_iter().collect()
    }

    /// Whether a socket is currently in a room.
    pub fn is_member(&self, socket: &SocketId, room: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(socket))
    }

    /// Members of one room. Empty for an unknown room.
    pub fn members_of(&self, room: &str) -> impl Iterator<Item = &SocketId> {
        self.rooms
            .get(room)
            .into_iter()
            .flat_map(|members| members.iter())
    }

    /// Deduplicated members across several rooms.
    pub fn members_of_any(&self, rooms: &[&str]) -> HashSet<SocketId> {
        let mut selected = HashSet::new();
        for room in rooms {
            for socket in self.members_of(room) {
                selected.insert(socket.clone());
            }
        }
        selected
    }

    /// Rooms a socket currently belongs to.
    pub fn rooms_of(&self, socket: &SocketId) -> Vec<String> {
        self.memberships
            .get(socket)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of members in a room.
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(HashSet::len).unwrap_or(0)
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RoomDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomDirectory")
            .field("room_count", &self.rooms.len())
            .field("socket_count", &self.memberships.len())
            .finish_non_exhaustive()
    }
}
