//! Rooms: explicit, transient client groupings.
//!
//! A room is distinct from a channel subscription: it is created on first
//! join and destroyed the moment its last member leaves. The hub removes
//! empty rooms immediately (reference-count collection, no timer), so a
//! later join with the same id starts from a fresh membership set.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::client::ClientId;
use crate::pool::Poolable;

/// A named grouping of clients with its own membership and broadcast scope.
#[derive(Debug, Clone)]
pub struct Room {
    id: String,
    members: HashSet<ClientId>,
    created_at: Instant,
    last_activity: Instant,
}

impl Default for Room {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            id: String::new(),
            members: HashSet::new(),
            created_at: now,
            last_activity: now,
        }
    }
}

impl Room {
    /// Initialize a (fresh or recycled) room under a new id.
    pub(crate) fn open(&mut self, id: &str) {
        let now = Instant::now();
        self.id = id.to_string();
        self.members.clear();
        self.created_at = now;
        self.last_activity = now;
    }

    /// The room id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a member. Idempotent; returns `true` if the member was new.
    pub fn join(&mut self, client_id: ClientId) -> bool {
        self.last_activity = Instant::now();
        self.members.insert(client_id)
    }

    /// Remove a member. Idempotent; returns `true` if the member was
    /// present.
    pub fn leave(&mut self, client_id: &ClientId) -> bool {
        self.last_activity = Instant::now();
        self.members.remove(client_id)
    }

    /// Whether a client is a member.
    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.members.contains(client_id)
    }

    /// Iterate over member ids.
    pub fn members(&self) -> impl Iterator<Item = &ClientId> {
        self.members.iter()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// When the room was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long since the last membership change.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

impl Poolable for Room {
    fn reset(&mut self) {
        self.id.clear();
        self.members.clear();
        let now = Instant::now();
        self.created_at = now;
        self.last_activity = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_idempotent() {
        let mut room = Room::default();
        room.open("lobby");
        assert!(room.join(ClientId::new("a")));
        assert!(!room.join(ClientId::new("a")));
        assert_eq!(room.len(), 1);
        assert!(room.contains(&ClientId::new("a")));
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut room = Room::default();
        room.open("lobby");
        room.join(ClientId::new("a"));
        assert!(room.leave(&ClientId::new("a")));
        assert!(!room.leave(&ClientId::new("a")));
        assert!(room.is_empty());
    }

    #[test]
    fn test_open_resets_membership() {
        let mut room = Room::default();
        room.open("lobby");
        room.join(ClientId::new("a"));
        room.join(ClientId::new("b"));

        room.open("lobby");
        assert!(room.is_empty());
        assert_eq!(room.id(), "lobby");
    }

    #[test]
    fn test_reset_zeroes_state() {
        let mut room = Room::default();
        room.open("lobby");
        room.join(ClientId::new("a"));

        room.reset();
        assert_eq!(room.id(), "");
        assert!(room.is_empty());
    }
}
