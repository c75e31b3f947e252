use std::collections::HashSet;

use dashmap::DashMap;
use teamwire_models::room::RoomKey;
use teamwire_models::ConnectionId;

use crate::error::CoreError;

/// Which live connections listen to which rooms. Subscriptions are transient;
/// durable membership is checked by the caller before [`RoomDirectory::subscribe`].
///
/// Lock order is always `by_connection` then `rooms`, and no two guards of the same
/// map are held at once.
pub struct RoomDirectory {
    rooms: DashMap<RoomKey, HashSet<ConnectionId>>,
    by_connection: DashMap<ConnectionId, HashSet<RoomKey>>,
    max_rooms_per_connection: usize,
}

impl RoomDirectory {
    pub fn new(max_rooms_per_connection: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            by_connection: DashMap::new(),
            max_rooms_per_connection: max_rooms_per_connection.max(1),
        }
    }

    /// Returns false when the connection was already subscribed.
    pub fn subscribe(&self, connection_id: ConnectionId, room: RoomKey) -> Result<bool, CoreError> {
        let mut joined = self.by_connection.entry(connection_id).or_default();
        if joined.contains(&room) {
            return Ok(false);
        }
        if joined.len() >= self.max_rooms_per_connection {
            return Err(CoreError::Conflict(format!(
                "connection is subscribed to the maximum of {} rooms",
                self.max_rooms_per_connection
            )));
        }
        joined.insert(room);
        self.rooms.entry(room).or_default().insert(connection_id);
        Ok(true)
    }

    /// Returns false when the connection was not subscribed.
    pub fn unsubscribe(&self, connection_id: ConnectionId, room: &RoomKey) -> bool {
        let removed = {
            let Some(mut joined) = self.by_connection.get_mut(&connection_id) else {
                return false;
            };
            let removed = joined.remove(room);
            if removed {
                self.detach(connection_id, room);
            }
            removed
        };
        self.by_connection
            .remove_if(&connection_id, |_, joined| joined.is_empty());
        removed
    }

    /// Drop every subscription of a connection. Returns the rooms it was in.
    pub fn leave_all(&self, connection_id: ConnectionId) -> Vec<RoomKey> {
        let Some((_, joined)) = self.by_connection.remove(&connection_id) else {
            return Vec::new();
        };
        for room in &joined {
            self.detach(connection_id, room);
        }
        if !joined.is_empty() {
            tracing::debug!(connection_id, rooms = joined.len(), "dropped room subscriptions");
        }
        joined.into_iter().collect()
    }

    pub fn subscribers_of(&self, room: &RoomKey) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomKey> {
        self.by_connection
            .get(&connection_id)
            .map(|joined| joined.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, connection_id: ConnectionId, room: &RoomKey) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|subs| subs.contains(&connection_id))
    }

    /// Number of rooms with at least one listener.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn detach(&self, connection_id: ConnectionId, room: &RoomKey) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut subs) => {
                subs.remove(&connection_id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, subs| subs.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_idempotent() {
        let dir = RoomDirectory::new(10);
        assert!(dir.subscribe(1, RoomKey::Channel(5)).unwrap());
        assert!(!dir.subscribe(1, RoomKey::Channel(5)).unwrap());
        assert_eq!(dir.subscribers_of(&RoomKey::Channel(5)), vec![1]);
    }

    #[test]
    fn leave_all_removes_every_subscription() {
        let dir = RoomDirectory::new(10);
        dir.subscribe(1, RoomKey::Channel(5)).unwrap();
        dir.subscribe(1, RoomKey::Thread(9)).unwrap();
        dir.subscribe(2, RoomKey::Channel(5)).unwrap();

        let mut left = dir.leave_all(1);
        left.sort();
        assert_eq!(left, vec![RoomKey::Channel(5), RoomKey::Thread(9)]);
        assert_eq!(dir.subscribers_of(&RoomKey::Channel(5)), vec![2]);
        assert!(dir.subscribers_of(&RoomKey::Thread(9)).is_empty());
        assert!(dir.rooms_of(1).is_empty());
        assert_eq!(dir.room_count(), 1);
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let dir = RoomDirectory::new(10);
        dir.subscribe(1, RoomKey::Dm(3)).unwrap();
        assert!(dir.unsubscribe(1, &RoomKey::Dm(3)));
        assert!(!dir.unsubscribe(1, &RoomKey::Dm(3)));
        assert_eq!(dir.room_count(), 0);
        assert!(dir.rooms_of(1).is_empty());
    }

    #[test]
    fn subscription_cap() {
        let dir = RoomDirectory::new(2);
        dir.subscribe(1, RoomKey::Channel(1)).unwrap();
        dir.subscribe(1, RoomKey::Channel(2)).unwrap();
        assert!(matches!(
            dir.subscribe(1, RoomKey::Channel(3)),
            Err(CoreError::Conflict(_))
        ));
        // Re-joining an existing room is still fine at the cap.
        assert!(!dir.subscribe(1, RoomKey::Channel(2)).unwrap());
    }
}
