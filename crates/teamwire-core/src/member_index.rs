use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use teamwire_models::room::{RoomKey, RoomKind, Role};
use teamwire_models::{ChannelId, MessageId, UserId};

use crate::collaborators::{AuthorizationStore, CollaboratorError, ReadStateStore};

struct RoomEntry {
    kind: RoomKind,
    members: HashSet<UserId>,
}

/// In-memory directory: Room -> (kind, Set<UserId>), plus roles and read cursors.
/// Seeded from configuration at start-up; stands in for the durable store in
/// single-node deployments and tests.
#[derive(Default)]
pub struct MemberIndex {
    rooms: DashMap<RoomKey, RoomEntry>,
    /// Thread parent -> room the parent message lives in. Thread access follows it.
    threads: DashMap<MessageId, RoomKey>,
    roles: DashMap<(ChannelId, UserId), Role>,
    cursors: DashMap<(UserId, RoomKey), DateTime<Utc>>,
}

impl MemberIndex {
    /// Create an empty index (useful for tests).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn add_room(&self, room: RoomKey, kind: RoomKind) {
        self.rooms.entry(room).or_insert_with(|| RoomEntry {
            kind,
            members: HashSet::new(),
        });
    }

    /// Register a thread rooted at `parent_id` inside `room`.
    pub fn add_thread(&self, parent_id: MessageId, room: RoomKey) {
        self.threads.insert(parent_id, room);
    }

    /// Track a new member. Unknown rooms are ignored.
    pub fn add_member(&self, room: RoomKey, user_id: UserId) {
        if let Some(mut entry) = self.rooms.get_mut(&room) {
            entry.members.insert(user_id);
        }
    }

    pub fn remove_member(&self, room: RoomKey, user_id: UserId) {
        if let Some(mut entry) = self.rooms.get_mut(&room) {
            entry.members.remove(&user_id);
        }
    }

    /// Drop an entire room and its threads.
    pub fn remove_room(&self, room: RoomKey) {
        self.rooms.remove(&room);
        self.threads.retain(|_, parent_room| *parent_room != room);
    }

    pub fn set_role(&self, channel_id: ChannelId, user_id: UserId, role: Role) {
        self.roles.insert((channel_id, user_id), role);
    }

    pub fn cursor(&self, user_id: UserId, room: &RoomKey) -> Option<DateTime<Utc>> {
        self.cursors.get(&(user_id, *room)).map(|c| *c)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Threads resolve to the room their parent lives in.
    fn resolve(&self, room: &RoomKey) -> Option<RoomKey> {
        match room {
            RoomKey::Thread(parent_id) => self.threads.get(parent_id).map(|r| *r),
            other => Some(*other),
        }
    }
}

#[async_trait]
impl AuthorizationStore for MemberIndex {
    async fn room_kind(&self, room: &RoomKey) -> Result<Option<RoomKind>, CollaboratorError> {
        if room.is_thread() {
            return Ok(self.resolve(room).map(|_| RoomKind::Thread));
        }
        Ok(self.rooms.get(room).map(|entry| entry.kind))
    }

    async fn is_member(&self, user_id: UserId, room: &RoomKey) -> Result<bool, CollaboratorError> {
        let Some(resolved) = self.resolve(room) else {
            return Ok(false);
        };
        Ok(self
            .rooms
            .get(&resolved)
            .is_some_and(|entry| entry.members.contains(&user_id)))
    }

    async fn role_of(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
    ) -> Result<Role, CollaboratorError> {
        Ok(self
            .roles
            .get(&(channel_id, user_id))
            .map(|r| *r)
            .unwrap_or(Role::Member))
    }

    async fn thread_room(&self, parent_id: MessageId) -> Result<Option<RoomKey>, CollaboratorError> {
        Ok(self.threads.get(&parent_id).map(|r| *r))
    }
}

#[async_trait]
impl ReadStateStore for MemberIndex {
    async fn save_cursor(
        &self,
        user_id: UserId,
        room: &RoomKey,
        read_at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        let mut cursor = self.cursors.entry((user_id, *room)).or_insert(read_at);
        if read_at > *cursor {
            *cursor = read_at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn thread_access_follows_parent_room() {
        let index = MemberIndex::empty();
        index.add_room(RoomKey::Channel(1), RoomKind::Text);
        index.add_member(RoomKey::Channel(1), 7);
        index.add_thread(100, RoomKey::Channel(1));

        let thread = RoomKey::Thread(100);
        assert_eq!(index.room_kind(&thread).await.unwrap(), Some(RoomKind::Thread));
        assert!(index.is_member(7, &thread).await.unwrap());
        assert!(!index.is_member(8, &thread).await.unwrap());
        assert_eq!(index.room_kind(&RoomKey::Thread(101)).await.unwrap(), None);
        assert_eq!(index.thread_room(100).await.unwrap(), Some(RoomKey::Channel(1)));
        assert_eq!(index.thread_room(101).await.unwrap(), None);
    }

    #[tokio::test]
    async fn removing_a_room_drops_its_threads() {
        let index = MemberIndex::empty();
        index.add_room(RoomKey::Channel(1), RoomKind::Text);
        index.add_thread(100, RoomKey::Channel(1));
        index.remove_room(RoomKey::Channel(1));
        assert_eq!(index.room_kind(&RoomKey::Thread(100)).await.unwrap(), None);
        assert_eq!(index.room_count(), 0);
    }

    #[tokio::test]
    async fn roles_default_to_member() {
        let index = MemberIndex::empty();
        index.set_role(5, 1, Role::Host);
        assert_eq!(index.role_of(1, 5).await.unwrap(), Role::Host);
        assert_eq!(index.role_of(2, 5).await.unwrap(), Role::Member);
    }

    #[tokio::test]
    async fn saved_cursor_never_moves_back() {
        let index = MemberIndex::empty();
        let room = RoomKey::Dm(3);
        let t1 = Utc::now();
        index.save_cursor(1, &room, t1).await.unwrap();
        index
            .save_cursor(1, &room, t1 - Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(index.cursor(1, &room), Some(t1));
    }
}
