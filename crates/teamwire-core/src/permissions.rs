use std::sync::Arc;
use std::time::Duration;

use teamwire_models::room::{RoomKey, RoomKind, Role};
use teamwire_models::{ChannelId, MessageId, UserId};

use crate::collaborators::{bounded, retry_read, AuthorizationStore};
use crate::error::CoreError;

/// Cache key for membership answers: (user_id, room).
pub type MembershipCacheKey = (UserId, RoomKey);

/// Build a membership cache with the given TTL and 10k max entries.
pub fn build_membership_cache(ttl: Duration) -> moka::future::Cache<MembershipCacheKey, bool> {
    moka::future::Cache::builder()
        .max_capacity(10_000)
        .time_to_live(ttl)
        .support_invalidation_closures()
        .build()
}

/// Authorization checks against the external store: deadline-bounded, retried on
/// transient failure, with room kinds and membership cached for a short TTL.
/// Roles are not cached; elevated actions always see the store's current answer.
pub struct Authorization {
    store: Arc<dyn AuthorizationStore>,
    membership: moka::future::Cache<MembershipCacheKey, bool>,
    kinds: moka::future::Cache<RoomKey, Option<RoomKind>>,
    timeout: Duration,
    attempts: u32,
}

impl Authorization {
    pub fn new(
        store: Arc<dyn AuthorizationStore>,
        cache_ttl: Duration,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            store,
            membership: build_membership_cache(cache_ttl),
            kinds: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(cache_ttl)
                .build(),
            timeout,
            attempts,
        }
    }

    pub async fn room_kind(&self, room: &RoomKey) -> Result<Option<RoomKind>, CoreError> {
        if let Some(kind) = self.kinds.get(room).await {
            return Ok(kind);
        }
        let kind = retry_read("authorization store", self.attempts, || {
            bounded("authorization store", self.timeout, self.store.room_kind(room))
        })
        .await?;
        self.kinds.insert(*room, kind).await;
        Ok(kind)
    }

    pub async fn is_member(&self, user_id: UserId, room: &RoomKey) -> Result<bool, CoreError> {
        let key = (user_id, *room);
        if let Some(member) = self.membership.get(&key).await {
            return Ok(member);
        }
        let member = retry_read("authorization store", self.attempts, || {
            bounded("authorization store", self.timeout, self.store.is_member(user_id, room))
        })
        .await?;
        self.membership.insert(key, member).await;
        Ok(member)
    }

    /// `NotFound` for unknown rooms, `Authorization` for non-members. Returns the room kind.
    pub async fn ensure_member(&self, user_id: UserId, room: &RoomKey) -> Result<RoomKind, CoreError> {
        let kind = self
            .room_kind(room)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("room {room}")))?;
        if !self.is_member(user_id, room).await? {
            return Err(CoreError::Authorization(format!(
                "user {user_id} is not a member of {room}"
            )));
        }
        Ok(kind)
    }

    /// A reply posted in `room` may only target a thread rooted in that same room, and
    /// the author must be able to see the thread.
    pub async fn ensure_thread_of(
        &self,
        user_id: UserId,
        parent_id: MessageId,
        room: &RoomKey,
    ) -> Result<(), CoreError> {
        let thread = RoomKey::Thread(parent_id);
        let home = retry_read("authorization store", self.attempts, || {
            bounded("authorization store", self.timeout, self.store.thread_room(parent_id))
        })
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("room {thread}")))?;
        if home != *room {
            return Err(CoreError::Authorization(format!(
                "{thread} does not belong to {room}"
            )));
        }
        self.ensure_member(user_id, &thread).await?;
        Ok(())
    }

    pub async fn role_of(&self, user_id: UserId, channel_id: ChannelId) -> Result<Role, CoreError> {
        retry_read("authorization store", self.attempts, || {
            bounded("authorization store", self.timeout, self.store.role_of(user_id, channel_id))
        })
        .await
    }

    /// Check if the user holds a host or owner role, returning error if not
    pub async fn require_elevated(&self, user_id: UserId, channel_id: ChannelId) -> Result<(), CoreError> {
        let role = self.role_of(user_id, channel_id).await?;
        if !role.is_elevated() {
            return Err(CoreError::Authorization(format!(
                "user {user_id} needs a host role in channel {channel_id}"
            )));
        }
        Ok(())
    }

    /// Forget cached answers for a room, e.g. after a membership change.
    pub async fn invalidate_room(&self, room: &RoomKey) {
        self.kinds.invalidate(room).await;
        let room = *room;
        // Membership entries are keyed by user; sweep the ones for this room.
        let _ = self
            .membership
            .invalidate_entries_if(move |key: &MembershipCacheKey, _: &bool| key.1 == room);
    }
}
