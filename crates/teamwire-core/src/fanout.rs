use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use teamwire_models::gateway::EVENT_READ_RECEIPT;
use teamwire_models::message::ReadReceipt;
use teamwire_models::room::RoomKey;
use teamwire_models::{ConnectionId, UserId};

use crate::collaborators::{bounded, ReadStateStore};
use crate::error::CoreError;
use crate::events::ServerEvent;
use crate::registry::{Caller, ConnectionRegistry};
use crate::rooms::RoomDirectory;

/// One unit of room activity that counts toward unread totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activity {
    pub author_id: UserId,
    pub at: DateTime<Utc>,
}

/// An event to publish into a room.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub event_type: &'static str,
    pub payload: serde_json::Value,
    pub activity: Option<Activity>,
    /// Connection that should not get its own event back.
    pub exclude: Option<ConnectionId>,
}

impl RoomEvent {
    pub fn new(event_type: &'static str, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            activity: None,
            exclude: None,
        }
    }

    pub fn with_activity(mut self, author_id: UserId, at: DateTime<Utc>) -> Self {
        self.activity = Some(Activity { author_id, at });
        self
    }

    pub fn excluding(mut self, connection_id: ConnectionId) -> Self {
        self.exclude = Some(connection_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// `None` when nobody was listening.
    pub sequence: Option<u64>,
    pub delivered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadState {
    pub cursor: DateTime<Utc>,
    pub unread: u64,
    /// Whether this call moved the cursor forward.
    pub advanced: bool,
}

#[derive(Default)]
struct RoomLog {
    sequence: u64,
    activity: VecDeque<Activity>,
    /// Users whose unread counter for this room is maintained.
    readers: HashSet<UserId>,
}

impl RoomLog {
    fn record(&mut self, activity: Activity, window: usize) {
        self.activity.push_back(activity);
        while self.activity.len() > window {
            self.activity.pop_front();
        }
    }

    fn unread_for(&self, user_id: UserId, cursor: Option<DateTime<Utc>>) -> u64 {
        self.activity
            .iter()
            .filter(|a| a.author_id != user_id)
            .filter(|a| cursor.is_none_or(|c| a.at > c))
            .count() as u64
    }
}

/// Room fan-out with per-room ordering, plus read cursors and unread counters.
///
/// The room log's entry guard is the room's critical section: subscriber snapshot,
/// sequence assignment and delivery all happen under it, so every subscriber sees a
/// room's events in one order. Guards are taken logs -> cursors -> unread.
pub struct FanoutEngine {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<RoomDirectory>,
    logs: DashMap<RoomKey, RoomLog>,
    cursors: DashMap<(UserId, RoomKey), DateTime<Utc>>,
    unread: DashMap<(UserId, RoomKey), u64>,
    store: Arc<dyn ReadStateStore>,
    activity_window: usize,
    timeout: Duration,
}

impl FanoutEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<RoomDirectory>,
        store: Arc<dyn ReadStateStore>,
        activity_window: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            logs: DashMap::new(),
            cursors: DashMap::new(),
            unread: DashMap::new(),
            store,
            activity_window: activity_window.max(1),
            timeout,
        }
    }

    /// Deliver `event` once to every connection currently subscribed to `room`.
    pub fn publish(&self, room: RoomKey, event: RoomEvent) -> PublishReceipt {
        let mut log = self.logs.entry(room).or_default();
        self.publish_locked(&mut log, room, event)
    }

    /// Body of [`publish`](Self::publish) for callers already inside the room's
    /// critical section.
    fn publish_locked(&self, log: &mut RoomLog, room: RoomKey, event: RoomEvent) -> PublishReceipt {
        let subscribers = self.directory.subscribers_of(&room);

        if let Some(activity) = event.activity {
            log.record(activity, self.activity_window);
            for connection_id in &subscribers {
                if let Some(connection) = self.registry.get(*connection_id) {
                    log.readers.insert(connection.user_id);
                }
            }
            for user_id in log.readers.iter().copied() {
                self.recount(log, user_id, room);
            }
        }

        if subscribers.is_empty() {
            return PublishReceipt {
                sequence: None,
                delivered: 0,
            };
        }

        log.sequence += 1;
        let sequence = log.sequence;
        let payload = Arc::new(event.payload);
        let mut delivered = 0;
        for connection_id in subscribers {
            if event.exclude == Some(connection_id) {
                continue;
            }
            let sent = self.registry.send_to(
                connection_id,
                ServerEvent {
                    event_type: event.event_type,
                    payload: payload.clone(),
                    room: Some(room),
                    sequence: Some(sequence),
                },
            );
            if sent {
                delivered += 1;
            }
        }
        tracing::trace!(room = %room, sequence, delivered, event = event.event_type, "published");
        PublishReceipt {
            sequence: Some(sequence),
            delivered,
        }
    }

    /// Move the caller's cursor to `max(current, read_at)`. The durable write happens
    /// first; if it fails nothing changes here. A read receipt goes to the room's other
    /// subscribers only when the cursor advanced.
    pub async fn mark_read(
        &self,
        caller: Caller,
        room: RoomKey,
        read_at: DateTime<Utc>,
    ) -> Result<ReadState, CoreError> {
        let user_id = caller.user_id;
        if let Some(current) = self.cursor(user_id, &room) {
            if read_at <= current {
                return Ok(ReadState {
                    cursor: current,
                    unread: self.unread_count(user_id, &room),
                    advanced: false,
                });
            }
        }

        bounded(
            "read-state store",
            self.timeout,
            self.store.save_cursor(user_id, &room, read_at),
        )
        .await?;

        // Receipts go out inside the room's critical section, so watchers see a user's
        // cursor only ever move forward.
        let mut log = self.logs.entry(room).or_default();
        log.readers.insert(user_id);
        let (cursor, advanced) = match self.cursors.entry((user_id, room)) {
            Entry::Occupied(mut current) => {
                if read_at > *current.get() {
                    current.insert(read_at);
                    (read_at, true)
                } else {
                    (*current.get(), false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(read_at);
                (read_at, true)
            }
        };
        let unread = self.recount(&log, user_id, room);
        let state = ReadState {
            cursor,
            unread,
            advanced,
        };

        if state.advanced {
            let receipt = ReadReceipt {
                user_id,
                room_id: room,
                read_at: state.cursor,
            };
            match serde_json::to_value(&receipt) {
                Ok(payload) => {
                    self.publish_locked(
                        &mut log,
                        room,
                        RoomEvent::new(EVENT_READ_RECEIPT, payload).excluding(caller.connection_id),
                    );
                }
                Err(e) => tracing::error!(user_id, room = %room, "failed to encode read receipt: {e}"),
            }
        }
        Ok(state)
    }

    /// Start maintaining `user_id`'s unread counter for `room`, counting the activity
    /// already in the window. Called when a member joins the room.
    pub fn track_reader(&self, user_id: UserId, room: RoomKey) -> u64 {
        let mut log = self.logs.entry(room).or_default();
        log.readers.insert(user_id);
        self.recount(&log, user_id, room)
    }

    pub fn cursor(&self, user_id: UserId, room: &RoomKey) -> Option<DateTime<Utc>> {
        self.cursors.get(&(user_id, *room)).map(|c| *c)
    }

    pub fn unread_count(&self, user_id: UserId, room: &RoomKey) -> u64 {
        self.unread.get(&(user_id, *room)).map(|n| *n).unwrap_or(0)
    }

    /// Current sequence of a room (0 before the first delivery).
    pub fn sequence(&self, room: &RoomKey) -> u64 {
        self.logs.get(room).map(|log| log.sequence).unwrap_or(0)
    }

    /// Drop all room logs and counters. Used on shutdown.
    pub fn clear(&self) {
        self.logs.clear();
        self.unread.clear();
        self.cursors.clear();
    }

    fn recount(&self, log: &RoomLog, user_id: UserId, room: RoomKey) -> u64 {
        let cursor = self.cursor(user_id, &room);
        let count = log.unread_for(user_id, cursor);
        self.unread.insert((user_id, room), count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use crate::events::{event_channel, EventBus, EventStream};
    use crate::member_index::MemberIndex;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use teamwire_util::snowflake::Snowflake;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        directory: Arc<RoomDirectory>,
        fanout: FanoutEngine,
    }

    fn harness_with(store: Arc<dyn ReadStateStore>) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(Snowflake::new(1)),
            EventBus::new(16),
            8,
        ));
        let directory = Arc::new(RoomDirectory::new(64));
        let fanout = FanoutEngine::new(
            registry.clone(),
            directory.clone(),
            store,
            100,
            Duration::from_secs(1),
        );
        Harness {
            registry,
            directory,
            fanout,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemberIndex::empty()))
    }

    impl Harness {
        fn connect(&self, user_id: UserId, room: Option<RoomKey>) -> (Caller, EventStream) {
            let (tx, rx) = event_channel();
            let caller = self.registry.register(user_id, tx).unwrap().caller();
            if let Some(room) = room {
                self.directory.subscribe(caller.connection_id, room).unwrap();
            }
            (caller, rx)
        }
    }

    fn drain(rx: &mut EventStream) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn deliveries_follow_publish_order() {
        let h = harness();
        let room = RoomKey::Channel(1);
        let (_a, mut a_rx) = h.connect(1, Some(room));
        let (_b, mut b_rx) = h.connect(2, Some(room));

        for n in 0..3 {
            let receipt = h.fanout.publish(room, RoomEvent::new("message", json!({ "n": n })));
            assert_eq!(receipt.delivered, 2);
        }
        for rx in [&mut a_rx, &mut b_rx] {
            let events = drain(rx);
            let seqs: Vec<_> = events.iter().map(|e| e.sequence.unwrap()).collect();
            let ns: Vec<_> = events.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
            assert_eq!(seqs, vec![1, 2, 3]);
            assert_eq!(ns, vec![0, 1, 2]);
        }
    }

    #[test]
    fn late_joiner_misses_earlier_events() {
        let h = harness();
        let room = RoomKey::Channel(1);
        let (_a, _a_rx) = h.connect(1, Some(room));
        h.fanout.publish(room, RoomEvent::new("message", json!({ "n": 1 })));
        let (_b, mut b_rx) = h.connect(2, Some(room));
        h.fanout.publish(room, RoomEvent::new("message", json!({ "n": 2 })));

        let events = drain(&mut b_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["n"], 2);
    }

    #[test]
    fn empty_room_publish_is_a_noop() {
        let h = harness();
        let receipt = h.fanout.publish(RoomKey::Dm(4), RoomEvent::new("message", json!({})));
        assert_eq!(receipt, PublishReceipt { sequence: None, delivered: 0 });
        assert_eq!(h.fanout.sequence(&RoomKey::Dm(4)), 0);
    }

    #[test]
    fn authors_do_not_accrue_unread() {
        let h = harness();
        let room = RoomKey::Channel(1);
        let (_a, _a_rx) = h.connect(1, Some(room));
        let (_b, _b_rx) = h.connect(2, Some(room));
        let now = Utc::now();
        h.fanout.publish(room, RoomEvent::new("message", json!({})).with_activity(1, now));
        h.fanout.publish(room, RoomEvent::new("message", json!({})).with_activity(1, now));
        assert_eq!(h.fanout.unread_count(1, &room), 0);
        assert_eq!(h.fanout.unread_count(2, &room), 2);
    }

    #[tokio::test]
    async fn cursor_never_moves_back() {
        let h = harness();
        let room = RoomKey::Channel(1);
        let (a, _a_rx) = h.connect(1, Some(room));
        let t1 = Utc::now();
        let first = h.fanout.mark_read(a, room, t1).await.unwrap();
        assert!(first.advanced);
        let second = h
            .fanout
            .mark_read(a, room, t1 - ChronoDuration::seconds(5))
            .await
            .unwrap();
        assert!(!second.advanced);
        assert_eq!(h.fanout.cursor(1, &room), Some(t1));
    }

    #[tokio::test]
    async fn mark_read_recounts_and_notifies_others() {
        let h = harness();
        let room = RoomKey::Channel(1);
        let (a, mut a_rx) = h.connect(1, Some(room));
        let (_b, mut b_rx) = h.connect(2, Some(room));
        let base = Utc::now();
        for i in 0..3 {
            h.fanout.publish(
                room,
                RoomEvent::new("message", json!({})).with_activity(2, base + ChronoDuration::seconds(i)),
            );
        }
        assert_eq!(h.fanout.unread_count(1, &room), 3);
        drain(&mut a_rx);
        drain(&mut b_rx);

        let state = h
            .fanout
            .mark_read(a, room, base + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(state.unread, 1);
        assert!(drain(&mut a_rx).is_empty());
        let receipts = drain(&mut b_rx);
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].event_type, EVENT_READ_RECEIPT);
        assert_eq!(receipts[0].payload["userId"], "1");
    }

    #[test]
    fn members_who_join_late_count_earlier_activity() {
        let h = harness();
        let room = RoomKey::Channel(1);
        let now = Utc::now();
        for i in 0..3 {
            h.fanout.publish(
                room,
                RoomEvent::new("message", json!({})).with_activity(2, now + ChronoDuration::seconds(i)),
            );
        }
        assert_eq!(h.fanout.unread_count(1, &room), 0);

        assert_eq!(h.fanout.track_reader(1, room), 3);
        assert_eq!(h.fanout.unread_count(1, &room), 3);
        assert_eq!(h.fanout.track_reader(2, room), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_receipts_reach_watchers_in_cursor_order() {
        let h = Arc::new(harness());
        let room = RoomKey::Channel(1);
        let (_watcher, mut watcher_rx) = h.connect(9, Some(room));
        let devices: Vec<Caller> = (0..4).map(|_| h.connect(1, Some(room)).0).collect();
        let base = Utc::now();

        let mut tasks = Vec::new();
        for (n, device) in devices.into_iter().enumerate() {
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let at = base + ChronoDuration::milliseconds((i * 4 + n) as i64);
                    h.fanout.mark_read(device, room, at).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let receipts: Vec<String> = drain(&mut watcher_rx)
            .into_iter()
            .filter(|e| e.event_type == EVENT_READ_RECEIPT)
            .map(|e| e.payload["readAt"].as_str().unwrap().to_string())
            .collect();
        assert!(!receipts.is_empty());
        let parsed: Vec<DateTime<Utc>> = receipts.iter().map(|r| r.parse().unwrap()).collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(parsed.last().copied(), h.fanout.cursor(1, &room));
    }

    struct FailingStore;

    #[async_trait]
    impl ReadStateStore for FailingStore {
        async fn save_cursor(
            &self,
            _user_id: UserId,
            _room: &RoomKey,
            _read_at: DateTime<Utc>,
        ) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::Unavailable("store offline".into()))
        }
    }

    #[tokio::test]
    async fn failed_persist_leaves_cursor_untouched() {
        let h = harness_with(Arc::new(FailingStore));
        let room = RoomKey::Channel(1);
        let (a, _a_rx) = h.connect(1, Some(room));
        let (_b, mut b_rx) = h.connect(2, Some(room));
        h.fanout
            .publish(room, RoomEvent::new("message", json!({})).with_activity(2, Utc::now()));
        drain(&mut b_rx);

        let err = h.fanout.mark_read(a, room, Utc::now()).await.unwrap_err();
        assert!(matches!(err, CoreError::Collaborator(_)));
        assert_eq!(h.fanout.cursor(1, &room), None);
        assert_eq!(h.fanout.unread_count(1, &room), 1);
        assert!(drain(&mut b_rx).is_empty());
    }
}
