use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use teamwire_models::gateway::{EVENT_THREAD_SUMMARY_UPDATED, EVENT_THREAD_TYPING};
use teamwire_models::room::RoomKey;
use teamwire_models::thread::{ThreadSummary, ThreadSummaryUpdated, ThreadTyping};
use teamwire_models::MessageId;

use crate::fanout::{FanoutEngine, PublishReceipt, RoomEvent};
use crate::registry::Caller;

/// Reply counts and last-reply times per parent message, plus the typing relay.
pub struct ThreadAggregator {
    summaries: DashMap<MessageId, ThreadSummary>,
    fanout: Arc<FanoutEngine>,
}

impl ThreadAggregator {
    pub fn new(fanout: Arc<FanoutEngine>) -> Self {
        Self {
            summaries: DashMap::new(),
            fanout,
        }
    }

    /// Count one reply. `posted_in` is the room the reply was published to; it gets
    /// the summary update along with the thread-watch room.
    pub fn on_thread_reply(
        &self,
        parent_id: MessageId,
        child_created_at: DateTime<Utc>,
        posted_in: Option<RoomKey>,
    ) -> ThreadSummary {
        // Updates are published under the parent's entry guard so every watcher sees
        // reply counts in the order they were taken.
        let mut entry = self.summaries.entry(parent_id).or_default();
        entry.reply_count += 1;
        if entry
            .last_reply_at
            .is_none_or(|last| child_created_at > last)
        {
            entry.last_reply_at = Some(child_created_at);
        }
        let summary = *entry;

        let update = ThreadSummaryUpdated {
            parent_id,
            reply_count: summary.reply_count,
            last_reply_at: summary.last_reply_at,
        };
        match serde_json::to_value(&update) {
            Ok(payload) => {
                let thread_room = RoomKey::Thread(parent_id);
                self.fanout.publish(
                    thread_room,
                    RoomEvent::new(EVENT_THREAD_SUMMARY_UPDATED, payload.clone()),
                );
                if let Some(room) = posted_in.filter(|room| *room != thread_room) {
                    self.fanout
                        .publish(room, RoomEvent::new(EVENT_THREAD_SUMMARY_UPDATED, payload));
                }
            }
            Err(e) => tracing::error!(parent_id, "failed to encode thread summary: {e}"),
        }
        drop(entry);
        summary
    }

    /// Relay a typing indicator to the thread-watch room. Nothing is stored and
    /// nothing expires; clients send `is_typing = false` themselves.
    pub fn set_typing(&self, caller: Caller, parent_id: MessageId, is_typing: bool) -> PublishReceipt {
        let typing = ThreadTyping {
            parent_id,
            user_id: caller.user_id,
            is_typing,
        };
        let payload = match serde_json::to_value(&typing) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(parent_id, user_id = caller.user_id, "failed to encode typing indicator: {e}");
                return PublishReceipt {
                    sequence: None,
                    delivered: 0,
                };
            }
        };
        self.fanout.publish(
            RoomKey::Thread(parent_id),
            RoomEvent::new(EVENT_THREAD_TYPING, payload).excluding(caller.connection_id),
        )
    }

    pub fn summary(&self, parent_id: MessageId) -> ThreadSummary {
        self.summaries
            .get(&parent_id)
            .map(|s| *s)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, EventBus};
    use crate::member_index::MemberIndex;
    use crate::registry::ConnectionRegistry;
    use crate::rooms::RoomDirectory;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use teamwire_util::snowflake::Snowflake;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<RoomDirectory>, Arc<ThreadAggregator>) {
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(Snowflake::new(1)),
            EventBus::new(16),
            8,
        ));
        let directory = Arc::new(RoomDirectory::new(64));
        let fanout = Arc::new(FanoutEngine::new(
            registry.clone(),
            directory.clone(),
            Arc::new(MemberIndex::empty()),
            50,
            Duration::from_secs(1),
        ));
        (registry, directory, Arc::new(ThreadAggregator::new(fanout)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replies_converge() {
        let (_registry, _directory, threads) = setup();
        let base = Utc::now();
        let mut tasks = Vec::new();
        for i in 0..64 {
            let threads = threads.clone();
            tasks.push(tokio::spawn(async move {
                threads.on_thread_reply(9, base + ChronoDuration::milliseconds(i), None);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let summary = threads.summary(9);
        assert_eq!(summary.reply_count, 64);
        assert_eq!(summary.last_reply_at, Some(base + ChronoDuration::milliseconds(63)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn watchers_never_see_reply_count_go_backwards() {
        let (registry, directory, threads) = setup();
        let (tx_thread, mut rx_thread) = event_channel();
        let (tx_channel, mut rx_channel) = event_channel();
        let watcher = registry.register(1, tx_thread).unwrap();
        let reader = registry.register(2, tx_channel).unwrap();
        directory.subscribe(watcher.id, RoomKey::Thread(9)).unwrap();
        directory.subscribe(reader.id, RoomKey::Channel(3)).unwrap();

        let base = Utc::now();
        let mut tasks = Vec::new();
        for worker in 0..8i64 {
            let threads = threads.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..64i64 {
                    let at = base + ChronoDuration::milliseconds(worker * 64 + n);
                    threads.on_thread_reply(9, at, Some(RoomKey::Channel(3)));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for rx in [&mut rx_thread, &mut rx_channel] {
            let mut last = 0;
            let mut seen = 0;
            while let Ok(event) = rx.try_recv() {
                let count = event.payload["replyCount"].as_u64().unwrap();
                assert!(count > last, "replyCount went from {last} to {count}");
                last = count;
                seen += 1;
            }
            assert_eq!(seen, 512);
            assert_eq!(last, 512);
        }
    }

    #[test]
    fn older_reply_does_not_rewind_last_reply_at() {
        let (_registry, _directory, threads) = setup();
        let now = Utc::now();
        threads.on_thread_reply(9, now, None);
        let summary = threads.on_thread_reply(9, now - ChronoDuration::minutes(1), None);
        assert_eq!(summary.reply_count, 2);
        assert_eq!(summary.last_reply_at, Some(now));
    }

    #[test]
    fn summary_goes_to_thread_and_parent_rooms() {
        let (registry, directory, threads) = setup();
        let (tx_thread, mut rx_thread) = event_channel();
        let (tx_channel, mut rx_channel) = event_channel();
        let watcher = registry.register(1, tx_thread).unwrap();
        let reader = registry.register(2, tx_channel).unwrap();
        directory.subscribe(watcher.id, RoomKey::Thread(9)).unwrap();
        directory.subscribe(reader.id, RoomKey::Channel(3)).unwrap();

        threads.on_thread_reply(9, Utc::now(), Some(RoomKey::Channel(3)));
        let a = rx_thread.try_recv().unwrap();
        let b = rx_channel.try_recv().unwrap();
        assert_eq!(a.event_type, EVENT_THREAD_SUMMARY_UPDATED);
        assert_eq!(b.payload["replyCount"], 1);
        assert_eq!(b.payload["parentId"], "9");
    }

    #[test]
    fn typing_skips_the_typist() {
        let (registry, directory, threads) = setup();
        let (tx_a, mut rx_a) = event_channel();
        let (tx_b, mut rx_b) = event_channel();
        let a = registry.register(1, tx_a).unwrap();
        let b = registry.register(2, tx_b).unwrap();
        directory.subscribe(a.id, RoomKey::Thread(9)).unwrap();
        directory.subscribe(b.id, RoomKey::Thread(9)).unwrap();

        let receipt = threads.set_typing(a.caller(), 9, true);
        assert_eq!(receipt.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        let event = rx_b.try_recv().unwrap();
        assert_eq!(event.payload["isTyping"], true);
        assert_eq!(event.payload["userId"], "1");
    }
}
