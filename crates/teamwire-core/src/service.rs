use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use teamwire_models::gateway::{PublishMessage, EVENT_MESSAGE};
use teamwire_models::message::MessageEvent;
use teamwire_models::presence::PresenceStatus;
use teamwire_models::room::RoomKey;
use teamwire_models::thread::ThreadSummary;
use teamwire_models::MessageId;
use teamwire_util::snowflake::Snowflake;
use teamwire_util::validation::validate_message_payload;
use tokio::sync::Notify;

use crate::collaborators::{bounded, AuthVerifier, AuthorizationStore, MediaEngine, ReadStateStore};
use crate::error::CoreError;
use crate::events::{event_channel, EventBus, EventStream};
use crate::fanout::{FanoutEngine, PublishReceipt, ReadState, RoomEvent};
use crate::permissions::Authorization;
use crate::registry::{Caller, ConnectionRegistry};
use crate::rooms::RoomDirectory;
use crate::sfu::SignalingManager;
use crate::threads::ThreadAggregator;
use crate::RealtimeConfig;

/// External systems the service talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthVerifier>,
    pub authorization: Arc<dyn AuthorizationStore>,
    pub read_states: Arc<dyn ReadStateStore>,
    pub media: Arc<dyn MediaEngine>,
}

/// Result of a `publish-message`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    pub message: MessageEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
    pub media_sessions: usize,
}

/// The realtime core: every registry plus the operations that span several of them.
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct RealtimeService {
    pub config: RealtimeConfig,
    pub events: EventBus,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomDirectory>,
    pub fanout: Arc<FanoutEngine>,
    pub threads: Arc<ThreadAggregator>,
    pub signaling: Arc<SignalingManager>,
    pub authz: Arc<Authorization>,
    auth: Arc<dyn AuthVerifier>,
    ids: Arc<Snowflake>,
    accepting: Arc<AtomicBool>,
    /// Fired once when the service starts draining.
    pub shutdown: Arc<Notify>,
}

impl RealtimeService {
    pub fn new(config: RealtimeConfig, collaborators: Collaborators) -> Self {
        let ids = Arc::new(Snowflake::new(config.worker_id));
        let events = EventBus::new(config.event_bus_capacity);
        let registry = Arc::new(ConnectionRegistry::new(
            ids.clone(),
            events.clone(),
            config.max_connections_per_user,
        ));
        let rooms = Arc::new(RoomDirectory::new(config.max_rooms_per_connection));
        let authz = Arc::new(Authorization::new(
            collaborators.authorization,
            config.authz_cache_ttl,
            config.collaborator_timeout,
            config.authz_retry_attempts,
        ));
        let fanout = Arc::new(FanoutEngine::new(
            registry.clone(),
            rooms.clone(),
            collaborators.read_states,
            config.activity_window,
            config.collaborator_timeout,
        ));
        let threads = Arc::new(ThreadAggregator::new(fanout.clone()));
        let signaling = Arc::new(SignalingManager::new(
            registry.clone(),
            authz.clone(),
            collaborators.media,
            ids.clone(),
            config.max_participants,
            config.collaborator_timeout,
        ));

        Self {
            config,
            events,
            registry,
            rooms,
            fanout,
            threads,
            signaling,
            authz,
            auth: collaborators.auth,
            ids,
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Authenticate a credential and register a new connection. The returned stream
    /// carries every event addressed to it and ends when the connection is deregistered.
    pub async fn connect(&self, token: &str) -> Result<(Caller, EventStream), CoreError> {
        if !self.is_accepting() {
            return Err(CoreError::State("server is shutting down".into()));
        }
        let user_id = match bounded(
            "auth verifier",
            self.config.collaborator_timeout,
            self.auth.verify(token),
        )
        .await
        {
            Ok(user_id) => user_id,
            Err(CoreError::BadRequest(reason)) => {
                tracing::debug!(%reason, "credential rejected");
                return Err(CoreError::Unauthenticated);
            }
            Err(err) => return Err(err),
        };

        let (sink, stream) = event_channel();
        let connection = self.registry.register(user_id, sink)?;
        tracing::info!(
            user_id,
            connection_id = connection.id,
            "connection registered"
        );
        Ok((connection.caller(), stream))
    }

    /// Deregister a connection and sweep everything it held: room subscriptions and
    /// media-session participation.
    pub async fn disconnect(&self, caller: Caller) {
        let was_live = self.registry.deregister(caller.connection_id).is_some();
        let rooms = self.rooms.leave_all(caller.connection_id);
        let sessions = self.signaling.cleanup_connection(caller).await;
        if was_live {
            tracing::info!(
                user_id = caller.user_id,
                connection_id = caller.connection_id,
                rooms = rooms.len(),
                sessions,
                "connection closed"
            );
        }
    }

    pub fn set_status(&self, caller: Caller, status: PresenceStatus) -> Result<(), CoreError> {
        self.registry.set_status(caller.user_id, status)
    }

    /// Subscribe to a room after checking durable membership. Returns false if the
    /// connection was already subscribed.
    pub async fn join_room(&self, caller: Caller, room: RoomKey) -> Result<bool, CoreError> {
        self.authz.ensure_member(caller.user_id, &room).await?;
        let added = self.rooms.subscribe(caller.connection_id, room)?;
        // Deregistration may have swept this connection while membership was checked.
        if !self.registry.is_live(caller.connection_id) {
            self.rooms.leave_all(caller.connection_id);
            return Err(CoreError::State("connection closed".into()));
        }
        if added {
            let unread = self.fanout.track_reader(caller.user_id, room);
            tracing::debug!(connection_id = caller.connection_id, room = %room, unread, "joined room");
        }
        Ok(added)
    }

    pub fn leave_room(&self, caller: Caller, room: &RoomKey) -> bool {
        self.rooms.unsubscribe(caller.connection_id, room)
    }

    /// Relay a message to a room's live subscribers. Replies in a thread also reach the
    /// thread-watch room and bump the thread summary.
    pub async fn publish_message(&self, caller: Caller, request: PublishMessage) -> Result<Published, CoreError> {
        validate_message_payload(&request.payload)?;
        let room = request.room_id;
        self.authz.ensure_member(caller.user_id, &room).await?;

        let thread_parent_id = match (room, request.thread_parent_id) {
            (RoomKey::Thread(parent_id), claimed) => {
                if claimed.is_some_and(|claimed| claimed != parent_id) {
                    return Err(CoreError::BadRequest(format!(
                        "a message in {room} can only reply to thread {parent_id}"
                    )));
                }
                Some(parent_id)
            }
            (_, Some(parent_id)) => {
                self.authz
                    .ensure_thread_of(caller.user_id, parent_id, &room)
                    .await?;
                Some(parent_id)
            }
            (_, None) => None,
        };
        let created_at = Utc::now();
        let message = MessageEvent {
            id: request.message_id.unwrap_or_else(|| self.ids.next_id()),
            room_id: room,
            author_id: caller.user_id,
            content: request.payload,
            created_at,
            thread_parent_id,
        };
        let payload = serde_json::to_value(&message)
            .map_err(|e| CoreError::BadRequest(format!("unencodable message: {e}")))?;

        let receipt = self.fanout.publish(
            room,
            RoomEvent::new(EVENT_MESSAGE, payload.clone()).with_activity(caller.user_id, created_at),
        );
        let thread = thread_parent_id.map(|parent_id| {
            let thread_room = RoomKey::Thread(parent_id);
            if thread_room != room {
                self.fanout
                    .publish(thread_room, RoomEvent::new(EVENT_MESSAGE, payload));
            }
            self.threads.on_thread_reply(parent_id, created_at, Some(room))
        });

        Ok(Published {
            message,
            sequence: receipt.sequence,
            delivered: receipt.delivered,
            thread,
        })
    }

    pub async fn mark_read(
        &self,
        caller: Caller,
        room: RoomKey,
        read_at: DateTime<Utc>,
    ) -> Result<ReadState, CoreError> {
        self.authz.ensure_member(caller.user_id, &room).await?;
        self.fanout.mark_read(caller, room, read_at).await
    }

    pub async fn thread_typing(
        &self,
        caller: Caller,
        parent_id: MessageId,
        is_typing: bool,
    ) -> Result<PublishReceipt, CoreError> {
        self.authz
            .ensure_member(caller.user_id, &RoomKey::Thread(parent_id))
            .await?;
        Ok(self.threads.set_typing(caller, parent_id, is_typing))
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            connections: self.registry.connection_count(),
            users: self.registry.user_count(),
            rooms: self.rooms.room_count(),
            media_sessions: self.signaling.active_sessions().len(),
        }
    }

    /// Stop accepting connections and drain: every connection is deregistered (which
    /// ends its event stream) and every media session is closed.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();
        let connections = self.registry.connection_ids();
        tracing::info!(connections = connections.len(), "draining realtime service");
        for connection_id in connections {
            if let Some(connection) = self.registry.get(connection_id) {
                self.disconnect(connection.caller()).await;
            }
        }
        self.signaling.close_all().await;
        self.fanout.clear();
        tracing::info!("realtime service drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{create_token, JwtVerifier};
    use crate::member_index::MemberIndex;
    use serde_json::json;
    use teamwire_media::LoopbackEngine;
    use teamwire_models::room::RoomKind;

    const SECRET: &str = "service-test-secret";

    fn service() -> (RealtimeService, Arc<MemberIndex>) {
        let index = Arc::new(MemberIndex::empty());
        let service = RealtimeService::new(
            RealtimeConfig::default(),
            Collaborators {
                auth: Arc::new(JwtVerifier::new(SECRET)),
                authorization: index.clone(),
                read_states: index.clone(),
                media: Arc::new(LoopbackEngine::new()),
            },
        );
        (service, index)
    }

    fn token(user_id: i64) -> String {
        create_token(user_id, SECRET, 3600).unwrap()
    }

    #[tokio::test]
    async fn bad_credentials_are_unauthenticated() {
        let (service, _) = service();
        let err = service.connect("not-a-jwt").await.unwrap_err();
        assert_eq!(err, CoreError::Unauthenticated);
        let (caller, _rx) = service.connect(&token(5)).await.unwrap();
        assert_eq!(caller.user_id, 5);
    }

    #[tokio::test]
    async fn join_room_checks_membership() {
        let (service, index) = service();
        let room = RoomKey::Channel(1);
        index.add_room(room, RoomKind::Text);
        let (caller, _rx) = service.connect(&token(5)).await.unwrap();

        let err = service.join_room(caller, room).await.unwrap_err();
        assert_eq!(err.code(), "authorization_error");
        let err = service.join_room(caller, RoomKey::Channel(2)).await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        index.add_member(room, 5);
        service.authz.invalidate_room(&room).await;
        assert!(service.join_room(caller, room).await.unwrap());
        assert!(!service.join_room(caller, room).await.unwrap());
    }

    #[tokio::test]
    async fn late_joiner_sees_unread_backlog() {
        let (service, index) = service();
        let room = RoomKey::Channel(1);
        index.add_room(room, RoomKind::Text);
        index.add_member(room, 1);
        index.add_member(room, 2);
        let (author, _author_rx) = service.connect(&token(1)).await.unwrap();
        service.join_room(author, room).await.unwrap();
        for n in 0..2 {
            service
                .publish_message(
                    author,
                    PublishMessage {
                        room_id: room,
                        payload: json!({ "text": n }),
                        message_id: None,
                        thread_parent_id: None,
                    },
                )
                .await
                .unwrap();
        }

        let (reader, _reader_rx) = service.connect(&token(2)).await.unwrap();
        service.join_room(reader, room).await.unwrap();
        assert_eq!(service.fanout.unread_count(2, &room), 2);
        assert_eq!(service.fanout.unread_count(1, &room), 0);
    }

    #[tokio::test]
    async fn thread_replies_reach_both_rooms_and_count() {
        let (service, index) = service();
        let channel = RoomKey::Channel(1);
        index.add_room(channel, RoomKind::Text);
        index.add_thread(100, channel);
        for user in [1, 2] {
            index.add_member(channel, user);
        }
        let (author, _author_rx) = service.connect(&token(1)).await.unwrap();
        let (watcher, mut watcher_rx) = service.connect(&token(2)).await.unwrap();
        service.join_room(watcher, RoomKey::Thread(100)).await.unwrap();

        let published = service
            .publish_message(
                author,
                PublishMessage {
                    room_id: channel,
                    payload: json!({ "text": "reply" }),
                    message_id: None,
                    thread_parent_id: Some(100),
                },
            )
            .await
            .unwrap();
        assert_eq!(published.delivered, 0);
        assert_eq!(published.thread.map(|t| t.reply_count), Some(1));

        let mut seen = Vec::new();
        while let Ok(event) = watcher_rx.try_recv() {
            seen.push(event.event_type);
        }
        assert!(seen.contains(&EVENT_MESSAGE));
        assert!(seen.contains(&teamwire_models::gateway::EVENT_THREAD_SUMMARY_UPDATED));
    }

    #[tokio::test]
    async fn replies_cannot_reach_threads_of_other_rooms() {
        let (service, index) = service();
        let (ours, theirs) = (RoomKey::Channel(1), RoomKey::Channel(2));
        index.add_room(ours, RoomKind::Text);
        index.add_room(theirs, RoomKind::Text);
        index.add_member(ours, 10);
        index.add_member(theirs, 20);
        index.add_thread(100, theirs);
        let (intruder, _intruder_rx) = service.connect(&token(10)).await.unwrap();
        let (watcher, mut watcher_rx) = service.connect(&token(20)).await.unwrap();
        service.join_room(watcher, RoomKey::Thread(100)).await.unwrap();

        let reply = |room_id, thread_parent_id| PublishMessage {
            room_id,
            payload: json!({ "text": "injected" }),
            message_id: None,
            thread_parent_id,
        };
        let err = service
            .publish_message(intruder, reply(ours, Some(100)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "authorization_error");
        let err = service
            .publish_message(intruder, reply(ours, Some(999)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = service
            .publish_message(watcher, reply(RoomKey::Thread(100), Some(5)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");

        assert!(watcher_rx.try_recv().is_err());
        assert_eq!(service.threads.summary(100).reply_count, 0);
    }

    #[tokio::test]
    async fn shutdown_drains_every_connection() {
        let (service, _) = service();
        let (_a, mut a_rx) = service.connect(&token(1)).await.unwrap();
        let (_b, _b_rx) = service.connect(&token(2)).await.unwrap();
        service.shutdown().await;

        assert_eq!(service.stats(), ServiceStats::default());
        assert!(!service.is_accepting());
        assert_eq!(service.connect(&token(3)).await.unwrap_err().code(), "state_error");
        // The registry dropped the sink, so the stream ends.
        while a_rx.recv().await.is_some() {}
    }
}
