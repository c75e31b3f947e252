//! Media-session signaling: the per-channel state machine between clients and the
//! external media engine.
//!
//! Every operation follows the same shape: a short critical section on the channel's
//! session entry validates and reserves, the engine call runs with no guard held, and
//! a second critical section commits only if the participant's generation is unchanged.
//! Anything the engine created for a participant that has since gone away is closed.

pub mod session;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use teamwire_media::{MediaEngine, MediaHandle};
use teamwire_models::gateway::{
    EVENT_HOST_ACTION, EVENT_PARTICIPANT_JOINED, EVENT_PARTICIPANT_LEFT, EVENT_PRODUCER_AVAILABLE,
    EVENT_PRODUCER_CLOSED,
};
use teamwire_models::media::{
    ConsumerCreated, HostAction, HostActionNotice, MediaKind, MediaParams, ParticipantChange,
    ProducerAvailable, ProducerClosed, ProducerCreated, SessionJoined, SessionLeft,
    TransportCreated, TransportDirection, TransportState,
};
use teamwire_models::room::RoomKey;
use teamwire_models::{ChannelId, ConnectionId, UserId};
use teamwire_util::snowflake::Snowflake;
use teamwire_util::validation::{validate_app_data, validate_media_params};

use crate::collaborators::bounded;
use crate::error::CoreError;
use crate::events::ServerEvent;
use crate::permissions::Authorization;
use crate::registry::{Caller, ConnectionRegistry};

use self::session::{Consumer, MediaSession, Participant, Producer, Teardown, Transport};

pub struct SignalingManager {
    sessions: DashMap<ChannelId, MediaSession>,
    /// Channels in which a connection holds a participant record. Updated only
    /// while the matching session guard is held.
    by_connection: DashMap<ConnectionId, HashSet<ChannelId>>,
    registry: Arc<ConnectionRegistry>,
    authz: Arc<Authorization>,
    engine: Arc<dyn MediaEngine>,
    ids: Arc<Snowflake>,
    generations: AtomicU64,
    max_participants: usize,
    timeout: Duration,
}

fn not_joined(channel_id: ChannelId) -> CoreError {
    CoreError::NotFound(format!("not joined to the media session of channel {channel_id}"))
}

fn no_session(channel_id: ChannelId) -> CoreError {
    CoreError::NotFound(format!("no media session in channel {channel_id}"))
}

fn participant_gone() -> CoreError {
    CoreError::State("participant left the media session".into())
}

impl SignalingManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        authz: Arc<Authorization>,
        engine: Arc<dyn MediaEngine>,
        ids: Arc<Snowflake>,
        max_participants: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            by_connection: DashMap::new(),
            registry,
            authz,
            engine,
            ids,
            generations: AtomicU64::new(0),
            max_participants: max_participants.max(1),
            timeout,
        }
    }

    pub async fn join(&self, caller: Caller, channel_id: ChannelId) -> Result<SessionJoined, CoreError> {
        let room = RoomKey::Channel(channel_id);
        let kind = self.authz.room_kind(&room).await?;
        if !kind.is_some_and(|k| k.supports_media()) {
            return Err(CoreError::NotFound(format!(
                "no voice or video channel {channel_id}"
            )));
        }
        self.authz.ensure_member(caller.user_id, &room).await?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let joined = {
            let mut session = self
                .sessions
                .entry(channel_id)
                .or_insert_with(|| MediaSession::new(channel_id, self.ids.next_id()));
            if let Some(existing) = session.participants.get(&caller.user_id) {
                return Err(CoreError::Conflict(if existing.connection_id == caller.connection_id {
                    format!("already joined channel {channel_id}")
                } else {
                    format!("already joined channel {channel_id} from another connection")
                }));
            }
            if session.len() >= self.max_participants {
                return Err(CoreError::Conflict(format!(
                    "media session is full (max {} participants)",
                    self.max_participants
                )));
            }

            let others = session.connection_ids(None);
            session
                .participants
                .insert(caller.user_id, Participant::new(caller, generation));
            self.by_connection
                .entry(caller.connection_id)
                .or_default()
                .insert(channel_id);
            self.notify(
                &others,
                EVENT_PARTICIPANT_JOINED,
                &ParticipantChange {
                    channel_id,
                    user_id: caller.user_id,
                },
            );
            SessionJoined {
                channel_id,
                participants: session.participant_infos(),
                producers: session.announced_producers(),
            }
        };

        // The connection may have closed while authorization was in flight, in which
        // case its cleanup sweep could already have run.
        if !self.registry.is_live(caller.connection_id) {
            let _ = self
                .remove_participant(channel_id, caller.user_id, Some(caller.connection_id))
                .await;
            return Err(CoreError::State("connection closed".into()));
        }

        tracing::info!(
            channel_id,
            user_id = caller.user_id,
            participants = joined.participants.len(),
            "joined media session"
        );
        Ok(joined)
    }

    pub async fn leave(&self, caller: Caller, channel_id: ChannelId) -> Result<SessionLeft, CoreError> {
        self.remove_participant(channel_id, caller.user_id, Some(caller.connection_id))
            .await
    }

    pub async fn create_transport(
        &self,
        caller: Caller,
        channel_id: ChannelId,
        direction: TransportDirection,
    ) -> Result<TransportCreated, CoreError> {
        let transport_id = self.ids.next_id();
        let (generation, router_id) = {
            let mut session = self.sessions.get_mut(&channel_id).ok_or_else(|| no_session(channel_id))?;
            let router_id = session.router_id;
            let participant = session
                .participant_of(caller)
                .ok_or_else(|| not_joined(channel_id))?;
            let slot = participant.slot_mut(direction);
            if slot.is_some() {
                return Err(CoreError::Conflict(format!(
                    "a {direction:?} transport is already open"
                )));
            }
            *slot = Some(Transport::pending(transport_id, direction));
            (participant.generation, router_id)
        };

        let params = match bounded(
            "media engine",
            self.timeout,
            self.engine.create_transport(router_id, transport_id, direction),
        )
        .await
        {
            Ok(params) => params,
            Err(err) => {
                self.abandon(channel_id, caller.user_id, generation, MediaHandle::Transport(transport_id), &err)
                    .await;
                return Err(err);
            }
        };

        let committed = self
            .with_participant(channel_id, caller.user_id, generation, |session| {
                let participant = session.participants.get_mut(&caller.user_id)?;
                let transport = participant.transport_mut(transport_id)?;
                transport.pending = false;
                Some(())
            })
            .flatten();
        if committed.is_none() {
            self.close_quietly(MediaHandle::Transport(transport_id)).await;
            return Err(participant_gone());
        }

        tracing::debug!(channel_id, user_id = caller.user_id, transport_id, ?direction, "transport created");
        Ok(TransportCreated {
            channel_id,
            transport_id,
            direction,
            params,
        })
    }

    pub async fn connect_transport(
        &self,
        caller: Caller,
        channel_id: ChannelId,
        transport_id: i64,
        dtls_parameters: MediaParams,
    ) -> Result<(), CoreError> {
        validate_media_params("dtlsParameters", &dtls_parameters)?;
        let generation = {
            let mut session = self.sessions.get_mut(&channel_id).ok_or_else(|| no_session(channel_id))?;
            let participant = session
                .participant_of(caller)
                .ok_or_else(|| not_joined(channel_id))?;
            let generation = participant.generation;
            let transport = participant
                .transport_mut(transport_id)
                .ok_or_else(|| CoreError::NotFound(format!("transport {transport_id}")))?;
            if transport.pending {
                return Err(CoreError::State("transport is still being created".into()));
            }
            match transport.state {
                TransportState::Connected => {
                    return if transport.dtls_parameters.as_ref() == Some(&dtls_parameters) {
                        Ok(())
                    } else {
                        Err(CoreError::State(
                            "transport is already connected with different parameters".into(),
                        ))
                    };
                }
                TransportState::Connecting => {
                    return Err(CoreError::State("transport is already connecting".into()));
                }
                TransportState::Created => {
                    transport.state = TransportState::Connecting;
                    transport.dtls_parameters = Some(dtls_parameters.clone());
                }
            }
            generation
        };

        if let Err(err) = bounded(
            "media engine",
            self.timeout,
            self.engine.connect_transport(transport_id, &dtls_parameters),
        )
        .await
        {
            tracing::warn!(channel_id, user_id = caller.user_id, transport_id, error = %err, "transport connect failed, tearing it down");
            self.teardown_transport(channel_id, caller.user_id, generation, transport_id)
                .await;
            return Err(err);
        }

        let committed = self
            .with_participant(channel_id, caller.user_id, generation, |session| {
                let transport = session
                    .participants
                    .get_mut(&caller.user_id)?
                    .transport_mut(transport_id)?;
                transport.state = TransportState::Connected;
                Some(())
            })
            .ok_or_else(participant_gone)?;
        if committed.is_none() {
            return Err(CoreError::State("transport was closed while connecting".into()));
        }
        tracing::debug!(channel_id, user_id = caller.user_id, transport_id, "transport connected");
        Ok(())
    }

    pub async fn produce(
        &self,
        caller: Caller,
        channel_id: ChannelId,
        transport_id: i64,
        kind: MediaKind,
        rtp_parameters: MediaParams,
        app_data: Option<MediaParams>,
    ) -> Result<ProducerCreated, CoreError> {
        validate_media_params("rtpParameters", &rtp_parameters)?;
        validate_app_data(app_data.as_ref())?;
        let producer_id = self.ids.next_id();
        let generation = {
            let mut session = self.sessions.get_mut(&channel_id).ok_or_else(|| no_session(channel_id))?;
            let participant = session
                .participant_of(caller)
                .ok_or_else(|| not_joined(channel_id))?;
            let ready = participant
                .send_transport
                .as_ref()
                .is_some_and(|t| t.id == transport_id && t.is_connected());
            if !ready {
                return Err(CoreError::State(
                    "producing requires the connected send transport".into(),
                ));
            }
            participant.producers.insert(
                producer_id,
                Producer {
                    id: producer_id,
                    kind,
                    transport_id,
                    app_data: app_data.clone(),
                    pending: true,
                },
            );
            participant.generation
        };

        if let Err(err) = bounded(
            "media engine",
            self.timeout,
            self.engine
                .produce(transport_id, producer_id, kind, &rtp_parameters, app_data.as_ref()),
        )
        .await
        {
            self.abandon(channel_id, caller.user_id, generation, MediaHandle::Producer(producer_id), &err)
                .await;
            return Err(err);
        }

        let announced = self
            .with_participant(channel_id, caller.user_id, generation, |session| {
                let producer = session
                    .participants
                    .get_mut(&caller.user_id)?
                    .producers
                    .get_mut(&producer_id)?;
                producer.pending = false;
                let others = session.connection_ids(Some(caller.user_id));
                self.notify(
                    &others,
                    EVENT_PRODUCER_AVAILABLE,
                    &ProducerAvailable {
                        channel_id,
                        producer_id,
                        kind,
                        participant_id: caller.user_id,
                    },
                );
                Some(())
            })
            .flatten();
        if announced.is_none() {
            self.close_quietly(MediaHandle::Producer(producer_id)).await;
            return Err(participant_gone());
        }

        tracing::info!(channel_id, user_id = caller.user_id, producer_id, ?kind, "producer opened");
        Ok(ProducerCreated {
            channel_id,
            producer_id,
        })
    }

    pub async fn consume(
        &self,
        caller: Caller,
        channel_id: ChannelId,
        transport_id: i64,
        producer_id: i64,
        rtp_capabilities: MediaParams,
    ) -> Result<ConsumerCreated, CoreError> {
        validate_media_params("rtpCapabilities", &rtp_capabilities)?;
        let consumer_id = self.ids.next_id();
        let (generation, kind) = {
            let mut session = self.sessions.get_mut(&channel_id).ok_or_else(|| no_session(channel_id))?;
            let participant = session
                .participant_of(caller)
                .ok_or_else(|| not_joined(channel_id))?;
            let ready = participant
                .recv_transport
                .as_ref()
                .is_some_and(|t| t.id == transport_id && t.is_connected());
            if !ready {
                return Err(CoreError::State(
                    "consuming requires the connected recv transport".into(),
                ));
            }
            let kind = session
                .producer(producer_id)
                .map(|(_, producer)| producer.kind)
                .ok_or_else(|| CoreError::NotFound(format!("producer {producer_id}")))?;
            let participant = session
                .participant_of(caller)
                .ok_or_else(|| not_joined(channel_id))?;
            participant.consumers.insert(
                consumer_id,
                Consumer {
                    id: consumer_id,
                    producer_id,
                    transport_id,
                    pending: true,
                },
            );
            (participant.generation, kind)
        };

        let params = match bounded(
            "media engine",
            self.timeout,
            self.engine
                .consume(transport_id, consumer_id, producer_id, &rtp_capabilities),
        )
        .await
        {
            Ok(params) => params,
            Err(err) => {
                self.abandon(channel_id, caller.user_id, generation, MediaHandle::Consumer(consumer_id), &err)
                    .await;
                return Err(err);
            }
        };

        let committed = self.with_participant(channel_id, caller.user_id, generation, |session| {
            let consumer = session
                .participants
                .get_mut(&caller.user_id)
                .and_then(|p| p.consumers.get_mut(&consumer_id));
            match consumer {
                Some(consumer) => {
                    consumer.pending = false;
                    true
                }
                // The producer closed while the engine call was in flight.
                None => false,
            }
        });
        match committed {
            Some(true) => {}
            Some(false) => {
                self.close_quietly(MediaHandle::Consumer(consumer_id)).await;
                return Err(CoreError::NotFound(format!("producer {producer_id} closed")));
            }
            None => {
                self.close_quietly(MediaHandle::Consumer(consumer_id)).await;
                return Err(participant_gone());
            }
        }

        tracing::debug!(channel_id, user_id = caller.user_id, consumer_id, producer_id, "consumer opened");
        Ok(ConsumerCreated {
            channel_id,
            consumer_id,
            producer_id,
            kind,
            params,
        })
    }

    /// Owners close their own producers; anyone else needs an elevated role.
    pub async fn close_producer(
        &self,
        caller: Caller,
        channel_id: ChannelId,
        producer_id: i64,
    ) -> Result<(), CoreError> {
        let owner = {
            let session = self.sessions.get(&channel_id).ok_or_else(|| no_session(channel_id))?;
            session
                .producer(producer_id)
                .map(|(owner, _)| owner)
                .ok_or_else(|| CoreError::NotFound(format!("producer {producer_id}")))?
        };
        if owner != caller.user_id {
            self.authz
                .require_elevated(caller.user_id, channel_id)
                .await?;
        }
        self.remove_producer(channel_id, producer_id).await
    }

    pub async fn host_action(
        &self,
        caller: Caller,
        channel_id: ChannelId,
        target_user_id: UserId,
        action: HostAction,
    ) -> Result<(), CoreError> {
        self.authz
            .require_elevated(caller.user_id, channel_id)
            .await?;

        let (target_connection, producer_ids) = {
            let session = self.sessions.get(&channel_id).ok_or_else(|| no_session(channel_id))?;
            let target = session.participants.get(&target_user_id).ok_or_else(|| {
                CoreError::NotFound(format!("user {target_user_id} is not in the media session"))
            })?;
            let kinds: &[MediaKind] = match action {
                HostAction::Mute => &[MediaKind::Audio],
                HostAction::StopVideo => &[MediaKind::Video, MediaKind::Screen],
                HostAction::Kick => &[],
            };
            (target.connection_id, target.live_producer_ids(kinds))
        };

        match action {
            HostAction::Mute | HostAction::StopVideo => {
                for producer_id in producer_ids {
                    match self.remove_producer(channel_id, producer_id).await {
                        Ok(()) | Err(CoreError::NotFound(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
            HostAction::Kick => {
                self.remove_participant(channel_id, target_user_id, None)
                    .await?;
            }
        }

        self.notify(
            &[target_connection],
            EVENT_HOST_ACTION,
            &HostActionNotice {
                channel_id,
                action,
                by_user_id: caller.user_id,
            },
        );
        tracing::info!(channel_id, by = caller.user_id, target = target_user_id, ?action, "host action applied");
        Ok(())
    }

    /// Leave every media session this connection is part of. Run when it deregisters.
    pub async fn cleanup_connection(&self, caller: Caller) -> usize {
        let Some((_, channels)) = self.by_connection.remove(&caller.connection_id) else {
            return 0;
        };
        let mut left = 0;
        for channel_id in channels {
            match self
                .remove_participant(channel_id, caller.user_id, Some(caller.connection_id))
                .await
            {
                Ok(_) => left += 1,
                Err(err) => {
                    tracing::debug!(channel_id, connection_id = caller.connection_id, error = %err, "nothing to clean up")
                }
            }
        }
        left
    }

    /// Tear down every session. Used when the service drains.
    pub async fn close_all(&self) {
        let channels: Vec<ChannelId> = self.sessions.iter().map(|s| *s.key()).collect();
        for channel_id in channels {
            let users: Vec<UserId> = self
                .sessions
                .get(&channel_id)
                .map(|s| s.participants.keys().copied().collect())
                .unwrap_or_default();
            for user_id in users {
                let _ = self.remove_participant(channel_id, user_id, None).await;
            }
        }
    }

    pub fn participant_count(&self, channel_id: ChannelId) -> usize {
        self.sessions.get(&channel_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn active_sessions(&self) -> Vec<ChannelId> {
        self.sessions.iter().map(|s| *s.key()).collect()
    }

    pub fn participants(&self, channel_id: ChannelId) -> Vec<UserId> {
        self.sessions
            .get(&channel_id)
            .map(|s| s.participants.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn remove_producer(&self, channel_id: ChannelId, producer_id: i64) -> Result<(), CoreError> {
        let teardown = {
            let mut session = self.sessions.get_mut(&channel_id).ok_or_else(|| no_session(channel_id))?;
            let (owner, teardown) = session
                .remove_producer(producer_id)
                .ok_or_else(|| CoreError::NotFound(format!("producer {producer_id}")))?;
            let everyone = session.connection_ids(None);
            self.notify(
                &everyone,
                EVENT_PRODUCER_CLOSED,
                &ProducerClosed {
                    channel_id,
                    producer_id,
                },
            );
            tracing::info!(channel_id, owner, producer_id, consumers = teardown.consumers.len(), "producer closed");
            teardown
        };
        self.release(teardown).await;
        Ok(())
    }

    /// Remove a participant, announce it, and destroy the session if it was the last one.
    /// With `connection` set, only that connection's record is removed.
    async fn remove_participant(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        connection: Option<ConnectionId>,
    ) -> Result<SessionLeft, CoreError> {
        let (teardown, remaining, router_id) = {
            let mut session = self.sessions.get_mut(&channel_id).ok_or_else(|| no_session(channel_id))?;
            let matches = session
                .participants
                .get(&user_id)
                .is_some_and(|p| connection.is_none_or(|c| p.connection_id == c));
            if !matches {
                return Err(not_joined(channel_id));
            }
            let (participant, teardown) = session
                .remove_participant(user_id)
                .ok_or_else(|| not_joined(channel_id))?;

            if let Some(mut channels) = self.by_connection.get_mut(&participant.connection_id) {
                channels.remove(&channel_id);
            }
            self.by_connection
                .remove_if(&participant.connection_id, |_, channels| channels.is_empty());

            let others = session.connection_ids(None);
            for producer in teardown.announced_producers() {
                self.notify(
                    &others,
                    EVENT_PRODUCER_CLOSED,
                    &ProducerClosed {
                        channel_id,
                        producer_id: producer.id,
                    },
                );
            }
            self.notify(
                &others,
                EVENT_PARTICIPANT_LEFT,
                &ParticipantChange { channel_id, user_id },
            );
            (teardown, session.len(), session.router_id)
        };

        let session_closed = remaining == 0
            && self
                .sessions
                .remove_if(&channel_id, |_, s| s.is_empty())
                .is_some();

        self.release(teardown).await;
        if session_closed {
            if let Err(err) = bounded("media engine", self.timeout, self.engine.release_router(router_id)).await {
                tracing::warn!(channel_id, router_id, error = %err, "failed to release router");
            }
            tracing::info!(channel_id, "media session closed (last participant left)");
        }
        tracing::info!(channel_id, user_id, remaining, "left media session");
        Ok(SessionLeft {
            channel_id,
            remaining,
            session_closed,
        })
    }

    /// Close one transport after a failed step, leaving the rest of the participant alone.
    async fn teardown_transport(&self, channel_id: ChannelId, user_id: UserId, generation: u64, transport_id: i64) {
        let teardown = self
            .with_participant(channel_id, user_id, generation, |session| {
                let teardown = session.remove_transport(user_id, transport_id)?;
                let others = session.connection_ids(Some(user_id));
                for producer in teardown.announced_producers() {
                    self.notify(
                        &others,
                        EVENT_PRODUCER_CLOSED,
                        &ProducerClosed {
                            channel_id,
                            producer_id: producer.id,
                        },
                    );
                }
                Some(teardown)
            })
            .flatten();
        if let Some(teardown) = teardown {
            self.release(teardown).await;
        }
    }

    /// Drop a reservation whose engine call failed. A timed-out call may still have
    /// created the resource, so it is closed as well.
    async fn abandon(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        generation: u64,
        handle: MediaHandle,
        err: &CoreError,
    ) {
        self.with_participant(channel_id, user_id, generation, |session| {
            let Some(participant) = session.participants.get_mut(&user_id) else {
                return;
            };
            match handle {
                MediaHandle::Transport(id) => {
                    for slot in [&mut participant.send_transport, &mut participant.recv_transport] {
                        slot.take_if(|t| t.id == id);
                    }
                }
                MediaHandle::Producer(id) => {
                    participant.producers.remove(&id);
                }
                MediaHandle::Consumer(id) => {
                    participant.consumers.remove(&id);
                }
            }
        });
        tracing::warn!(channel_id, user_id, resource = handle.kind(), id = handle.id(), error = %err, "signaling step failed");
        if matches!(err, CoreError::Timeout(_)) {
            self.close_quietly(handle).await;
        }
    }

    /// Run `f` on the session if `user_id` is still joined with `generation`.
    fn with_participant<R>(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        generation: u64,
        f: impl FnOnce(&mut MediaSession) -> R,
    ) -> Option<R> {
        let mut session = self.sessions.get_mut(&channel_id)?;
        session.participant_at(user_id, generation)?;
        Some(f(&mut session))
    }

    async fn release(&self, teardown: Teardown) {
        for handle in teardown.handles() {
            self.close_quietly(handle).await;
        }
    }

    async fn close_quietly(&self, handle: MediaHandle) {
        if let Err(err) = bounded("media engine", self.timeout, self.engine.close(handle)).await {
            tracing::debug!(resource = handle.kind(), id = handle.id(), error = %err, "engine close failed");
        }
    }

    fn notify<T: Serialize>(&self, connections: &[ConnectionId], event_type: &'static str, payload: &T) {
        if connections.is_empty() {
            return;
        }
        let payload = match serde_json::to_value(payload) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                tracing::error!(event = event_type, "failed to encode signaling event: {e}");
                return;
            }
        };
        for connection_id in connections {
            self.registry.send_to(
                *connection_id,
                ServerEvent {
                    event_type,
                    payload: payload.clone(),
                    room: None,
                    sequence: None,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, EventBus, EventStream};
    use crate::member_index::MemberIndex;
    use serde_json::json;
    use teamwire_media::{LoopbackEngine, LoopbackOp};
    use teamwire_models::room::{Role, RoomKind};

    const VOICE: ChannelId = 7;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        index: Arc<MemberIndex>,
        engine: Arc<LoopbackEngine>,
        sfu: SignalingManager,
    }

    fn harness() -> Harness {
        let ids = Arc::new(Snowflake::new(3));
        let registry = Arc::new(ConnectionRegistry::new(ids.clone(), EventBus::new(16), 8));
        let index = Arc::new(MemberIndex::empty());
        index.add_room(RoomKey::Channel(VOICE), RoomKind::Voice);
        index.add_room(RoomKey::Channel(8), RoomKind::Text);
        let authz = Arc::new(Authorization::new(
            index.clone(),
            Duration::from_secs(30),
            Duration::from_secs(1),
            2,
        ));
        let engine = Arc::new(LoopbackEngine::new());
        let sfu = SignalingManager::new(
            registry.clone(),
            authz,
            engine.clone(),
            ids,
            3,
            Duration::from_secs(1),
        );
        Harness {
            registry,
            index,
            engine,
            sfu,
        }
    }

    impl Harness {
        fn connect(&self, user_id: UserId) -> (Caller, EventStream) {
            self.index.add_member(RoomKey::Channel(VOICE), user_id);
            let (tx, rx) = event_channel();
            (self.registry.register(user_id, tx).unwrap().caller(), rx)
        }

        /// Join and open a connected transport in `direction`.
        async fn ready(&self, caller: Caller, direction: TransportDirection) -> i64 {
            let transport = self
                .sfu
                .create_transport(caller, VOICE, direction)
                .await
                .unwrap();
            self.sfu
                .connect_transport(caller, VOICE, transport.transport_id, json!({ "role": "client" }))
                .await
                .unwrap();
            transport.transport_id
        }
    }

    fn event_types(rx: &mut EventStream) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.event_type);
        }
        out
    }

    #[tokio::test]
    async fn join_requires_a_media_channel_and_membership() {
        let h = harness();
        let (a, _rx) = h.connect(1);
        let err = h.sfu.join(a, 8).await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        let (stranger_tx, _stranger_rx) = event_channel();
        let stranger = h.registry.register(99, stranger_tx).unwrap().caller();
        let err = h.sfu.join(stranger, VOICE).await.unwrap_err();
        assert_eq!(err.code(), "authorization_error");

        let joined = h.sfu.join(a, VOICE).await.unwrap();
        assert_eq!(joined.participants.len(), 1);
        assert_eq!(h.sfu.join(a, VOICE).await.unwrap_err().code(), "conflict");
    }

    #[tokio::test]
    async fn full_session_rejects_joins() {
        let h = harness();
        for user in 1..=3 {
            let (c, _rx) = h.connect(user);
            h.sfu.join(c, VOICE).await.unwrap();
        }
        let (d, _rx) = h.connect(4);
        assert_eq!(h.sfu.join(d, VOICE).await.unwrap_err().code(), "conflict");
        assert_eq!(h.sfu.participant_count(VOICE), 3);
    }

    #[tokio::test]
    async fn consume_before_connect_is_a_state_error() {
        let h = harness();
        let (a, _a_rx) = h.connect(1);
        let (b, _b_rx) = h.connect(2);
        h.sfu.join(a, VOICE).await.unwrap();
        h.sfu.join(b, VOICE).await.unwrap();
        let send = h.ready(a, TransportDirection::Send).await;
        let producer = h
            .sfu
            .produce(a, VOICE, send, MediaKind::Audio, json!({ "codecs": [] }), None)
            .await
            .unwrap();

        let recv = h
            .sfu
            .create_transport(b, VOICE, TransportDirection::Recv)
            .await
            .unwrap();
        let err = h
            .sfu
            .consume(b, VOICE, recv.transport_id, producer.producer_id, json!({ "codecs": [] }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state_error");
        assert_eq!(h.engine.open_consumers(), 0);
    }

    #[tokio::test]
    async fn produce_is_announced_to_others_only() {
        let h = harness();
        let (a, mut a_rx) = h.connect(1);
        let (b, mut b_rx) = h.connect(2);
        h.sfu.join(a, VOICE).await.unwrap();
        h.sfu.join(b, VOICE).await.unwrap();
        let send = h.ready(a, TransportDirection::Send).await;
        event_types(&mut a_rx);
        event_types(&mut b_rx);

        h.sfu
            .produce(a, VOICE, send, MediaKind::Video, json!({ "codecs": [] }), None)
            .await
            .unwrap();
        assert!(event_types(&mut a_rx).is_empty());
        assert_eq!(event_types(&mut b_rx), vec![EVENT_PRODUCER_AVAILABLE]);
    }

    #[tokio::test]
    async fn connect_is_idempotent_for_identical_parameters() {
        let h = harness();
        let (a, _rx) = h.connect(1);
        h.sfu.join(a, VOICE).await.unwrap();
        let send = h.ready(a, TransportDirection::Send).await;
        h.sfu
            .connect_transport(a, VOICE, send, json!({ "role": "client" }))
            .await
            .unwrap();
        let err = h
            .sfu
            .connect_transport(a, VOICE, send, json!({ "role": "server" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state_error");
        assert_eq!(
            h.sfu
                .create_transport(a, VOICE, TransportDirection::Send)
                .await
                .unwrap_err()
                .code(),
            "conflict"
        );
    }

    #[tokio::test]
    async fn failed_engine_call_leaves_no_reservation() {
        let h = harness();
        let (a, _rx) = h.connect(1);
        h.sfu.join(a, VOICE).await.unwrap();
        h.engine.fail_next(LoopbackOp::CreateTransport);
        let err = h
            .sfu
            .create_transport(a, VOICE, TransportDirection::Send)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
        // The slot is free again.
        h.ready(a, TransportDirection::Send).await;
    }

    #[tokio::test]
    async fn failed_connect_tears_the_transport_down() {
        let h = harness();
        let (a, _rx) = h.connect(1);
        h.sfu.join(a, VOICE).await.unwrap();
        let transport = h
            .sfu
            .create_transport(a, VOICE, TransportDirection::Send)
            .await
            .unwrap();
        h.engine.fail_next(LoopbackOp::ConnectTransport);
        assert!(h
            .sfu
            .connect_transport(a, VOICE, transport.transport_id, json!({ "role": "client" }))
            .await
            .is_err());
        assert!(!h.engine.is_open(MediaHandle::Transport(transport.transport_id)));
        let err = h
            .sfu
            .connect_transport(a, VOICE, transport.transport_id, json!({ "role": "client" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn closing_a_producer_needs_ownership_or_a_host_role() {
        let h = harness();
        let (a, _a_rx) = h.connect(1);
        let (b, mut b_rx) = h.connect(2);
        let (c, _c_rx) = h.connect(3);
        for caller in [a, b, c] {
            h.sfu.join(caller, VOICE).await.unwrap();
        }
        let send = h.ready(a, TransportDirection::Send).await;
        let producer = h
            .sfu
            .produce(a, VOICE, send, MediaKind::Audio, json!({ "codecs": [] }), None)
            .await
            .unwrap();
        let recv = h.ready(b, TransportDirection::Recv).await;
        h.sfu
            .consume(b, VOICE, recv, producer.producer_id, json!({ "codecs": [] }))
            .await
            .unwrap();
        assert_eq!(h.engine.open_consumers(), 1);

        let err = h
            .sfu
            .close_producer(c, VOICE, producer.producer_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "authorization_error");

        h.index.set_role(VOICE, 3, Role::Host);
        event_types(&mut b_rx);
        h.sfu
            .close_producer(c, VOICE, producer.producer_id)
            .await
            .unwrap();
        assert_eq!(h.engine.open_consumers(), 0);
        assert_eq!(h.engine.open_producers(), 0);
        assert_eq!(event_types(&mut b_rx), vec![EVENT_PRODUCER_CLOSED]);
    }

    #[tokio::test]
    async fn host_can_mute_and_kick() {
        let h = harness();
        let (host, _host_rx) = h.connect(1);
        let (target, mut target_rx) = h.connect(2);
        h.index.set_role(VOICE, 1, Role::Owner);
        h.sfu.join(host, VOICE).await.unwrap();
        h.sfu.join(target, VOICE).await.unwrap();
        let send = h.ready(target, TransportDirection::Send).await;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            h.sfu
                .produce(target, VOICE, send, kind, json!({ "codecs": [] }), None)
                .await
                .unwrap();
        }
        event_types(&mut target_rx);

        h.sfu.host_action(host, VOICE, 2, HostAction::Mute).await.unwrap();
        assert_eq!(h.engine.open_producers(), 1);
        assert!(event_types(&mut target_rx).contains(&EVENT_HOST_ACTION));

        h.sfu.host_action(host, VOICE, 2, HostAction::Kick).await.unwrap();
        assert_eq!(h.sfu.participants(VOICE), vec![1]);
        assert_eq!(h.engine.open_producers(), 0);
        assert_eq!(h.engine.open_transports(), 0);

        let err = h
            .sfu
            .host_action(target, VOICE, 1, HostAction::Kick)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "authorization_error");
    }

    #[tokio::test]
    async fn last_leave_destroys_the_session_and_router() {
        let h = harness();
        let (a, _a_rx) = h.connect(1);
        let (b, mut b_rx) = h.connect(2);
        h.sfu.join(a, VOICE).await.unwrap();
        h.sfu.join(b, VOICE).await.unwrap();
        h.ready(a, TransportDirection::Send).await;
        h.ready(b, TransportDirection::Recv).await;
        assert_eq!(h.engine.open_routers(), 1);

        event_types(&mut b_rx);
        let left = h.sfu.leave(a, VOICE).await.unwrap();
        assert_eq!(left.remaining, 1);
        assert!(!left.session_closed);
        assert_eq!(event_types(&mut b_rx), vec![EVENT_PARTICIPANT_LEFT]);

        let left = h.sfu.leave(b, VOICE).await.unwrap();
        assert!(left.session_closed);
        assert!(h.sfu.active_sessions().is_empty());
        assert_eq!(h.engine.open_routers(), 0);
        assert_eq!(h.engine.open_transports(), 0);
        assert_eq!(h.sfu.leave(b, VOICE).await.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn transport_is_unusable_until_connect_completes() {
        let h = Arc::new(harness());
        let (a, _a_rx) = h.connect(1);
        let (b, _b_rx) = h.connect(2);
        h.sfu.join(a, VOICE).await.unwrap();
        h.sfu.join(b, VOICE).await.unwrap();
        let send = h.ready(a, TransportDirection::Send).await;
        let producer = h
            .sfu
            .produce(a, VOICE, send, MediaKind::Audio, json!({ "codecs": [] }), None)
            .await
            .unwrap();
        let recv = h
            .sfu
            .create_transport(b, VOICE, TransportDirection::Recv)
            .await
            .unwrap();

        h.engine.set_latency(Duration::from_millis(300));
        h.engine.fail_next(LoopbackOp::ConnectTransport);
        let connecting = {
            let h = h.clone();
            tokio::spawn(async move {
                h.sfu
                    .connect_transport(b, VOICE, recv.transport_id, json!({ "role": "client" }))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = h
            .sfu
            .consume(b, VOICE, recv.transport_id, producer.producer_id, json!({ "codecs": [] }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state_error");
        let err = h
            .sfu
            .connect_transport(b, VOICE, recv.transport_id, json!({ "role": "client" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state_error");

        assert!(connecting.await.unwrap().is_err());
        assert_eq!(h.engine.open_consumers(), 0);
        assert!(!h.engine.is_open(MediaHandle::Transport(recv.transport_id)));

        h.engine.set_latency(Duration::ZERO);
        h.ready(b, TransportDirection::Recv).await;
    }

    #[tokio::test]
    async fn cleanup_discards_in_flight_signaling() {
        let h = Arc::new(harness());
        let (a, _rx) = h.connect(1);
        h.sfu.join(a, VOICE).await.unwrap();
        h.engine.set_latency(Duration::from_millis(100));

        let inflight = {
            let h = h.clone();
            tokio::spawn(async move {
                h.sfu
                    .create_transport(a, VOICE, TransportDirection::Send)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registry.deregister(a.connection_id);
        assert_eq!(h.sfu.cleanup_connection(a).await, 1);

        let err = inflight.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "state_error");
        assert_eq!(h.engine.open_transports(), 0);
        assert!(h.sfu.active_sessions().is_empty());
    }
}
