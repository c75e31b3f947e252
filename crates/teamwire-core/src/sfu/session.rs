use std::collections::HashMap;

use chrono::{DateTime, Utc};
use teamwire_media::MediaHandle;
use teamwire_models::media::{
    MediaKind, MediaParams, ParticipantInfo, ProducerAvailable, TransportDirection, TransportState,
};
use teamwire_models::{ChannelId, ConnectionId, UserId};

use crate::registry::Caller;

/// A WebRTC transport as tracked by the core. `pending` is set while the engine call
/// that creates it is still in flight.
#[derive(Debug, Clone)]
pub struct Transport {
    pub id: i64,
    pub direction: TransportDirection,
    pub state: TransportState,
    pub dtls_parameters: Option<MediaParams>,
    pub pending: bool,
}

impl Transport {
    pub fn pending(id: i64, direction: TransportDirection) -> Self {
        Self {
            id,
            direction,
            state: TransportState::Created,
            dtls_parameters: None,
            pending: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.pending && self.state == TransportState::Connected
    }
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub id: i64,
    pub kind: MediaKind,
    pub transport_id: i64,
    pub app_data: Option<MediaParams>,
    pub pending: bool,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: i64,
    pub producer_id: i64,
    pub transport_id: i64,
    pub pending: bool,
}

/// One user's presence in a media session.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    /// Fresh per join; in-flight signaling compares against it before committing.
    pub generation: u64,
    pub joined_at: DateTime<Utc>,
    pub send_transport: Option<Transport>,
    pub recv_transport: Option<Transport>,
    pub producers: HashMap<i64, Producer>,
    pub consumers: HashMap<i64, Consumer>,
}

impl Participant {
    pub fn new(caller: Caller, generation: u64) -> Self {
        Self {
            user_id: caller.user_id,
            connection_id: caller.connection_id,
            generation,
            joined_at: Utc::now(),
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn slot_mut(&mut self, direction: TransportDirection) -> &mut Option<Transport> {
        match direction {
            TransportDirection::Send => &mut self.send_transport,
            TransportDirection::Recv => &mut self.recv_transport,
        }
    }

    pub fn transport_mut(&mut self, transport_id: i64) -> Option<&mut Transport> {
        self.send_transport
            .as_mut()
            .filter(|t| t.id == transport_id)
            .or(self.recv_transport.as_mut().filter(|t| t.id == transport_id))
    }

    /// Producer ids of the given kinds that clients have been told about.
    pub fn live_producer_ids(&self, kinds: &[MediaKind]) -> Vec<i64> {
        self.producers
            .values()
            .filter(|p| !p.pending && kinds.contains(&p.kind))
            .map(|p| p.id)
            .collect()
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id,
            joined_at: self.joined_at,
        }
    }
}

/// Resources detached from a session that still have to be released on the engine.
/// Entries whose creation is still in flight are left out; the in-flight call
/// notices the participant is gone and releases them itself.
#[derive(Debug, Default)]
pub struct Teardown {
    pub transports: Vec<Transport>,
    pub producers: Vec<Producer>,
    pub consumers: Vec<Consumer>,
}

impl Teardown {
    /// Consumers first, then producers, then transports.
    pub fn handles(&self) -> Vec<MediaHandle> {
        let consumers = self
            .consumers
            .iter()
            .filter(|c| !c.pending)
            .map(|c| MediaHandle::Consumer(c.id));
        let producers = self
            .producers
            .iter()
            .filter(|p| !p.pending)
            .map(|p| MediaHandle::Producer(p.id));
        let transports = self
            .transports
            .iter()
            .filter(|t| !t.pending)
            .map(|t| MediaHandle::Transport(t.id));
        consumers.chain(producers).chain(transports).collect()
    }

    /// Producers other participants were told about; each needs a `producer-closed`.
    pub fn announced_producers(&self) -> impl Iterator<Item = &Producer> {
        self.producers.iter().filter(|p| !p.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

/// Media session of one voice/video channel. Exists only while someone is in it.
#[derive(Debug)]
pub struct MediaSession {
    pub channel_id: ChannelId,
    /// Engine router backing this session; never reused by a later session.
    pub router_id: i64,
    pub participants: HashMap<UserId, Participant>,
    pub created_at: DateTime<Utc>,
}

impl MediaSession {
    pub fn new(channel_id: ChannelId, router_id: i64) -> Self {
        Self {
            channel_id,
            router_id,
            participants: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// The participant record of this exact connection.
    pub fn participant_of(&mut self, caller: Caller) -> Option<&mut Participant> {
        self.participants
            .get_mut(&caller.user_id)
            .filter(|p| p.connection_id == caller.connection_id)
    }

    /// The participant with this generation, if it is still joined.
    pub fn participant_at(&mut self, user_id: UserId, generation: u64) -> Option<&mut Participant> {
        self.participants
            .get_mut(&user_id)
            .filter(|p| p.generation == generation)
    }

    /// Owner and record of a producer that has been announced.
    pub fn producer(&self, producer_id: i64) -> Option<(UserId, &Producer)> {
        self.participants.values().find_map(|p| {
            p.producers
                .get(&producer_id)
                .filter(|producer| !producer.pending)
                .map(|producer| (p.user_id, producer))
        })
    }

    pub fn announced_producers(&self) -> Vec<ProducerAvailable> {
        self.participants
            .values()
            .flat_map(|p| {
                p.producers
                    .values()
                    .filter(|producer| !producer.pending)
                    .map(|producer| ProducerAvailable {
                        channel_id: self.channel_id,
                        producer_id: producer.id,
                        kind: producer.kind,
                        participant_id: p.user_id,
                    })
            })
            .collect()
    }

    pub fn participant_infos(&self) -> Vec<ParticipantInfo> {
        self.participants.values().map(Participant::info).collect()
    }

    pub fn connection_ids(&self, except: Option<UserId>) -> Vec<ConnectionId> {
        self.participants
            .values()
            .filter(|p| Some(p.user_id) != except)
            .map(|p| p.connection_id)
            .collect()
    }

    /// Remove consumers of the given producers from every participant.
    fn detach_consumers_of(&mut self, producer_ids: &[i64]) -> Vec<Consumer> {
        let mut detached = Vec::new();
        for participant in self.participants.values_mut() {
            participant.consumers.retain(|_, consumer| {
                if producer_ids.contains(&consumer.producer_id) {
                    detached.push(consumer.clone());
                    false
                } else {
                    true
                }
            });
        }
        detached
    }

    /// Close one producer and every consumer fed by it.
    pub fn remove_producer(&mut self, producer_id: i64) -> Option<(UserId, Teardown)> {
        let (owner, producer) = self.participants.values_mut().find_map(|p| {
            let is_live = p.producers.get(&producer_id).is_some_and(|x| !x.pending);
            if is_live {
                p.producers.remove(&producer_id).map(|producer| (p.user_id, producer))
            } else {
                None
            }
        })?;
        let consumers = self.detach_consumers_of(&[producer_id]);
        Some((
            owner,
            Teardown {
                transports: Vec::new(),
                producers: vec![producer],
                consumers,
            },
        ))
    }

    /// Close one transport and everything carried on it, including other
    /// participants' consumers of producers sent over it.
    pub fn remove_transport(&mut self, user_id: UserId, transport_id: i64) -> Option<Teardown> {
        let participant = self.participants.get_mut(&user_id)?;
        let slot = if participant
            .send_transport
            .as_ref()
            .is_some_and(|t| t.id == transport_id)
        {
            &mut participant.send_transport
        } else {
            &mut participant.recv_transport
        };
        let transport = slot.take_if(|t| t.id == transport_id)?;

        let mut teardown = Teardown::default();
        participant.producers.retain(|_, producer| {
            if producer.transport_id == transport_id {
                teardown.producers.push(producer.clone());
                false
            } else {
                true
            }
        });
        participant.consumers.retain(|_, consumer| {
            if consumer.transport_id == transport_id {
                teardown.consumers.push(consumer.clone());
                false
            } else {
                true
            }
        });
        teardown.transports.push(transport);

        let producer_ids: Vec<i64> = teardown.producers.iter().map(|p| p.id).collect();
        teardown
            .consumers
            .extend(self.detach_consumers_of(&producer_ids));
        Some(teardown)
    }

    /// Remove a participant with everything it owns, plus consumers of its producers.
    pub fn remove_participant(&mut self, user_id: UserId) -> Option<(Participant, Teardown)> {
        let mut participant = self.participants.remove(&user_id)?;
        let mut teardown = Teardown {
            transports: participant
                .send_transport
                .take()
                .into_iter()
                .chain(participant.recv_transport.take())
                .collect(),
            producers: participant.producers.drain().map(|(_, p)| p).collect(),
            consumers: participant.consumers.drain().map(|(_, c)| c).collect(),
        };
        let producer_ids: Vec<i64> = teardown.producers.iter().map(|p| p.id).collect();
        teardown
            .consumers
            .extend(self.detach_consumers_of(&producer_ids));
        Some((participant, teardown))
    }
}
