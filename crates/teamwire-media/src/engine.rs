use async_trait::async_trait;
use teamwire_models::media::{MediaKind, MediaParams, TransportDirection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused the request (bad parameters, unknown handle).
    #[error("media engine rejected request: {0}")]
    Rejected(String),
    /// The engine could not be reached or answered with a server error.
    #[error("media engine unavailable: {0}")]
    Unavailable(String),
}

/// An engine-side resource created on behalf of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaHandle {
    Transport(i64),
    Producer(i64),
    Consumer(i64),
}

impl MediaHandle {
    pub fn id(&self) -> i64 {
        match *self {
            MediaHandle::Transport(id) | MediaHandle::Producer(id) | MediaHandle::Consumer(id) => {
                id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MediaHandle::Transport(_) => "transport",
            MediaHandle::Producer(_) => "producer",
            MediaHandle::Consumer(_) => "consumer",
        }
    }
}

/// The selective-forwarding media server. Ids are allocated by the caller so that a
/// resource can be released even when the call that created it lost a race.
///
/// Each media session owns one router, named by a router id that is never reused;
/// a channel that empties and fills again gets a fresh router.
///
/// Parameters are opaque: they are handed through exactly as the client sent them.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a WebRTC transport on a router and return its ICE/DTLS parameters.
    /// The router is created on first use.
    async fn create_transport(
        &self,
        router_id: i64,
        transport_id: i64,
        direction: TransportDirection,
    ) -> Result<MediaParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: i64,
        dtls_parameters: &MediaParams,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: i64,
        producer_id: i64,
        kind: MediaKind,
        rtp_parameters: &MediaParams,
        app_data: Option<&MediaParams>,
    ) -> Result<(), EngineError>;

    /// Create a consumer and return the RTP parameters the client must use to receive.
    async fn consume(
        &self,
        transport_id: i64,
        consumer_id: i64,
        producer_id: i64,
        rtp_capabilities: &MediaParams,
    ) -> Result<MediaParams, EngineError>;

    async fn close(&self, handle: MediaHandle) -> Result<(), EngineError>;

    /// Drop a router, and anything still open on it, once its media session is gone.
    async fn release_router(&self, router_id: i64) -> Result<(), EngineError>;
}
