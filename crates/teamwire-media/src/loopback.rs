use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use teamwire_models::media::{MediaKind, MediaParams, TransportDirection};

use crate::engine::{EngineError, MediaEngine, MediaHandle};

/// Engine call names accepted by [`LoopbackEngine::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackOp {
    CreateTransport,
    ConnectTransport,
    Produce,
    Consume,
}

/// In-process media engine for development and tests. It keeps the same resource
/// graph a real SFU keeps (router -> transports -> producers/consumers) but moves no media.
#[derive(Default)]
pub struct LoopbackEngine {
    routers: DashMap<i64, ()>,
    /// transport -> router
    transports: DashMap<i64, i64>,
    producers: DashMap<i64, i64>,
    /// consumer -> (transport, producer)
    consumers: DashMap<i64, (i64, i64)>,
    latency_ms: AtomicU64,
    failures: Mutex<Vec<LoopbackOp>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to exercise races between signaling and cleanup.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make the next call of `op` fail with `Rejected`.
    pub fn fail_next(&self, op: LoopbackOp) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(op);
        }
    }

    pub fn open_routers(&self) -> usize {
        self.routers.len()
    }

    pub fn open_transports(&self) -> usize {
        self.transports.len()
    }

    pub fn open_producers(&self) -> usize {
        self.producers.len()
    }

    pub fn open_consumers(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_open(&self, handle: MediaHandle) -> bool {
        match handle {
            MediaHandle::Transport(id) => self.transports.contains_key(&id),
            MediaHandle::Producer(id) => self.producers.contains_key(&id),
            MediaHandle::Consumer(id) => self.consumers.contains_key(&id),
        }
    }

    async fn step(&self, op: Option<LoopbackOp>) -> Result<(), EngineError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let Some(op) = op else {
            return Ok(());
        };
        let injected = match self.failures.lock() {
            Ok(mut failures) => match failures.iter().position(|f| *f == op) {
                Some(idx) => {
                    failures.remove(idx);
                    true
                }
                None => false,
            },
            Err(_) => false,
        };
        if injected {
            return Err(EngineError::Rejected(format!("injected failure: {op:?}")));
        }
        Ok(())
    }

    fn close_producer_graph(&self, producer_id: i64) {
        self.producers.remove(&producer_id);
        self.consumers.retain(|_, (_, producer)| *producer != producer_id);
    }

    fn close_transport_graph(&self, transport_id: i64) {
        self.transports.remove(&transport_id);
        let producers: Vec<i64> = self
            .producers
            .iter()
            .filter(|p| *p.value() == transport_id)
            .map(|p| *p.key())
            .collect();
        for producer_id in producers {
            self.close_producer_graph(producer_id);
        }
        self.consumers
            .retain(|_, (transport, _)| *transport != transport_id);
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_transport(
        &self,
        router_id: i64,
        transport_id: i64,
        direction: TransportDirection,
    ) -> Result<MediaParams, EngineError> {
        self.step(Some(LoopbackOp::CreateTransport)).await?;
        self.routers.insert(router_id, ());
        self.transports.insert(transport_id, router_id);
        Ok(json!({
            "id": transport_id.to_string(),
            "direction": direction,
            "iceParameters": { "usernameFragment": format!("lb{transport_id}"), "password": "loopback" },
            "iceCandidates": [],
            "dtlsParameters": { "role": "auto", "fingerprints": [] },
        }))
    }

    async fn connect_transport(
        &self,
        transport_id: i64,
        _dtls_parameters: &MediaParams,
    ) -> Result<(), EngineError> {
        self.step(Some(LoopbackOp::ConnectTransport)).await?;
        if !self.transports.contains_key(&transport_id) {
            return Err(EngineError::Rejected(format!(
                "unknown transport {transport_id}"
            )));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: i64,
        producer_id: i64,
        _kind: MediaKind,
        _rtp_parameters: &MediaParams,
        _app_data: Option<&MediaParams>,
    ) -> Result<(), EngineError> {
        self.step(Some(LoopbackOp::Produce)).await?;
        if !self.transports.contains_key(&transport_id) {
            return Err(EngineError::Rejected(format!(
                "unknown transport {transport_id}"
            )));
        }
        self.producers.insert(producer_id, transport_id);
        Ok(())
    }

    async fn consume(
        &self,
        transport_id: i64,
        consumer_id: i64,
        producer_id: i64,
        _rtp_capabilities: &MediaParams,
    ) -> Result<MediaParams, EngineError> {
        self.step(Some(LoopbackOp::Consume)).await?;
        if !self.transports.contains_key(&transport_id) {
            return Err(EngineError::Rejected(format!(
                "unknown transport {transport_id}"
            )));
        }
        if !self.producers.contains_key(&producer_id) {
            return Err(EngineError::Rejected(format!(
                "unknown producer {producer_id}"
            )));
        }
        self.consumers
            .insert(consumer_id, (transport_id, producer_id));
        Ok(json!({
            "id": consumer_id.to_string(),
            "producerId": producer_id.to_string(),
            "rtpParameters": { "codecs": [], "encodings": [] },
        }))
    }

    async fn close(&self, handle: MediaHandle) -> Result<(), EngineError> {
        self.step(None).await?;
        match handle {
            MediaHandle::Transport(id) => self.close_transport_graph(id),
            MediaHandle::Producer(id) => self.close_producer_graph(id),
            MediaHandle::Consumer(id) => {
                self.consumers.remove(&id);
            }
        }
        Ok(())
    }

    async fn release_router(&self, router_id: i64) -> Result<(), EngineError> {
        self.step(None).await?;
        self.routers.remove(&router_id);
        let transports: Vec<i64> = self
            .transports
            .iter()
            .filter(|t| *t.value() == router_id)
            .map(|t| *t.key())
            .collect();
        if !transports.is_empty() {
            tracing::debug!(router_id, leaked = transports.len(), "router released with open transports");
        }
        for transport_id in transports {
            self.close_transport_graph(transport_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closing_a_transport_cascades() {
        let engine = LoopbackEngine::new();
        let params = json!({ "x": 1 });
        engine
            .create_transport(1, 10, TransportDirection::Send)
            .await
            .unwrap();
        engine
            .create_transport(1, 11, TransportDirection::Recv)
            .await
            .unwrap();
        engine
            .produce(10, 20, MediaKind::Audio, &params, None)
            .await
            .unwrap();
        engine.consume(11, 30, 20, &params).await.unwrap();
        assert_eq!(engine.open_consumers(), 1);

        engine.close(MediaHandle::Transport(10)).await.unwrap();
        assert_eq!(engine.open_producers(), 0);
        assert_eq!(engine.open_consumers(), 0);
        assert!(engine.is_open(MediaHandle::Transport(11)));
    }

    #[tokio::test]
    async fn injected_failure_hits_once() {
        let engine = LoopbackEngine::new();
        engine.fail_next(LoopbackOp::CreateTransport);
        assert!(engine
            .create_transport(1, 10, TransportDirection::Send)
            .await
            .is_err());
        assert!(engine
            .create_transport(1, 10, TransportDirection::Send)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn release_router_closes_its_transports_only() {
        let engine = LoopbackEngine::new();
        engine
            .create_transport(1, 10, TransportDirection::Send)
            .await
            .unwrap();
        engine
            .create_transport(2, 11, TransportDirection::Send)
            .await
            .unwrap();
        assert_eq!(engine.open_routers(), 2);
        engine.release_router(1).await.unwrap();
        assert_eq!(engine.open_routers(), 1);
        assert_eq!(engine.open_transports(), 1);
        assert!(engine.is_open(MediaHandle::Transport(11)));
    }
}
