use std::sync::Arc;

use teamwire_models::gateway::ServerFrame;
use teamwire_models::room::RoomKey;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: &'static str,
    /// Shared between every recipient of one publish.
    pub payload: Arc<serde_json::Value>,
    /// Room this event was published to, if it is room-scoped.
    pub room: Option<RoomKey>,
    /// Per-room delivery sequence, assigned inside the room's critical section.
    pub sequence: Option<u64>,
}

impl ServerEvent {
    /// An event delivered straight to connections, outside any room sequence.
    pub fn direct(event_type: &'static str, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload: Arc::new(payload),
            room: None,
            sequence: None,
        }
    }

    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::event(self.event_type, self.sequence, (*self.payload).clone())
    }
}

/// Outbound queue of one connection. The gateway task owns the receiving end.
pub type EventSink = mpsc::UnboundedSender<ServerEvent>;
pub type EventStream = mpsc::UnboundedReceiver<ServerEvent>;

pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// Broadcast-based bus for process-wide events (presence). A multi-instance
/// deployment replaces this with an external backbone.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ServerEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Helper: publish a typed event
    pub fn dispatch(&self, event_type: &'static str, payload: serde_json::Value) {
        self.publish(ServerEvent::direct(event_type, payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn bus_fans_out_to_every_subscriber() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.dispatch("presence-update", json!({ "userId": "1", "status": "online" }));
        assert_eq!(a.recv().await.unwrap().event_type, "presence-update");
        assert_eq!(b.recv().await.unwrap().payload["status"], "online");
    }

    #[test]
    fn frame_carries_sequence() {
        let mut event = ServerEvent::direct("message", json!({ "id": "5" }));
        event.sequence = Some(3);
        let frame = event.to_frame();
        assert_eq!(frame.t, "message");
        assert_eq!(frame.s, Some(3));
        assert_eq!(frame.d["id"], "5");
    }
}
