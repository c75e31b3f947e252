use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

const WIRE_TRACE_ENV: &str = "TEAMWIRE_WIRE_TRACE";
const WIRE_TRACE_PREVIEW_CHARS: usize = 512;

static WIRE_TRACE: OnceLock<bool> = OnceLock::new();

static WS_CONNECTIONS_OPEN: AtomicUsize = AtomicUsize::new(0);
static WS_CONNECTIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WS_EVENTS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static WS_FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);

/// Whether frame previews are logged on the `wire` target. Read once from the
/// environment.
pub fn wire_trace_enabled() -> bool {
    *WIRE_TRACE.get_or_init(|| {
        std::env::var(WIRE_TRACE_ENV)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    })
}

/// A log-safe prefix of a frame, cut on a char boundary.
pub fn wire_trace_payload_preview(payload: &str) -> String {
    match payload.char_indices().nth(WIRE_TRACE_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &payload[..cut]),
        None => payload.to_string(),
    }
}

pub fn ws_connection_open() {
    WS_CONNECTIONS_OPEN.fetch_add(1, Ordering::Relaxed);
    WS_CONNECTIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn ws_connection_close() {
    WS_CONNECTIONS_OPEN.fetch_sub(1, Ordering::Relaxed);
}

pub fn ws_event_dispatched() {
    WS_EVENTS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}

pub fn ws_frame_received() {
    WS_FRAMES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GatewayCounters {
    pub open_connections: usize,
    pub total_connections: u64,
    pub events_dispatched: u64,
    pub frames_received: u64,
}

pub fn gateway_counters() -> GatewayCounters {
    GatewayCounters {
        open_connections: WS_CONNECTIONS_OPEN.load(Ordering::Relaxed),
        total_connections: WS_CONNECTIONS_TOTAL.load(Ordering::Relaxed),
        events_dispatched: WS_EVENTS_DISPATCHED.load(Ordering::Relaxed),
        frames_received: WS_FRAMES_RECEIVED.load(Ordering::Relaxed),
    }
}
