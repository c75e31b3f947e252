mod dispatch;
mod handler;
mod limits;
mod session;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use teamwire_core::RealtimeService;
use tokio::task::JoinHandle;

pub use limits::GatewayConfig;
use limits::UserRateLimits;

/// Shared state of the WebSocket gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub service: RealtimeService,
    pub config: Arc<GatewayConfig>,
    limits: Arc<UserRateLimits>,
    active: Arc<AtomicUsize>,
}

impl GatewayState {
    pub fn new(service: RealtimeService, config: GatewayConfig) -> Self {
        let limits = Arc::new(UserRateLimits::new(&config));
        Self {
            service,
            config: Arc::new(config),
            limits,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sockets currently holding a gateway slot, identified or not.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Periodically prune idle rate-limiter entries so memory stays bounded.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let limits = self.limits.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                limits.prune();
                tracing::trace!("rate limiter cleanup: pruned stale entries");
            }
        })
    }
}

pub fn gateway_router() -> Router<GatewayState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state))
}
