pub mod auth;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod fanout;
pub mod member_index;
pub mod observability;
pub mod permissions;
pub mod registry;
pub mod rooms;
pub mod service;
pub mod sfu;
pub mod threads;

use std::time::Duration;

pub use error::CoreError;
pub use registry::Caller;
pub use service::{Collaborators, RealtimeService};

/// Limits and timeouts of the realtime core.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// Further connections of a user beyond this are rejected.
    pub max_connections_per_user: usize,
    pub max_rooms_per_connection: usize,
    /// How many recent activity entries each room keeps for unread counting.
    pub activity_window: usize,
    /// Participants allowed in one media session.
    pub max_participants: usize,
    /// Deadline for any single collaborator call (auth, directory, store, media engine).
    pub collaborator_timeout: Duration,
    pub authz_cache_ttl: Duration,
    pub authz_retry_attempts: u32,
    pub event_bus_capacity: usize,
    /// Snowflake worker id; must differ between instances sharing an id space.
    pub worker_id: u16,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 8,
            max_rooms_per_connection: 500,
            activity_window: 1000,
            max_participants: 50,
            collaborator_timeout: Duration::from_secs(5),
            authz_cache_ttl: Duration::from_secs(60),
            authz_retry_attempts: 3,
            event_bus_capacity: 4096,
            worker_id: 0,
        }
    }
}
