use teamwire_core::Caller;
use tokio::time::Instant;

/// Per-socket bookkeeping of an identified connection.
pub struct Session {
    pub caller: Caller,
    pub identified_at: Instant,
    pub frames_in: u64,
    pub events_out: u64,
}

impl Session {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            identified_at: Instant::now(),
            frames_in: 0,
            events_out: 0,
        }
    }

    pub fn user_id(&self) -> i64 {
        self.caller.user_id
    }

    pub fn connection_id(&self) -> i64 {
        self.caller.connection_id
    }

    pub fn uptime_secs(&self) -> u64 {
        self.identified_at.elapsed().as_secs()
    }
}
