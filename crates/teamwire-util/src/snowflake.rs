use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z
const TEAMWIRE_EPOCH: u64 = 1_735_689_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;

/// Snowflake generator.
/// Format: 42 bits timestamp | 10 bits worker | 12 bits sequence
///
/// The timestamp and sequence are packed into one atomic so ids from a single
/// generator are strictly increasing even when the wall clock stalls or steps back.
#[derive(Debug)]
pub struct Snowflake {
    worker_id: u64,
    /// `(millis since epoch << SEQUENCE_BITS) | sequence` of the last issued id.
    last: AtomicU64,
}

impl Snowflake {
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id as u64 & WORKER_MASK,
            last: AtomicU64::new(0),
        }
    }

    /// Generator with a random worker id, for processes that don't configure one.
    pub fn random_worker() -> Self {
        Self::new(rand::random::<u16>())
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id as u16
    }

    pub fn next_id(&self) -> i64 {
        let now = now_millis().saturating_sub(TEAMWIRE_EPOCH) << SEQUENCE_BITS;
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            // Same or earlier millisecond: bump the sequence, spilling into the
            // timestamp bits when it wraps.
            let next = if now > current { now } else { current + 1 };
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    let timestamp = next >> SEQUENCE_BITS;
                    let seq = next & SEQUENCE_MASK;
                    let id = (timestamp << (WORKER_BITS + SEQUENCE_BITS))
                        | (self.worker_id << SEQUENCE_BITS)
                        | seq;
                    return id as i64;
                }
                Err(observed) => current = observed,
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(TEAMWIRE_EPOCH)
}

/// Extract the Unix timestamp (ms) from a snowflake.
pub fn timestamp_millis(id: i64) -> u64 {
    ((id as u64) >> (WORKER_BITS + SEQUENCE_BITS)) + TEAMWIRE_EPOCH
}
