//! Seams to the services this core depends on but does not own.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teamwire_models::room::{RoomKey, RoomKind, Role};
use teamwire_models::{ChannelId, MessageId, UserId};
use thiserror::Error;

pub use teamwire_media::{EngineError, MediaEngine, MediaHandle};

use crate::error::CoreError;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// A definite negative answer (bad token, unknown user). Never retried.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<CollaboratorError> for CoreError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Rejected(msg) => CoreError::BadRequest(msg),
            CollaboratorError::Unavailable(msg) => CoreError::Collaborator(msg),
        }
    }
}

/// Turns an opaque credential into the user it belongs to.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId, CollaboratorError>;
}

/// Durable membership and roles, owned by the external store.
#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    /// `None` when the room does not exist.
    async fn room_kind(&self, room: &RoomKey) -> Result<Option<RoomKind>, CollaboratorError>;

    async fn is_member(&self, user_id: UserId, room: &RoomKey) -> Result<bool, CollaboratorError>;

    async fn role_of(&self, user_id: UserId, channel_id: ChannelId)
        -> Result<Role, CollaboratorError>;

    /// Room the thread's parent message was posted in; `None` for unknown parents.
    async fn thread_room(&self, parent_id: MessageId) -> Result<Option<RoomKey>, CollaboratorError>;
}

/// Durable read cursors. Implementations keep the max of what they are given.
#[async_trait]
pub trait ReadStateStore: Send + Sync {
    async fn save_cursor(
        &self,
        user_id: UserId,
        room: &RoomKey,
        read_at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError>;
}

/// Run one collaborator call under a deadline.
pub async fn bounded<T, E, F>(what: &'static str, timeout: Duration, call: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<CoreError>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!(collaborator = what, timeout_ms = timeout.as_millis() as u64, "collaborator call timed out");
            Err(CoreError::Timeout(what))
        }
    }
}

/// Retry an idempotent read on transient failures, up to `attempts` tries in total.
pub async fn retry_read<T, F, Fut>(what: &'static str, attempts: u32, mut call: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::debug!(collaborator = what, attempt, error = %err, "retrying read");
                tokio::time::sleep(Duration::from_millis(25 * attempt as u64)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn bounded_maps_elapsed_deadline() {
        let result: Result<(), CoreError> = bounded("auth verifier", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, CollaboratorError>(())
        })
        .await;
        assert_eq!(result, Err(CoreError::Timeout("auth verifier")));
    }

    #[tokio::test]
    async fn retry_read_stops_on_definite_answers() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CoreError> = retry_read("authorization store", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::BadRequest("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_read_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = retry_read("authorization store", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(CoreError::Collaborator("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }
}
