use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, UserId};

/// Reply-count and last-reply time of a thread rooted at a parent message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub reply_count: u64,
    pub last_reply_at: Option<DateTime<Utc>>,
}

/// Payload of the `thread-summary-updated` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummaryUpdated {
    #[serde(with = "crate::id_str")]
    pub parent_id: MessageId,
    pub reply_count: u64,
    pub last_reply_at: Option<DateTime<Utc>>,
}

/// Payload of the `thread-typing` relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadTyping {
    #[serde(with = "crate::id_str")]
    pub parent_id: MessageId,
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    pub is_typing: bool,
}
