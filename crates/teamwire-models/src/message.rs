use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::room::RoomKey;
use crate::{MessageId, UserId};

/// A chat message as relayed to live subscribers. The content is opaque to the core;
/// persistence and history belong to the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    #[serde(with = "crate::id_str")]
    pub id: MessageId,
    pub room_id: RoomKey,
    #[serde(with = "crate::id_str")]
    pub author_id: UserId,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(
        with = "crate::id_str::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thread_parent_id: Option<MessageId>,
}

/// Payload of the `read-receipt` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    pub room_id: RoomKey,
    pub read_at: DateTime<Utc>,
}
