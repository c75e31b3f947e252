use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::media::{HostAction, MediaKind, MediaParams, TransportDirection};
use crate::room::RoomKey;
use crate::{ChannelId, MessageId, UserId};

// Client -> Server ops
pub const OP_IDENTIFY: &str = "identify";
pub const OP_HEARTBEAT: &str = "heartbeat";
pub const OP_SET_STATUS: &str = "set-status";
pub const OP_JOIN_ROOM: &str = "join-room";
pub const OP_LEAVE_ROOM: &str = "leave-room";
pub const OP_PUBLISH_MESSAGE: &str = "publish-message";
pub const OP_MARK_READ: &str = "mark-read";
pub const OP_THREAD_TYPING: &str = "thread-typing";
pub const OP_SFU_JOIN: &str = "sfu-join";
pub const OP_SFU_LEAVE: &str = "sfu-leave";
pub const OP_SFU_CREATE_TRANSPORT: &str = "sfu-create-transport";
pub const OP_SFU_CONNECT_TRANSPORT: &str = "sfu-connect-transport";
pub const OP_SFU_PRODUCE: &str = "sfu-produce";
pub const OP_SFU_CONSUME: &str = "sfu-consume";
pub const OP_SFU_CLOSE_PRODUCER: &str = "sfu-close-producer";
pub const OP_SFU_HOST_ACTION: &str = "sfu-host-action";

// Server -> Client events
pub const EVENT_HELLO: &str = "hello";
pub const EVENT_AUTHENTICATED: &str = "authenticated";
pub const EVENT_HEARTBEAT_ACK: &str = "heartbeat-ack";
pub const EVENT_ACK: &str = "ack";
pub const EVENT_ERROR: &str = "error";

// Room fan-out
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_READ_RECEIPT: &str = "read-receipt";
pub const EVENT_THREAD_TYPING: &str = "thread-typing";
pub const EVENT_THREAD_SUMMARY_UPDATED: &str = "thread-summary-updated";

// Presence
pub const EVENT_PRESENCE_UPDATE: &str = "presence-update";

// Media signaling
pub const EVENT_PRODUCER_AVAILABLE: &str = "producer-available";
pub const EVENT_PRODUCER_CLOSED: &str = "producer-closed";
pub const EVENT_PARTICIPANT_JOINED: &str = "participant-joined";
pub const EVENT_PARTICIPANT_LEFT: &str = "participant-left";
pub const EVENT_HOST_ACTION: &str = "host-action";

/// Close code sent when the credential is missing or rejected.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
/// Close code sent when the heartbeat deadline passes.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;
/// Close code sent when the server is draining.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frame sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Frame pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    pub t: String,
    /// Per-room delivery sequence for room-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServerFrame {
    pub fn event(t: &str, s: Option<u64>, d: serde_json::Value) -> Self {
        Self {
            t: t.to_string(),
            s,
            d,
            request_id: None,
        }
    }

    pub fn reply(t: &str, request_id: Option<String>, d: serde_json::Value) -> Self {
        Self {
            t: t.to_string(),
            s: None,
            d,
            request_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticated {
    #[serde(with = "crate::id_str")]
    pub connection_id: i64,
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatus {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: RoomKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessage {
    pub room_id: RoomKey,
    pub payload: serde_json::Value,
    #[serde(with = "crate::id_str::option", default)]
    pub message_id: Option<MessageId>,
    #[serde(with = "crate::id_str::option", default)]
    pub thread_parent_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub room_id: RoomKey,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadTypingRequest {
    #[serde(with = "crate::id_str")]
    pub thread_parent_id: MessageId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuChannel {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuCreateTransport {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuConnectTransport {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub transport_id: i64,
    pub dtls_parameters: MediaParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuProduce {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub transport_id: i64,
    pub kind: MediaKind,
    pub rtp_parameters: MediaParams,
    #[serde(default)]
    pub app_data: Option<MediaParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuConsume {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub transport_id: i64,
    #[serde(with = "crate::id_str")]
    pub producer_id: i64,
    pub rtp_capabilities: MediaParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuCloseProducer {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub producer_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuHostAction {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub target_user_id: UserId,
    pub action: HostAction,
}
