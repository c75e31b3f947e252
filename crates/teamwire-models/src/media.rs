use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChannelId, UserId};

/// Opaque media-engine payload (ICE/DTLS/RTP parameters). The core checks shape only.
pub type MediaParams = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    /// DTLS parameters were accepted and the engine call is in flight.
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostAction {
    /// Force-close the target's audio producers.
    Mute,
    /// Force-close the target's video and screen producers.
    StopVideo,
    /// Remove the target from the media session.
    Kick,
}

/// Payload of the `producer-available` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAvailable {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub producer_id: i64,
    pub kind: MediaKind,
    #[serde(with = "crate::id_str")]
    pub participant_id: UserId,
}

/// Payload of the `producer-closed` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub producer_id: i64,
}

/// Payload of `participant-joined` / `participant-left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantChange {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
}

/// Payload of the `host-action` push sent to the target of a host action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostActionNotice {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    pub action: HostAction,
    #[serde(with = "crate::id_str")]
    pub by_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

/// Reply to `sfu-join`: who is already there and what can be consumed right away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJoined {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    pub participants: Vec<ParticipantInfo>,
    pub producers: Vec<ProducerAvailable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub transport_id: i64,
    pub direction: TransportDirection,
    /// ICE/DTLS parameters from the media engine, passed through untouched.
    pub params: MediaParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerCreated {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub producer_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCreated {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    #[serde(with = "crate::id_str")]
    pub consumer_id: i64,
    #[serde(with = "crate::id_str")]
    pub producer_id: i64,
    pub kind: MediaKind,
    pub params: MediaParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLeft {
    #[serde(with = "crate::id_str")]
    pub channel_id: ChannelId,
    pub remaining: usize,
    pub session_closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_actions_are_kebab_case() {
        assert_eq!(serde_json::to_value(HostAction::StopVideo).unwrap(), json!("stop-video"));
        let action: HostAction = serde_json::from_value(json!("kick")).unwrap();
        assert_eq!(action, HostAction::Kick);
    }

    #[test]
    fn join_reply_encodes_ids_as_strings() {
        let joined = SessionJoined {
            channel_id: 4,
            participants: vec![],
            producers: vec![ProducerAvailable {
                channel_id: 4,
                producer_id: 11,
                kind: MediaKind::Audio,
                participant_id: 2,
            }],
        };
        let value = serde_json::to_value(&joined).unwrap();
        assert_eq!(value["channelId"], "4");
        assert_eq!(value["producers"][0]["producerId"], "11");
        assert_eq!(value["producers"][0]["participantId"], "2");
    }
}
