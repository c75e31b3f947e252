use serde::{Deserialize, Serialize};

use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Dnd,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Dnd => "dnd",
            PresenceStatus::Offline => "offline",
        }
    }

    /// Lenient parse for client-supplied status strings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => Some(PresenceStatus::Online),
            "away" | "idle" => Some(PresenceStatus::Away),
            "dnd" => Some(PresenceStatus::Dnd),
            "offline" | "invisible" => Some(PresenceStatus::Offline),
            _ => None,
        }
    }
}

/// Payload of the `presence-update` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    pub status: PresenceStatus,
}
