use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ChannelId, MessageId};

/// A logical fan-out scope that connections subscribe to.
///
/// Serialized on the wire as `channel:<id>`, `dm:<id>` or `thread:<parent id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKey {
    Channel(ChannelId),
    Dm(ChannelId),
    Thread(MessageId),
}

impl RoomKey {
    pub fn id(&self) -> i64 {
        match *self {
            RoomKey::Channel(id) | RoomKey::Dm(id) | RoomKey::Thread(id) => id,
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, RoomKey::Thread(_))
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Channel(id) => write!(f, "channel:{id}"),
            RoomKey::Dm(id) => write!(f, "dm:{id}"),
            RoomKey::Thread(id) => write!(f, "thread:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room key '{0}'")]
pub struct InvalidRoomKey(pub String);

impl FromStr for RoomKey {
    type Err = InvalidRoomKey;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRoomKey(raw.to_string());
        let (scope, id) = raw.split_once(':').ok_or_else(invalid)?;
        let id = id.parse::<i64>().map_err(|_| invalid())?;
        match scope {
            "channel" => Ok(RoomKey::Channel(id)),
            "dm" => Ok(RoomKey::Dm(id)),
            "thread" => Ok(RoomKey::Thread(id)),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for RoomKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What kind of room a key resolves to in the durable directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Text,
    Voice,
    Video,
    Dm,
    Thread,
}

impl RoomKind {
    /// Only voice and video channels can host a media session.
    pub fn supports_media(self) -> bool {
        matches!(self, RoomKind::Voice | RoomKind::Video)
    }
}

/// Role of a user inside a channel's scope, as reported by the authorization store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Host,
    Owner,
}

impl Role {
    pub fn is_elevated(self) -> bool {
        matches!(self, Role::Host | Role::Owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_scope() {
        assert_eq!("channel:12".parse::<RoomKey>().unwrap(), RoomKey::Channel(12));
        assert_eq!("dm:3".parse::<RoomKey>().unwrap(), RoomKey::Dm(3));
        assert_eq!("thread:99".parse::<RoomKey>().unwrap(), RoomKey::Thread(99));
    }

    #[test]
    fn rejects_unknown_scope_and_bad_ids() {
        assert!("guild:1".parse::<RoomKey>().is_err());
        assert!("channel:x".parse::<RoomKey>().is_err());
        assert!("channel".parse::<RoomKey>().is_err());
    }

    #[test]
    fn serde_uses_display_form() {
        let json = serde_json::to_string(&RoomKey::Thread(5)).unwrap();
        assert_eq!(json, "\"thread:5\"");
        let back: RoomKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RoomKey::Thread(5));
    }

    #[test]
    fn elevated_roles() {
        assert!(!Role::Member.is_elevated());
        assert!(Role::Host.is_elevated());
        assert!(Role::Owner.is_elevated());
        assert!(RoomKind::Voice.supports_media());
        assert!(!RoomKind::Text.supports_media());
    }
}
