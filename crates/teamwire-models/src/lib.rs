pub mod gateway;
pub mod id_str;
pub mod media;
pub mod message;
pub mod presence;
pub mod room;
pub mod thread;

/// Snowflake id of a user, as asserted by the auth collaborator.
pub type UserId = i64;
/// Snowflake id of a single live gateway connection.
pub type ConnectionId = i64;
/// Snowflake id of a channel (text, voice or video).
pub type ChannelId = i64;
/// Snowflake id of a message.
pub type MessageId = i64;
