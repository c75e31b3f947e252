use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use teamwire_core::member_index::MemberIndex;
use teamwire_core::RealtimeConfig;
use teamwire_media::HttpEngineConfig;
use teamwire_models::room::{RoomKey, RoomKind};
use teamwire_models::{MessageId, UserId};
use teamwire_ws::GatewayConfig;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Whether [`Config::load`] read an existing file or wrote a fresh template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Generated,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            jwt_expiry_seconds: default_jwt_expiry(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RealtimeSection {
    pub max_connections_per_user: usize,
    pub max_rooms_per_connection: usize,
    pub activity_window: usize,
    pub max_participants: usize,
    pub collaborator_timeout_ms: u64,
    pub authz_cache_ttl_seconds: u64,
    pub authz_retry_attempts: u32,
    pub event_bus_capacity: usize,
    pub worker_id: u16,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        let defaults = RealtimeConfig::default();
        Self {
            max_connections_per_user: defaults.max_connections_per_user,
            max_rooms_per_connection: defaults.max_rooms_per_connection,
            activity_window: defaults.activity_window,
            max_participants: defaults.max_participants,
            collaborator_timeout_ms: defaults.collaborator_timeout.as_millis() as u64,
            authz_cache_ttl_seconds: defaults.authz_cache_ttl.as_secs(),
            authz_retry_attempts: defaults.authz_retry_attempts,
            event_bus_capacity: defaults.event_bus_capacity,
            worker_id: defaults.worker_id,
        }
    }
}

impl RealtimeSection {
    pub fn to_realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            max_connections_per_user: self.max_connections_per_user.max(1),
            max_rooms_per_connection: self.max_rooms_per_connection.max(1),
            activity_window: self.activity_window.max(1),
            max_participants: self.max_participants.max(1),
            collaborator_timeout: Duration::from_millis(self.collaborator_timeout_ms.max(1)),
            authz_cache_ttl: Duration::from_secs(self.authz_cache_ttl_seconds),
            authz_retry_attempts: self.authz_retry_attempts.max(1),
            event_bus_capacity: self.event_bus_capacity.max(16),
            worker_id: self.worker_id,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySection {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_seconds: u64,
    pub identify_timeout_seconds: u64,
    pub max_connections: usize,
    pub max_messages_per_minute: u32,
    pub max_typing_per_minute: u32,
    pub max_signaling_per_minute: u32,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let defaults = GatewayConfig::default();
        Self {
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            heartbeat_timeout_seconds: defaults.heartbeat_timeout.as_secs(),
            identify_timeout_seconds: defaults.identify_timeout.as_secs(),
            max_connections: defaults.max_connections,
            max_messages_per_minute: defaults.max_messages_per_minute,
            max_typing_per_minute: defaults.max_typing_per_minute,
            max_signaling_per_minute: defaults.max_signaling_per_minute,
        }
    }
}

impl GatewaySection {
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_seconds),
            identify_timeout: Duration::from_secs(self.identify_timeout_seconds),
            max_connections: self.max_connections,
            max_messages_per_minute: self.max_messages_per_minute,
            max_typing_per_minute: self.max_typing_per_minute,
            max_signaling_per_minute: self.max_signaling_per_minute,
            ..GatewayConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaEngineKind {
    /// In-process engine that allocates handles without moving media.
    #[default]
    Loopback,
    Http,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub engine: MediaEngineKind,
    #[serde(default = "default_media_http_url")]
    pub http_url: String,
    #[serde(default = "default_media_api_key")]
    pub api_key: String,
    #[serde(default = "default_media_api_secret")]
    pub api_secret: String,
    #[serde(default = "default_media_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            engine: MediaEngineKind::default(),
            http_url: default_media_http_url(),
            api_key: default_media_api_key(),
            api_secret: default_media_api_secret(),
            request_timeout_ms: default_media_request_timeout_ms(),
        }
    }
}

impl MediaConfig {
    pub fn http_engine_config(&self) -> HttpEngineConfig {
        HttpEngineConfig {
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            http_url: self.http_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_millis(self.request_timeout_ms.max(1)),
        }
    }
}

/// Rooms, members and roles the in-memory directory starts with.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub rooms: Vec<RoomSeed>,
    #[serde(default)]
    pub threads: Vec<ThreadSeed>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoomSeed {
    pub id: RoomKey,
    pub kind: RoomKind,
    #[serde(default)]
    pub members: Vec<UserId>,
    /// Members holding the host role in this channel's scope.
    #[serde(default)]
    pub hosts: Vec<UserId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThreadSeed {
    pub parent_id: MessageId,
    pub room: RoomKey,
}

impl DirectoryConfig {
    /// Build the in-memory directory. Hosts are implicitly members.
    pub fn build_index(&self) -> MemberIndex {
        let index = MemberIndex::empty();
        for room in &self.rooms {
            index.add_room(room.id, room.kind);
            for &user_id in room.members.iter().chain(&room.hosts) {
                index.add_member(room.id, user_id);
            }
            for &user_id in &room.hosts {
                index.set_role(room.id.id(), user_id, teamwire_models::room::Role::Host);
            }
        }
        for thread in &self.threads {
            index.add_thread(thread.parent_id, thread.room);
        }
        index
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_jwt_expiry() -> u64 {
    900
}
fn default_media_http_url() -> String {
    "http://localhost:7880".into()
}
fn default_media_api_key() -> String {
    format!("teamwire_{}", generate_random_hex(8))
}
fn default_media_api_secret() -> String {
    generate_random_hex(32)
}
fn default_media_request_timeout_ms() -> u64 {
    4_000
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.contains("replace_with")
        || normalized.starts_with("example")
        || normalized == "devkey"
        || normalized == "devsecret"
        || normalized == "secret"
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }

    if config.media.engine == MediaEngineKind::Http
        && (looks_like_placeholder_secret(&config.media.api_key)
            || looks_like_placeholder_secret(&config.media.api_secret))
    {
        anyhow::bail!(
            "Invalid media credentials: replace placeholder api_key/api_secret values before startup"
        );
    }

    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    let realtime = &config.realtime;
    let gateway = &config.gateway;
    format!(
        r#"# Teamwire Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[auth]
jwt_secret = "{jwt_secret}"
jwt_expiry_seconds = {jwt_expiry}

[realtime]
max_connections_per_user = {max_connections_per_user}
max_rooms_per_connection = {max_rooms_per_connection}
# Recent messages kept per room for unread counting.
activity_window = {activity_window}
max_participants = {max_participants}
collaborator_timeout_ms = {collaborator_timeout_ms}
authz_cache_ttl_seconds = {authz_cache_ttl_seconds}
authz_retry_attempts = {authz_retry_attempts}
event_bus_capacity = {event_bus_capacity}
# Must differ between instances sharing an id space.
worker_id = {worker_id}

[gateway]
heartbeat_interval_ms = {heartbeat_interval_ms}
heartbeat_timeout_seconds = {heartbeat_timeout_seconds}
identify_timeout_seconds = {identify_timeout_seconds}
max_connections = {max_connections}
max_messages_per_minute = {max_messages_per_minute}
max_typing_per_minute = {max_typing_per_minute}
max_signaling_per_minute = {max_signaling_per_minute}

[media]
# "loopback" (no media moves, for development) or "http".
engine = "{media_engine}"
http_url = "{media_http_url}"
api_key = "{media_api_key}"
api_secret = "{media_api_secret}"
request_timeout_ms = {media_timeout}

[logging]
json = {log_json}

# Seed rooms for the in-memory directory:
# [[directory.rooms]]
# id = "channel:1"
# kind = "text"
# members = [1, 2]
#
# [[directory.rooms]]
# id = "channel:2"
# kind = "voice"
# members = [2]
# hosts = [1]
#
# [[directory.threads]]
# parent_id = 1000
# room = "channel:1"
"#,
        bind_address = config.server.bind_address,
        jwt_secret = config.auth.jwt_secret,
        jwt_expiry = config.auth.jwt_expiry_seconds,
        max_connections_per_user = realtime.max_connections_per_user,
        max_rooms_per_connection = realtime.max_rooms_per_connection,
        activity_window = realtime.activity_window,
        max_participants = realtime.max_participants,
        collaborator_timeout_ms = realtime.collaborator_timeout_ms,
        authz_cache_ttl_seconds = realtime.authz_cache_ttl_seconds,
        authz_retry_attempts = realtime.authz_retry_attempts,
        event_bus_capacity = realtime.event_bus_capacity,
        worker_id = realtime.worker_id,
        heartbeat_interval_ms = gateway.heartbeat_interval_ms,
        heartbeat_timeout_seconds = gateway.heartbeat_timeout_seconds,
        identify_timeout_seconds = gateway.identify_timeout_seconds,
        max_connections = gateway.max_connections,
        max_messages_per_minute = gateway.max_messages_per_minute,
        max_typing_per_minute = gateway.max_typing_per_minute,
        max_signaling_per_minute = gateway.max_signaling_per_minute,
        media_engine = match config.media.engine {
            MediaEngineKind::Loopback => "loopback",
            MediaEngineKind::Http => "http",
        },
        media_http_url = config.media.http_url,
        media_api_key = config.media.api_key,
        media_api_secret = config.media.api_secret,
        media_timeout = config.media.request_timeout_ms,
        log_json = config.logging.json,
    )
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring invalid {} value '{}'", name, value);
            None
        }
    }
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<(Self, ConfigSource)> {
        let (mut config, source) = if std::path::Path::new(path).exists() {
            let content =
                fs::read_to_string(path).with_context(|| format!("reading config '{path}'"))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing config '{path}'"))?;
            (config, ConfigSource::File)
        } else {
            let config = Config::default();

            // Ensure parent directory exists
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            (config, ConfigSource::Generated)
        };
        let _ = harden_secret_file_permissions(path);

        // Environment variable overrides
        if let Ok(value) = std::env::var("TEAMWIRE_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("TEAMWIRE_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Some(parsed) = env_parse("TEAMWIRE_JWT_EXPIRY_SECONDS") {
            config.auth.jwt_expiry_seconds = parsed;
        }
        if let Some(parsed) = env_parse("TEAMWIRE_MAX_CONNECTIONS_PER_USER") {
            config.realtime.max_connections_per_user = parsed;
        }
        if let Some(parsed) = env_parse("TEAMWIRE_MAX_PARTICIPANTS") {
            config.realtime.max_participants = parsed;
        }
        if let Some(parsed) = env_parse("TEAMWIRE_WORKER_ID") {
            config.realtime.worker_id = parsed;
        }
        if let Some(parsed) = env_parse("TEAMWIRE_GATEWAY_MAX_CONNECTIONS") {
            config.gateway.max_connections = parsed;
        }
        if let Ok(value) = std::env::var("TEAMWIRE_MEDIA_ENGINE") {
            match value.trim().to_ascii_lowercase().as_str() {
                "loopback" => config.media.engine = MediaEngineKind::Loopback,
                "http" => config.media.engine = MediaEngineKind::Http,
                _ => {
                    tracing::warn!(
                        "Ignoring invalid TEAMWIRE_MEDIA_ENGINE value '{}'; expected loopback or http",
                        value
                    );
                }
            }
        }
        if let Ok(value) = std::env::var("TEAMWIRE_MEDIA_HTTP_URL") {
            config.media.http_url = value;
        }
        if let Ok(value) = std::env::var("TEAMWIRE_MEDIA_API_KEY") {
            config.media.api_key = value;
        }
        if let Ok(value) = std::env::var("TEAMWIRE_MEDIA_API_SECRET") {
            config.media.api_secret = value;
        }
        if let Some(parsed) = env_parse("TEAMWIRE_LOG_JSON") {
            config.logging.json = parsed;
        }

        validate_secret_configuration(&config)?;
        Ok((config, source))
    }
}
