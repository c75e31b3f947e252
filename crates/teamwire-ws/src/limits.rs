use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use teamwire_models::gateway::{OP_HEARTBEAT, OP_THREAD_TYPING};
use teamwire_models::UserId;

/// Gateway timings and per-user inbound limits.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Advertised in `hello`; clients heartbeat at this pace.
    pub heartbeat_interval: Duration,
    /// A connection that sends no heartbeat for this long is closed.
    pub heartbeat_timeout: Duration,
    pub identify_timeout: Duration,
    pub ping_interval: Duration,
    pub max_connections: usize,
    pub max_messages_per_minute: u32,
    pub max_typing_per_minute: u32,
    pub max_signaling_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(41_250),
            heartbeat_timeout: Duration::from_secs(90),
            identify_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(20),
            max_connections: 2_000,
            max_messages_per_minute: 240,
            max_typing_per_minute: 120,
            max_signaling_per_minute: 120,
        }
    }
}

/// Which limiter an inbound op counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpClass {
    Heartbeat,
    Typing,
    Signaling,
    Message,
}

pub(crate) fn classify(op: &str) -> OpClass {
    match op {
        OP_HEARTBEAT => OpClass::Heartbeat,
        OP_THREAD_TYPING => OpClass::Typing,
        op if op.starts_with("sfu-") => OpClass::Signaling,
        _ => OpClass::Message,
    }
}

fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

/// Limiters keyed by user, so opening more connections does not buy more quota.
pub(crate) struct UserRateLimits {
    /// Every op except heartbeats.
    messages: DefaultKeyedRateLimiter<UserId>,
    typing: DefaultKeyedRateLimiter<UserId>,
    signaling: DefaultKeyedRateLimiter<UserId>,
}

impl UserRateLimits {
    pub(crate) fn new(config: &GatewayConfig) -> Self {
        Self {
            messages: RateLimiter::keyed(per_minute(config.max_messages_per_minute)),
            typing: RateLimiter::keyed(per_minute(config.max_typing_per_minute)),
            signaling: RateLimiter::keyed(per_minute(config.max_signaling_per_minute)),
        }
    }

    /// `Err(retry_after_ms)` when the op must be refused.
    pub(crate) fn check(&self, user_id: UserId, class: OpClass) -> Result<(), u64> {
        if class == OpClass::Heartbeat {
            return Ok(());
        }
        let now = DefaultClock::default().now();

        if let Err(not_until) = self.messages.check_key(&user_id) {
            return Err(not_until.wait_time_from(now).as_millis().max(1) as u64);
        }
        let limited = match class {
            OpClass::Typing => self.typing.check_key(&user_id).err(),
            OpClass::Signaling => self.signaling.check_key(&user_id).err(),
            OpClass::Heartbeat | OpClass::Message => None,
        };
        match limited {
            Some(not_until) => Err(not_until.wait_time_from(now).as_millis().max(1) as u64),
            None => Ok(()),
        }
    }

    /// Drop state of users that have been quiet long enough to be back at full quota.
    pub(crate) fn prune(&self) {
        for limiter in [&self.messages, &self.typing, &self.signaling] {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_are_classified() {
        assert_eq!(classify("heartbeat"), OpClass::Heartbeat);
        assert_eq!(classify("thread-typing"), OpClass::Typing);
        assert_eq!(classify("sfu-produce"), OpClass::Signaling);
        assert_eq!(classify("publish-message"), OpClass::Message);
    }

    #[test]
    fn typing_quota_is_per_user() {
        let limits = UserRateLimits::new(&GatewayConfig {
            max_typing_per_minute: 2,
            ..GatewayConfig::default()
        });
        assert!(limits.check(1, OpClass::Typing).is_ok());
        assert!(limits.check(1, OpClass::Typing).is_ok());
        let retry_after = limits.check(1, OpClass::Typing).unwrap_err();
        assert!(retry_after >= 1);
        assert!(limits.check(2, OpClass::Typing).is_ok());
        assert!(limits.check(1, OpClass::Message).is_ok());
    }

    #[test]
    fn heartbeats_are_never_limited() {
        let limits = UserRateLimits::new(&GatewayConfig {
            max_messages_per_minute: 1,
            ..GatewayConfig::default()
        });
        assert!(limits.check(1, OpClass::Message).is_ok());
        assert!(limits.check(1, OpClass::Message).is_err());
        for _ in 0..10 {
            assert!(limits.check(1, OpClass::Heartbeat).is_ok());
        }
    }
}
