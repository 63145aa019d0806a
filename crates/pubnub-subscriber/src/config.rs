//! Client configuration.

use std::time::Duration;

use crate::reconnect::ReconnectionPolicy;
use crate::types::Error;

pub const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_MARGIN: Duration = Duration::from_secs(1);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(310);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LISTENER_CAPACITY: usize = 64;
const LISTENER_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Which heartbeat outcomes are reported as [`Status`](crate::Status) events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeartbeatNotifications {
    /// Never report heartbeat outcomes.
    None,
    /// Report every failure and the first success after a failure.
    #[default]
    Failures,
    /// Report every heartbeat.
    All,
}

/// Timeouts and queue bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Long-poll timeout for subscribe calls. Must exceed the server's hold time.
    pub subscribe_timeout: Duration,
    /// Timeout for heartbeat, leave and one-shot REST calls.
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout for the HTTP transport.
    pub connect_timeout: Duration,
    /// Per-listener queue capacity for each delivery surface.
    pub listener_capacity: usize,
    /// Longest time the fan-out waits on one full listener queue per event
    /// before dropping that event for that listener.
    pub listener_send_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            listener_capacity: LISTENER_CAPACITY,
            listener_send_timeout: LISTENER_SEND_TIMEOUT,
        }
    }
}

/// Configuration for [`Subscriber`](crate::Subscriber).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub subscribe_key: String,
    /// Required only for access-manager calls.
    pub publish_key: Option<String>,
    /// Enables request signing. Required only for access-manager calls.
    pub secret_key: Option<String>,
    /// Identity announced to the server (`uuid` query parameter).
    pub user_id: String,
    pub auth_key: Option<String>,
    /// Host (and optional port). Defaults to [`DEFAULT_ORIGIN`].
    pub origin: String,
    /// Use `https` (default) or plain `http`.
    pub secure: bool,
    /// How long the server keeps this client present without a heartbeat.
    /// Zero omits the `heartbeat` parameter.
    pub presence_timeout: Duration,
    /// Heartbeat period. Zero disables the heartbeat worker.
    pub heartbeat_interval: Duration,
    /// Lower bound applied to `heartbeat_interval`.
    pub min_heartbeat_interval: Duration,
    pub heartbeat_notifications: HeartbeatNotifications,
    pub reconnection_policy: ReconnectionPolicy,
    /// Skip the leave call on unsubscribe.
    pub suppress_leave_events: bool,
    pub timing: TimingConfig,
}

impl Config {
    pub fn new(subscribe_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            subscribe_key: subscribe_key.into(),
            publish_key: None,
            secret_key: None,
            user_id: user_id.into(),
            auth_key: None,
            origin: DEFAULT_ORIGIN.to_string(),
            secure: true,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            heartbeat_interval: derive_heartbeat_interval(
                DEFAULT_PRESENCE_TIMEOUT,
                DEFAULT_MIN_HEARTBEAT_INTERVAL,
            ),
            min_heartbeat_interval: DEFAULT_MIN_HEARTBEAT_INTERVAL,
            heartbeat_notifications: HeartbeatNotifications::default(),
            reconnection_policy: ReconnectionPolicy::default(),
            suppress_leave_events: false,
            timing: TimingConfig::default(),
        }
    }

    /// Set the presence timeout and derive the heartbeat interval from it
    /// (half the timeout minus one second, never below the floor).
    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self.heartbeat_interval = derive_heartbeat_interval(timeout, self.min_heartbeat_interval);
        self
    }

    /// Effective heartbeat period, or `None` when heartbeats are disabled.
    pub fn heartbeat_period(&self) -> Option<Duration> {
        if self.heartbeat_interval.is_zero() {
            None
        } else {
            Some(self.heartbeat_interval.max(self.min_heartbeat_interval))
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.subscribe_key.trim().is_empty() {
            return Err(Error::Validation("missing subscribe key".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::Validation("missing user id".to_string()));
        }
        if self.origin.trim().is_empty() {
            return Err(Error::Validation("missing origin".to_string()));
        }
        if self.timing.listener_capacity == 0 {
            return Err(Error::Validation(
                "listener capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.origin)
    }
}

fn derive_heartbeat_interval(timeout: Duration, floor: Duration) -> Duration {
    if timeout.is_zero() {
        return Duration::ZERO;
    }
    (timeout / 2).saturating_sub(HEARTBEAT_MARGIN).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("sub-key", "user");
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert!(config.secure);
        assert_eq!(config.presence_timeout, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(149));
        assert_eq!(config.timing.subscribe_timeout, Duration::from_secs(310));
        assert_eq!(config.timing.request_timeout, Duration::from_secs(10));
        assert_eq!(config.timing.listener_capacity, 64);
        assert_eq!(config.heartbeat_notifications, HeartbeatNotifications::Failures);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn presence_timeout_derives_interval() {
        let config = Config::new("sub-key", "user").with_presence_timeout(Duration::from_secs(6));
        assert_eq!(config.presence_timeout, Duration::from_secs(6));
        assert_eq!(config.heartbeat_period(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn presence_timeout_respects_floor() {
        let mut config = Config::new("sub-key", "user");
        config.min_heartbeat_interval = Duration::from_secs(5);
        let config = config.with_presence_timeout(Duration::from_secs(6));
        assert_eq!(config.heartbeat_period(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn zero_interval_disables_heartbeat() {
        let mut config = Config::new("sub-key", "user");
        config.heartbeat_interval = Duration::ZERO;
        assert_eq!(config.heartbeat_period(), None);

        let config = Config::new("sub-key", "user").with_presence_timeout(Duration::ZERO);
        assert_eq!(config.heartbeat_period(), None);
    }

    #[test]
    fn validate_missing_subscribe_key() {
        let err = Config::new("", "user").validate().unwrap_err();
        assert_eq!(err.to_string(), "validation error: missing subscribe key");
    }

    #[test]
    fn validate_missing_user_id() {
        let err = Config::new("sub-key", " ").validate().unwrap_err();
        assert_eq!(err.to_string(), "validation error: missing user id");
    }

    #[test]
    fn base_url_scheme() {
        let mut config = Config::new("sub-key", "user");
        assert_eq!(config.base_url(), "https://ps.pndsn.com");
        config.secure = false;
        config.origin = "127.0.0.1:8080".to_string();
        assert_eq!(config.base_url(), "http://127.0.0.1:8080");
    }
}
