//! Public types for the pubnub-subscriber crate.

use serde::Deserialize;

use crate::transport::TransportError;

/// Logical operation a [`Status`] or [`Request`](crate::Request) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    Heartbeat,
    Leave,
    Grant,
    ListPushProvisions,
}

/// Closed set of status categories reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// First successful subscribe after idle or after a channel-set change.
    Connected,
    /// First successful subscribe after one or more retries.
    Reconnected,
    /// An explicit unsubscribe emptied the active channel set.
    Disconnected,
    /// Retries were exhausted (or disabled) after a network or server failure.
    UnexpectedDisconnect,
    /// Retries were exhausted after a timeout, or a heartbeat timed out.
    Timeout,
    /// Non-retryable 4xx response.
    BadRequest,
    /// 401/403 response.
    AccessDenied,
    /// The server replied with a payload that could not be decoded.
    MalformedResponse,
}

impl StatusCategory {
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            Self::Connected | Self::Reconnected | Self::Disconnected
        )
    }
}

/// A connection-lifecycle or operation outcome event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub category: StatusCategory,
    pub operation: Operation,
    /// Human-readable failure detail, if any.
    pub error: Option<String>,
    /// HTTP status code of the failed call, if any.
    pub status_code: Option<u16>,
    pub affected_channels: Vec<String>,
    pub affected_groups: Vec<String>,
}

impl Status {
    pub(crate) fn new(category: StatusCategory, operation: Operation) -> Self {
        Self {
            category,
            operation,
            error: None,
            status_code: None,
            affected_channels: Vec::new(),
            affected_groups: Vec::new(),
        }
    }

    pub(crate) fn with_error(mut self, error: impl Into<String>, status_code: Option<u16>) -> Self {
        self.error = Some(error.into());
        self.status_code = status_code;
        self
    }

    pub(crate) fn with_targets(mut self, channels: Vec<String>, groups: Vec<String>) -> Self {
        self.affected_channels = channels;
        self.affected_groups = groups;
        self
    }
}

/// Whether a [`Message`] was published normally or sent as a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    Signal,
}

/// A message or signal received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    /// Channel the message was published to.
    pub channel: String,
    /// Channel group or wildcard the message matched, when it differs from `channel`.
    pub subscription: Option<String>,
    /// Publish timetoken.
    pub timetoken: u64,
    pub payload: serde_json::Value,
    /// Publisher's user id.
    pub publisher: Option<String>,
    pub user_metadata: Option<serde_json::Value>,
}

/// Presence event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
}

/// A presence event on a channel subscribed with presence enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub action: PresenceAction,
    /// Channel name without the presence suffix.
    pub channel: String,
    pub subscription: Option<String>,
    pub timetoken: u64,
    /// User id the event is about (absent for `interval`).
    pub uuid: Option<String>,
    pub occupancy: u32,
    /// Server timestamp (seconds since epoch).
    pub timestamp: i64,
    /// Presence state attached by the user, for `join` and `state-change`.
    pub state: Option<serde_json::Value>,
    /// `interval` deltas.
    pub join: Vec<String>,
    pub leave: Vec<String>,
    pub timeout: Vec<String>,
    pub here_now_refresh: bool,
}

/// One decoded unit of subscribe output.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeEnvelope {
    Message(Message),
    Presence(Presence),
}

/// Anything a [`Listener`](crate::Listener) can yield.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(Status),
    Message(Message),
    Presence(Presence),
}

/// Arguments for [`Subscriber::subscribe`](crate::Subscriber::subscribe).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOperation {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
    /// Also subscribe to the `-pnpres` presence channels/groups.
    pub presence_enabled: bool,
    /// Server-side filter expression, passed verbatim.
    pub filter_expression: Option<String>,
    /// Resume from this timetoken after the handshake instead of "now".
    pub timetoken: Option<u64>,
}

impl SubscribeOperation {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channel_groups: groups.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_presence(mut self) -> Self {
        self.presence_enabled = true;
        self
    }

    pub fn with_filter_expression(mut self, expr: impl Into<String>) -> Self {
        self.filter_expression = Some(expr.into());
        self
    }

    pub fn with_timetoken(mut self, timetoken: u64) -> Self {
        self.timetoken = Some(timetoken);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        validate_targets(&self.channels, &self.channel_groups)
    }
}

/// Arguments for [`Subscriber::unsubscribe`](crate::Subscriber::unsubscribe).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeOperation {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
}

impl UnsubscribeOperation {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        validate_targets(&self.channels, &self.channel_groups)
    }
}

fn validate_targets(channels: &[String], groups: &[String]) -> Result<(), Error> {
    if channels.is_empty() && groups.is_empty() {
        return Err(Error::Validation("missing channel or channel group".to_string()));
    }
    if channels.iter().chain(groups).any(String::is_empty) {
        return Err(Error::Validation(
            "channel and group names must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("response parsing error: {0}")]
    ResponseParsing(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("subscriber is closed")]
    Closed,
}
