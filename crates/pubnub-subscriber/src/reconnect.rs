//! Reconnection policy and backoff state machine for the subscribe loop.

use std::time::Duration;

use crate::transport::{TransportError, TransportErrorKind};

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 10;

/// How the subscribe loop retries after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionPolicy {
    /// Every failure is terminal.
    None,
    /// Constant delay between attempts.
    Linear {
        delay: Duration,
        /// `None` retries forever.
        max_retries: Option<u32>,
    },
    /// `base * 2^(n-1)`, capped at `max_delay`.
    Exponential {
        base: Duration,
        max_delay: Duration,
        /// `None` retries forever.
        max_retries: Option<u32>,
    },
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::Exponential {
            base: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }
}

impl ReconnectionPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::None => None,
            Self::Linear { delay, max_retries } => {
                within(attempt, max_retries).then_some(delay)
            }
            Self::Exponential {
                base,
                max_delay,
                max_retries,
            } => {
                if !within(attempt, max_retries) {
                    return None;
                }
                let exp = attempt.saturating_sub(1).min(30);
                Some(base.saturating_mul(1u32 << exp).min(max_delay))
            }
        }
    }
}

fn within(attempt: u32, max_retries: Option<u32>) -> bool {
    attempt >= 1 && max_retries.is_none_or(|max| attempt <= max)
}

/// Classified failure of one subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Network,
    MalformedResponse,
    ClientError(u16),
    ServerError(u16),
}

impl FailureKind {
    /// 4xx responses are terminal; everything else may be retried.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::ClientError(_))
    }

    /// `None` for cancellation, which is never a failure.
    pub(crate) fn from_transport(err: &TransportError) -> Option<Self> {
        let status = err.status.unwrap_or_default();
        match err.kind {
            TransportErrorKind::Cancelled => None,
            TransportErrorKind::Timeout => Some(Self::Timeout),
            TransportErrorKind::Network => Some(Self::Network),
            TransportErrorKind::Http4xx => Some(Self::ClientError(status)),
            TransportErrorKind::Http5xx => Some(Self::ServerError(status)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Tracks consecutive failures of the subscribe loop.
#[derive(Debug, Clone)]
pub struct ReconnectionState {
    policy: ReconnectionPolicy,
    attempt_count: u32,
    next_delay: Option<Duration>,
    last_failure: Option<FailureKind>,
}

impl ReconnectionState {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
            next_delay: None,
            last_failure: None,
        }
    }

    /// Record a failure and decide what to do next.
    pub fn on_failure(&mut self, kind: FailureKind) -> RetryDecision {
        self.last_failure = Some(kind);
        if !kind.is_retryable() {
            self.next_delay = None;
            return RetryDecision::GiveUp;
        }
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_delay = self.policy.delay_for(self.attempt_count);
        match self.next_delay {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::GiveUp,
        }
    }

    /// Record a success. Returns `true` if it ended a run of failures.
    pub fn on_success(&mut self) -> bool {
        let recovered = self.attempt_count > 0;
        self.attempt_count = 0;
        self.next_delay = None;
        self.last_failure = None;
        recovered
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    pub fn last_failure(&self) -> Option<FailureKind> {
        self.last_failure
    }
}
