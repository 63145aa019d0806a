//! Long-poll subscribe loop: cursor tracking, mid-flight channel changes,
//! reconnection, and status reporting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::listener::ListenerRegistry;
use crate::protocol::{parse_subscribe_response, subscribe_request};
use crate::reconnect::{FailureKind, ReconnectionState, RetryDecision};
use crate::state::{SubscribeSnapshot, SubscriptionState};
use crate::transport::{Response, Transport, TransportError};
use crate::types::{Operation, Status, StatusCategory, SubscribeEnvelope};

// ---------------------------------------------------------------------------
// Loop phase
// ---------------------------------------------------------------------------

/// Observable phase of the subscribe loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopState {
    /// No loop running (nothing subscribed yet, or everything unsubscribed).
    #[default]
    Idle,
    /// A subscribe call is outstanding and no success has been seen since the
    /// last (re)start, channel change or failure.
    Connecting,
    /// The last subscribe call succeeded.
    Streaming,
    /// Waiting before the next retry.
    Backoff,
    /// Gave up after a terminal failure. The next `subscribe` restarts the loop.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopEvent {
    Start,
    Success,
    RetryableFailure,
    RetryDue,
    ChannelsChanged,
    Terminal,
    Emptied,
}

impl LoopState {
    pub(crate) fn on(self, event: LoopEvent) -> Self {
        match (self, event) {
            (_, LoopEvent::Emptied) => Self::Idle,
            (_, LoopEvent::Terminal) => Self::Stopped,
            (_, LoopEvent::Start) => Self::Connecting,
            (Self::Idle | Self::Stopped, _) => self,
            (_, LoopEvent::Success) => Self::Streaming,
            (_, LoopEvent::RetryableFailure) => Self::Backoff,
            (Self::Backoff, LoopEvent::RetryDue | LoopEvent::ChannelsChanged) => Self::Connecting,
            (Self::Streaming, LoopEvent::ChannelsChanged) => Self::Connecting,
            (state, _) => state,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared engine state
// ---------------------------------------------------------------------------

/// State shared by the public handle, the subscribe loop and the heartbeat worker.
pub(crate) struct Shared {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub state: Mutex<SubscriptionState>,
    /// Carries the state generation; bumped whenever the channel set changes.
    pub changes: watch::Sender<u64>,
    pub phase: watch::Sender<LoopState>,
    pub listeners: ListenerRegistry,
}

impl Shared {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let listeners = ListenerRegistry::new(
            config.timing.listener_capacity,
            config.timing.listener_send_timeout,
        );
        Self {
            config,
            transport,
            state: Mutex::new(SubscriptionState::default()),
            changes: watch::Sender::new(0),
            phase: watch::Sender::new(LoopState::Idle),
            listeners,
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transition(&self, event: LoopEvent) -> LoopState {
        let mut next = LoopState::Idle;
        self.phase.send_modify(|phase| {
            let prev = *phase;
            *phase = prev.on(event);
            next = *phase;
            if prev != next {
                tracing::debug!(from = ?prev, to = ?next, ?event, "Subscribe loop transition");
            }
        });
        next
    }

    pub fn loop_state(&self) -> LoopState {
        *self.phase.borrow()
    }

    /// Wake the loop so it re-issues with the current state.
    pub fn notify_changed(&self) {
        let generation = self.lock_state().generation();
        self.changes.send_replace(generation);
    }

    /// Deliver a status unless `cancel` fires first.
    async fn emit_status(&self, status: Status, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.listeners.emit_status(status) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscribe loop
// ---------------------------------------------------------------------------

enum Outcome {
    Response(Result<Response, TransportError>),
    ChannelsChanged,
    Cancelled,
}

pub(crate) async fn run_subscribe_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut changes = shared.changes.subscribe();
    let mut reconnection = ReconnectionState::new(shared.config.reconnection_policy);
    let timeout = shared.config.timing.subscribe_timeout;
    tracing::info!("Subscribe loop started");

    loop {
        changes.borrow_and_update();
        let snapshot = shared.lock_state().snapshot();
        if snapshot.channels.is_empty() && snapshot.groups.is_empty() {
            tracing::debug!("Nothing subscribed, subscribe loop exiting");
            return;
        }
        let request = subscribe_request(&shared.config, &snapshot);
        tracing::trace!(
            tt = snapshot.cursor.timetoken,
            tr = ?snapshot.cursor.region,
            channels = snapshot.channels.len(),
            groups = snapshot.groups.len(),
            "Issuing subscribe call"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = changes.changed() => Outcome::ChannelsChanged,
            result = shared.transport.execute(&request, timeout) => Outcome::Response(result),
        };

        let failure = match outcome {
            Outcome::Cancelled => break,
            Outcome::ChannelsChanged => {
                tracing::debug!("Channel set changed, re-issuing subscribe call");
                shared.transition(LoopEvent::ChannelsChanged);
                continue;
            }
            Outcome::Response(Ok(response)) => {
                match handle_response(&shared, &snapshot, &response, &mut reconnection, &cancel)
                    .await
                {
                    Step::Continue => continue,
                    Step::Exit => break,
                    Step::Failed(kind, detail) => (kind, detail, None),
                }
            }
            Outcome::Response(Err(err)) => match FailureKind::from_transport(&err) {
                None => {
                    tracing::debug!("Subscribe call cancelled by transport");
                    break;
                }
                Some(kind) => (kind, err.message, err.status),
            },
        };

        let (kind, detail, status_code) = failure;
        match reconnection.on_failure(kind) {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(
                    attempt = reconnection.attempt_count(),
                    ?kind,
                    delay_ms = delay.as_millis() as u64,
                    "Subscribe call failed, retrying: {detail}"
                );
                shared.transition(LoopEvent::RetryableFailure);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = changes.changed() => {
                        tracing::debug!("Channel set changed during backoff");
                        shared.transition(LoopEvent::ChannelsChanged);
                    }
                    _ = tokio::time::sleep(delay) => {
                        shared.transition(LoopEvent::RetryDue);
                    }
                }
            }
            RetryDecision::GiveUp => {
                let category = terminal_category(kind);
                tracing::warn!(
                    attempts = reconnection.attempt_count(),
                    ?kind,
                    ?category,
                    "Subscribe loop giving up: {detail}"
                );
                shared.transition(LoopEvent::Terminal);
                let status = Status::new(category, Operation::Subscribe)
                    .with_error(detail, status_code)
                    .with_targets(snapshot.channels, snapshot.groups);
                shared.emit_status(status, &cancel).await;
                return;
            }
        }
    }
    tracing::info!("Subscribe loop cancelled");
}

enum Step {
    Continue,
    Exit,
    Failed(FailureKind, String),
}

async fn handle_response(
    shared: &Shared,
    snapshot: &SubscribeSnapshot,
    response: &Response,
    reconnection: &mut ReconnectionState,
    cancel: &CancellationToken,
) -> Step {
    let parsed = match parse_subscribe_response(&response.body) {
        Ok(parsed) => parsed,
        Err(e) => {
            let status = Status::new(StatusCategory::MalformedResponse, Operation::Subscribe)
                .with_error(e.to_string(), Some(response.status))
                .with_targets(snapshot.channels.clone(), snapshot.groups.clone());
            if !shared.emit_status(status, cancel).await {
                return Step::Exit;
            }
            return Step::Failed(FailureKind::MalformedResponse, e.to_string());
        }
    };

    let Some(announce) = shared
        .lock_state()
        .apply(snapshot.generation, parsed.cursor)
    else {
        tracing::debug!(
            tt = parsed.cursor.timetoken,
            "Discarding response for superseded channel set"
        );
        return Step::Continue;
    };

    let recovered = reconnection.on_success();
    shared.transition(LoopEvent::Success);
    let category = if recovered {
        Some(StatusCategory::Reconnected)
    } else if announce {
        Some(StatusCategory::Connected)
    } else {
        None
    };
    if let Some(category) = category {
        tracing::info!(?category, tt = parsed.cursor.timetoken, "Subscribe loop connected");
        let status = Status::new(category, Operation::Subscribe)
            .with_targets(snapshot.channels.clone(), snapshot.groups.clone());
        if !shared.emit_status(status, cancel).await {
            return Step::Exit;
        }
    }

    for envelope in parsed.envelopes {
        if !deliver(shared, envelope, cancel).await {
            return Step::Exit;
        }
    }
    Step::Continue
}

async fn deliver(shared: &Shared, envelope: SubscribeEnvelope, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = shared.listeners.emit_envelope(envelope) => true,
    }
}

/// Status category reported when the loop gives up after `kind`.
fn terminal_category(kind: FailureKind) -> StatusCategory {
    match kind {
        FailureKind::ClientError(401 | 403) => StatusCategory::AccessDenied,
        FailureKind::ClientError(_) => StatusCategory::BadRequest,
        FailureKind::Timeout => StatusCategory::Timeout,
        FailureKind::Network | FailureKind::ServerError(_) | FailureKind::MalformedResponse => {
            StatusCategory::UnexpectedDisconnect
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions() {
        let s = LoopState::Idle.on(LoopEvent::Start);
        assert_eq!(s, LoopState::Connecting);
        let s = s.on(LoopEvent::Success);
        assert_eq!(s, LoopState::Streaming);
        assert_eq!(s.on(LoopEvent::Success), LoopState::Streaming);
        assert_eq!(s.on(LoopEvent::ChannelsChanged), LoopState::Connecting);
        let s = s.on(LoopEvent::RetryableFailure);
        assert_eq!(s, LoopState::Backoff);
        assert_eq!(s.on(LoopEvent::RetryDue), LoopState::Connecting);
        assert_eq!(s.on(LoopEvent::Terminal), LoopState::Stopped);
        assert_eq!(s.on(LoopEvent::Emptied), LoopState::Idle);
    }

    #[test]
    fn stopped_and_idle_ignore_loop_events() {
        for state in [LoopState::Idle, LoopState::Stopped] {
            assert_eq!(state.on(LoopEvent::Success), state);
            assert_eq!(state.on(LoopEvent::RetryableFailure), state);
            assert_eq!(state.on(LoopEvent::Start), LoopState::Connecting);
        }
    }

    #[test]
    fn terminal_categories() {
        assert_eq!(
            terminal_category(FailureKind::ClientError(403)),
            StatusCategory::AccessDenied
        );
        assert_eq!(
            terminal_category(FailureKind::ClientError(401)),
            StatusCategory::AccessDenied
        );
        assert_eq!(
            terminal_category(FailureKind::ClientError(400)),
            StatusCategory::BadRequest
        );
        assert_eq!(terminal_category(FailureKind::Timeout), StatusCategory::Timeout);
        assert_eq!(
            terminal_category(FailureKind::ServerError(503)),
            StatusCategory::UnexpectedDisconnect
        );
    }
}
