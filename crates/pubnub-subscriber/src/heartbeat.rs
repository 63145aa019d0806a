//! Presence heartbeat worker and best-effort leave.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatNotifications;
use crate::connection::{LoopState, Shared};
use crate::protocol::{heartbeat_request, leave_request};
use crate::transport::{TransportError, TransportErrorKind};
use crate::types::{Operation, Status, StatusCategory};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Heartbeat on a fixed period until cancelled. Failures are reported per
/// [`HeartbeatNotifications`] and never touch the subscribe loop.
pub(crate) async fn run_heartbeat(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) {
    let notifications = shared.config.heartbeat_notifications;
    let timeout = shared.config.timing.request_timeout;
    let mut failures: u32 = 0;
    let mut delay = period;
    tracing::info!(period_ms = period.as_millis() as u64, "Heartbeat worker started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if shared.loop_state() == LoopState::Stopped {
            tracing::trace!("Subscribe loop stopped, skipping heartbeat");
            delay = period;
            continue;
        }
        let Some(ticket) = shared.lock_state().heartbeat_ticket(period) else {
            tracing::trace!("No channels to heartbeat");
            delay = period;
            continue;
        };
        let request = heartbeat_request(&shared.config, &ticket);
        let interval = ticket.interval;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = shared.transport.execute(&request, timeout) => result,
        };

        let status = match result {
            Ok(_) => {
                let recovered = failures > 0;
                failures = 0;
                delay = interval;
                tracing::trace!(channels = ticket.channels.len(), groups = ticket.groups.len(), "Heartbeat ok");
                let notify = match notifications {
                    HeartbeatNotifications::None => false,
                    HeartbeatNotifications::Failures => recovered,
                    HeartbeatNotifications::All => true,
                };
                notify.then(|| Status::new(StatusCategory::Connected, Operation::Heartbeat))
            }
            Err(err) if err.kind == TransportErrorKind::Cancelled => break,
            Err(err) => {
                failures = failures.saturating_add(1);
                delay = retry_delay(failures, interval);
                tracing::warn!(
                    failures,
                    retry_ms = delay.as_millis() as u64,
                    "Heartbeat failed: {err}"
                );
                (notifications != HeartbeatNotifications::None).then(|| {
                    Status::new(failure_category(&err), Operation::Heartbeat)
                        .with_error(err.message.clone(), err.status)
                })
            }
        };

        if let Some(status) = status {
            let status = status.with_targets(ticket.channels, ticket.groups);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = shared.listeners.emit_status(status) => {}
            }
        }
    }
    tracing::info!("Heartbeat worker stopped");
}

/// Doubles from one second, never longer than the heartbeat period.
fn retry_delay(failures: u32, period: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(30);
    INITIAL_RETRY_DELAY
        .saturating_mul(1u32 << exp)
        .min(period)
}

fn failure_category(err: &TransportError) -> StatusCategory {
    match (err.kind, err.status) {
        (_, Some(401 | 403)) => StatusCategory::AccessDenied,
        (TransportErrorKind::Http4xx | TransportErrorKind::Http5xx, _) => {
            StatusCategory::BadRequest
        }
        _ => StatusCategory::Timeout,
    }
}

/// Fire-and-forget leave for channels/groups this client no longer occupies.
pub(crate) fn send_leave(shared: &Arc<Shared>, channels: Vec<String>, groups: Vec<String>) {
    if shared.config.suppress_leave_events {
        tracing::debug!("Leave suppressed by configuration");
        return;
    }
    if channels.is_empty() && groups.is_empty() {
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let request = leave_request(&shared.config, &channels, &groups);
        match shared
            .transport
            .execute(&request, shared.config.timing.request_timeout)
            .await
        {
            Ok(_) => tracing::debug!(?channels, ?groups, "Leave sent"),
            Err(e) => tracing::debug!(?channels, ?groups, "Leave failed (ignored): {e}"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_period() {
        let period = Duration::from_secs(5);
        assert_eq!(retry_delay(1, period), Duration::from_secs(1));
        assert_eq!(retry_delay(2, period), Duration::from_secs(2));
        assert_eq!(retry_delay(3, period), Duration::from_secs(4));
        assert_eq!(retry_delay(4, period), Duration::from_secs(5));
        assert_eq!(retry_delay(40, period), Duration::from_secs(5));
    }

    #[test]
    fn failure_categories() {
        assert_eq!(
            failure_category(&TransportError::http(403, "Forbidden")),
            StatusCategory::AccessDenied
        );
        assert_eq!(
            failure_category(&TransportError::http(404, "Not Found")),
            StatusCategory::BadRequest
        );
        assert_eq!(
            failure_category(&TransportError::http(500, "oops")),
            StatusCategory::BadRequest
        );
        assert_eq!(
            failure_category(&TransportError::timeout("slow")),
            StatusCategory::Timeout
        );
        assert_eq!(
            failure_category(&TransportError::network("refused")),
            StatusCategory::Timeout
        );
    }
}
