//! Public entry point: [`Subscriber`].

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::{LoopEvent, LoopState, Shared, run_subscribe_loop};
use crate::heartbeat::{run_heartbeat, send_leave};
use crate::listener::{Listener, ListenerId};
use crate::rest::Endpoint;
use crate::state::{Cursor, Removed};
use crate::transport::{HttpTransport, Transport};
use crate::types::{Error, Operation, Status, StatusCategory, SubscribeOperation, UnsubscribeOperation};

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn stop(self) {
        self.cancel.cancel();
    }

    /// Wait for a worker that is already exiting on its own, so its final
    /// status is delivered before a replacement starts.
    async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::debug!("Worker task ended abnormally: {e}");
        }
    }
}

#[derive(Default)]
struct Workers {
    subscribe_loop: Option<Worker>,
    heartbeat: Option<Worker>,
}

/// Handle to the subscribe/presence engine.
///
/// Owns at most one subscribe loop and one heartbeat worker. Both run as tokio
/// tasks and stop when the active channel set empties, on [`close`](Subscriber::close),
/// or when the handle is dropped.
///
/// Events are delivered through [`Listener`]s; a listener that falls behind
/// loses events after [`TimingConfig::listener_send_timeout`](crate::TimingConfig).
pub struct Subscriber {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
    shutdown: CancellationToken,
}

impl Subscriber {
    /// Create a subscriber over a custom transport. Validates `config`.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config, transport)),
            workers: Mutex::new(Workers::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Create a subscriber over the default HTTP transport.
    pub fn with_http(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn add_listener(&self) -> Listener {
        self.shared.listeners.add()
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn loop_state(&self) -> LoopState {
        self.shared.loop_state()
    }

    /// Watch loop phase changes.
    pub fn watch_loop_state(&self) -> watch::Receiver<LoopState> {
        self.shared.phase.subscribe()
    }

    /// Data and presence channels currently subscribed.
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.shared.lock_state().all_channels()
    }

    pub fn subscribed_groups(&self) -> Vec<String> {
        self.shared.lock_state().all_groups()
    }

    pub fn cursor(&self) -> Cursor {
        self.shared.lock_state().cursor()
    }

    /// Add channels/groups to the active set and make sure the loop is running.
    ///
    /// Returns once the state is updated; connection outcomes arrive as
    /// [`Status`] events.
    pub async fn subscribe(&self, op: SubscribeOperation) -> Result<(), Error> {
        op.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut workers = self.workers.lock().await;
        let changed = self.shared.lock_state().add(&op);
        tracing::debug!(
            channels = ?op.channels,
            groups = ?op.channel_groups,
            presence = op.presence_enabled,
            changed,
            "Subscribe"
        );

        let running = workers
            .subscribe_loop
            .as_ref()
            .is_some_and(Worker::is_running)
            && self.shared.loop_state() != LoopState::Stopped;
        if running {
            if changed {
                self.shared.notify_changed();
            }
        } else {
            if let Some(old) = workers.subscribe_loop.take() {
                old.join().await;
            }
            self.shared.lock_state().prepare_fresh_start();
            self.shared.transition(LoopEvent::Start);
            workers.subscribe_loop = Some(self.spawn_loop());
        }

        if let Some(period) = self.shared.config.heartbeat_period() {
            let heartbeat_running = workers.heartbeat.as_ref().is_some_and(Worker::is_running);
            if !heartbeat_running {
                workers.heartbeat = Some(self.spawn_heartbeat(period));
            }
        }
        Ok(())
    }

    /// Remove channels/groups (and their presence twins). Sends a leave for
    /// the removed entries and stops the workers once nothing is left.
    pub async fn unsubscribe(&self, op: UnsubscribeOperation) -> Result<(), Error> {
        op.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let mut workers = self.workers.lock().await;
        let (removed, empty) = {
            let mut state = self.shared.lock_state();
            let removed = state.remove(&op.channels, &op.channel_groups);
            (removed, state.is_empty())
        };
        self.after_removal(&mut workers, removed, empty).await;
        Ok(())
    }

    /// Remove everything and stop both workers.
    pub async fn unsubscribe_all(&self) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let mut workers = self.workers.lock().await;
        let removed = self.shared.lock_state().clear();
        self.after_removal(&mut workers, removed, true).await;
        Ok(())
    }

    async fn after_removal(&self, workers: &mut Workers, removed: Removed, empty: bool) {
        if removed.is_empty() {
            tracing::debug!("Unsubscribe removed nothing");
            return;
        }
        let (leave_channels, leave_groups) = removed.leave_targets();
        send_leave(&self.shared, leave_channels, leave_groups);

        if !empty {
            self.shared.notify_changed();
            return;
        }

        let had_loop = workers.subscribe_loop.is_some();
        if let Some(worker) = workers.subscribe_loop.take() {
            worker.stop();
        }
        if let Some(worker) = workers.heartbeat.take() {
            worker.stop();
        }
        self.shared.lock_state().reset_cursor();
        self.shared.transition(LoopEvent::Emptied);
        tracing::info!("All channels unsubscribed");

        if had_loop {
            let status = Status::new(StatusCategory::Disconnected, Operation::Unsubscribe)
                .with_targets(removed.channels, removed.groups);
            self.shared.listeners.emit_status(status).await;
        }
    }

    /// Execute a one-shot endpoint over this subscriber's transport.
    pub async fn execute<E: Endpoint>(&self, endpoint: &E) -> Result<E::Output, Error> {
        crate::rest::execute(
            &self.shared.config,
            self.shared.transport.as_ref(),
            endpoint,
        )
        .await
    }

    /// Unsubscribe from everything (emitting a final `Disconnected` if
    /// anything was active) and stop all background work.
    pub async fn close(self) {
        if let Err(e) = self.unsubscribe_all().await {
            tracing::debug!("Unsubscribe on close failed: {e}");
        }
        self.shutdown.cancel();
        tracing::info!("Subscriber closed");
    }

    fn spawn_loop(&self) -> Worker {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_subscribe_loop(
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        Worker { cancel, handle }
    }

    fn spawn_heartbeat(&self, period: std::time::Duration) -> Worker {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&self.shared),
            period,
            cancel.clone(),
        ));
        Worker { cancel, handle }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
