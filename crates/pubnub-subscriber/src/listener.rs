//! Listener registry and fan-out.
//!
//! Every listener owns three bounded queues (status, message, presence).
//! Events are delivered to listeners one at a time in registration order, so
//! each listener sees events in the order they were produced. A listener whose
//! queue stays full longer than the send timeout loses that event only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::types::{Event, Message, Presence, Status, SubscribeEnvelope};

/// Identifies a registered [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiving half of a registered listener.
///
/// Dropping it unregisters the listener on the next delivery attempt.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    status_rx: mpsc::Receiver<Status>,
    message_rx: mpsc::Receiver<Message>,
    presence_rx: mpsc::Receiver<Presence>,
    dropped: Arc<AtomicU64>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub async fn next_status(&mut self) -> Option<Status> {
        self.status_rx.recv().await
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        self.message_rx.recv().await
    }

    pub async fn next_presence(&mut self) -> Option<Presence> {
        self.presence_rx.recv().await
    }

    /// Receive the next event from any surface. Status events win ties.
    /// Returns `None` once the listener has been removed and drained.
    pub async fn next(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            Some(status) = self.status_rx.recv() => Some(Event::Status(status)),
            Some(message) = self.message_rx.recv() => Some(Event::Message(message)),
            Some(presence) = self.presence_rx.recv() => Some(Event::Presence(presence)),
            else => None,
        }
    }

    /// Number of events dropped for this listener because its queue stayed full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Entry {
    id: ListenerId,
    status_tx: mpsc::Sender<Status>,
    message_tx: mpsc::Sender<Message>,
    presence_tx: mpsc::Sender<Presence>,
    dropped: Arc<AtomicU64>,
}

pub(crate) struct ListenerRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    capacity: usize,
    send_timeout: Duration,
}

impl ListenerRegistry {
    pub fn new(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            send_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self) -> Listener {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (status_tx, status_rx) = mpsc::channel(self.capacity);
        let (message_tx, message_rx) = mpsc::channel(self.capacity);
        let (presence_tx, presence_rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.lock().push(Entry {
            id,
            status_tx,
            message_tx,
            presence_tx,
            dropped: Arc::clone(&dropped),
        });
        tracing::debug!(listener = id.0, "Listener added");
        Listener {
            id,
            status_rx,
            message_rx,
            presence_rx,
            dropped,
        }
    }

    /// Returns `false` if no listener with `id` was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if removed {
            tracing::debug!(listener = id.0, "Listener removed");
        }
        removed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub async fn emit_status(&self, status: Status) {
        let targets = self.targets(|e| &e.status_tx);
        self.deliver(targets, status, "status").await;
    }

    pub async fn emit_message(&self, message: Message) {
        let targets = self.targets(|e| &e.message_tx);
        self.deliver(targets, message, "message").await;
    }

    pub async fn emit_presence(&self, presence: Presence) {
        let targets = self.targets(|e| &e.presence_tx);
        self.deliver(targets, presence, "presence").await;
    }

    pub async fn emit_envelope(&self, envelope: SubscribeEnvelope) {
        match envelope {
            SubscribeEnvelope::Message(message) => self.emit_message(message).await,
            SubscribeEnvelope::Presence(presence) => self.emit_presence(presence).await,
        }
    }

    /// Snapshot senders so delivery never holds the registry lock across an await.
    fn targets<T>(
        &self,
        pick: impl Fn(&Entry) -> &mpsc::Sender<T>,
    ) -> Vec<(ListenerId, mpsc::Sender<T>, Arc<AtomicU64>)> {
        self.lock()
            .iter()
            .map(|e| (e.id, pick(e).clone(), Arc::clone(&e.dropped)))
            .collect()
    }

    async fn deliver<T: Clone>(
        &self,
        targets: Vec<(ListenerId, mpsc::Sender<T>, Arc<AtomicU64>)>,
        event: T,
        surface: &'static str,
    ) {
        let mut closed = Vec::new();
        for (id, tx, dropped) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    match tokio::time::timeout(self.send_timeout, tx.send(event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => closed.push(id),
                        Err(_) => {
                            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::warn!(
                                listener = id.0,
                                surface,
                                total_dropped = total,
                                "listener queue full, dropping event"
                            );
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            let mut entries = self.lock();
            entries.retain(|e| !closed.contains(&e.id));
            tracing::debug!(count = closed.len(), "Pruned closed listeners");
        }
    }
}
