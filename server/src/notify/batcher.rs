//! Optional coalescing of notifications per (topic, user).
//!
//! A batch is flushed when it reaches `max_batch_size` items or when its
//! timer, started by the first item, fires. Whichever happens first wins;
//! the other is a no-op. Each key's batch has its own lock; the key map is
//! only locked to find or detach a batch. Flushed batches are handed to a
//! single [`BatchFlusher`], which also drains everything pending on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ws::{Notification, TopicId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// `None` for notifications addressed to a user rather than a topic.
    pub topic_id: Option<TopicId>,
    pub user_id: UserId,
}

pub type Batch = (BatchKey, Vec<Arc<Notification>>);

#[derive(Default)]
struct PendingBatch {
    notifications: Vec<Arc<Notification>>,
    timer: Option<JoinHandle<()>>,
    /// Set once the batch has left the map. Late appenders retry with a fresh slot.
    flushed: bool,
}

type Slot = Arc<Mutex<PendingBatch>>;

fn lock(slot: &Slot) -> MutexGuard<'_, PendingBatch> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared {
    max_batch_size: usize,
    flush_timeout: Duration,
    batches: Mutex<HashMap<BatchKey, Slot>>,
    ready_tx: mpsc::UnboundedSender<Batch>,
}

impl Shared {
    fn batches(&self) -> MutexGuard<'_, HashMap<BatchKey, Slot>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: BatchKey) -> Slot {
        self.batches().entry(key).or_default().clone()
    }

    /// Detach a locked batch from the map and hand its contents to the flusher.
    fn flush_locked(&self, key: BatchKey, slot: &Slot, batch: &mut PendingBatch) {
        batch.flushed = true;
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        {
            let mut batches = self.batches();
            if batches.get(&key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                batches.remove(&key);
            }
        }
        let notifications = std::mem::take(&mut batch.notifications);
        if notifications.is_empty() {
            return;
        }
        if self.ready_tx.send((key, notifications)).is_err() {
            tracing::warn!(user_id = %key.user_id, "Batch flusher gone, dropping batch");
        }
    }

    fn flush_expired(&self, key: BatchKey, slot: &Slot) {
        let mut batch = lock(slot);
        if !batch.flushed {
            self.flush_locked(key, slot, &mut batch);
        }
    }
}

#[derive(Clone)]
pub struct NotificationBatcher {
    shared: Arc<Shared>,
}

pub struct BatchFlusher {
    shared: Arc<Shared>,
    ready_rx: mpsc::UnboundedReceiver<Batch>,
}

impl NotificationBatcher {
    pub fn new(max_batch_size: usize, flush_timeout: Duration) -> (Self, BatchFlusher) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            max_batch_size: max_batch_size.max(1),
            flush_timeout,
            batches: Mutex::new(HashMap::new()),
            ready_tx,
        });
        (
            Self {
                shared: shared.clone(),
            },
            BatchFlusher { shared, ready_rx },
        )
    }

    /// Append to the batch for `key`. Must be called inside a Tokio runtime.
    pub fn add(&self, key: BatchKey, notification: Arc<Notification>) {
        let shared = &self.shared;
        loop {
            let slot = shared.slot(key);
            let mut batch = lock(&slot);
            if batch.flushed {
                continue;
            }
            batch.notifications.push(notification);

            if batch.notifications.len() >= shared.max_batch_size {
                shared.flush_locked(key, &slot, &mut batch);
            } else if batch.timer.is_none() {
                let timer_shared = Arc::clone(shared);
                let timer_slot = Arc::clone(&slot);
                batch.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timer_shared.flush_timeout).await;
                    timer_shared.flush_expired(key, &timer_slot);
                }));
            }
            return;
        }
    }

    /// Number of batches waiting on size or timer.
    pub fn pending_batches(&self) -> usize {
        self.shared.batches().len()
    }
}

impl BatchFlusher {
    /// Deliver flushed batches through `flush` until cancelled, then flush
    /// everything still pending.
    pub async fn run<F>(mut self, mut flush: F, cancel: CancellationToken)
    where
        F: FnMut(BatchKey, Vec<Arc<Notification>>) + Send,
    {
        loop {
            tokio::select! {
                biased;
                Some((key, notifications)) = self.ready_rx.recv() => flush(key, notifications),
                _ = cancel.cancelled() => break,
            }
        }

        while let Ok((key, notifications)) = self.ready_rx.try_recv() {
            flush(key, notifications);
        }

        let pending: Vec<_> = self.shared.batches().drain().collect();
        let count = pending.len();
        for (key, slot) in pending {
            let notifications = {
                let mut batch = lock(&slot);
                if batch.flushed {
                    continue;
                }
                batch.flushed = true;
                if let Some(timer) = batch.timer.take() {
                    timer.abort();
                }
                std::mem::take(&mut batch.notifications)
            };
            if !notifications.is_empty() {
                flush(key, notifications);
            }
        }
        tracing::debug!(flushed = count, "Batcher drained on shutdown");
    }
}
