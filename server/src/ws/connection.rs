use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Notification, UserId};

/// Unique id of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Deadline for writing a single outbound frame.
    pub write_timeout: Duration,
    /// Read deadline, renewed by every inbound frame including pongs.
    pub idle_timeout: Duration,
    /// Largest inbound text frame accepted before the connection is dropped.
    pub max_frame_bytes: usize,
    /// Capacity of the bounded outbound queue.
    pub queue_size: usize,
    /// How long an enqueue may wait on a saturated queue before giving up.
    pub enqueue_timeout: Duration,
}

impl ConnectionOptions {
    /// Keepalive probes go out at 9/10 of the idle timeout so a healthy peer
    /// always answers before the deadline.
    pub fn keepalive_interval(&self) -> Duration {
        self.idle_timeout * 9 / 10
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_frame_bytes: 512,
            queue_size: 1024,
            enqueue_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Shareable half of a connection: identity plus the producer side of its
/// outbound queue. The registry and fan-out paths hold this; only the
/// connection's own outbound loop ever touches the socket.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    tx: mpsc::Sender<Arc<Notification>>,
    closed: CancellationToken,
    enqueue_timeout: Duration,
}

/// Consumer half of the outbound queue, owned by the outbound loop.
#[derive(Debug)]
pub struct Outbound {
    pub(crate) rx: mpsc::Receiver<Arc<Notification>>,
    pub(crate) closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, options: &ConnectionOptions) -> (Arc<Self>, Outbound) {
        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let closed = CancellationToken::new();
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            user_id,
            tx,
            closed: closed.clone(),
            enqueue_timeout: options.enqueue_timeout,
        });
        (handle, Outbound { rx, closed })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Queue a notification, waiting up to the enqueue timeout for space.
    pub async fn enqueue(&self, notification: Arc<Notification>) -> Result<(), EnqueueError> {
        if self.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        match self.tx.send_timeout(notification, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(EnqueueError::QueueFull),
            Err(SendTimeoutError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Queue a notification without waiting.
    pub fn try_enqueue(&self, notification: Arc<Notification>) -> Result<(), EnqueueError> {
        if self.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.tx.try_send(notification).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::QueueFull,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Ask the outbound loop to flush what is queued, write a close frame and
    /// stop. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn options(queue_size: usize) -> ConnectionOptions {
        ConnectionOptions {
            queue_size,
            enqueue_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn note() -> Arc<Notification> {
        Arc::new(Notification::new("message", Value::Null))
    }

    #[test]
    fn test_keepalive_is_nine_tenths_of_idle() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.keepalive_interval(), Duration::from_secs(54));
        assert!(opts.keepalive_interval() < opts.idle_timeout);
    }

    #[tokio::test]
    async fn test_enqueue_reports_full_queue() {
        let (handle, _outbound) = ConnectionHandle::new(Uuid::new_v4(), &options(1));
        assert_eq!(handle.enqueue(note()).await, Ok(()));
        assert_eq!(handle.enqueue(note()).await, Err(EnqueueError::QueueFull));
        assert_eq!(handle.try_enqueue(note()), Err(EnqueueError::QueueFull));
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (handle, _outbound) = ConnectionHandle::new(Uuid::new_v4(), &options(4));
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(handle.enqueue(note()).await, Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn test_enqueue_after_consumer_dropped_fails() {
        let (handle, outbound) = ConnectionHandle::new(Uuid::new_v4(), &options(4));
        drop(outbound);
        assert_eq!(handle.enqueue(note()).await, Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let (handle, mut outbound) = ConnectionHandle::new(Uuid::new_v4(), &options(8));
        for i in 0..3 {
            let n = Notification::new(format!("n{i}"), Value::Null);
            handle.enqueue(Arc::new(n)).await.unwrap();
        }
        for i in 0..3 {
            let n = outbound.rx.recv().await.unwrap();
            assert_eq!(n.kind, format!("n{i}"));
        }
    }
}
