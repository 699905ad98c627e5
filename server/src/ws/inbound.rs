use std::sync::Arc;

use tokio::sync::mpsc;

use super::{ConnectionHandle, InboundMessage, Notification};
use crate::ratelimit::SlidingWindowLimiter;

/// Receives decoded client frames from connection actors.
///
/// Called from the connection's inbound loop, so implementations must not
/// block; hand the message off to a channel or spawn.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, connection: &ConnectionHandle, message: InboundMessage);
}

impl InboundHandler for mpsc::UnboundedSender<InboundMessage> {
    fn handle(&self, _connection: &ConnectionHandle, message: InboundMessage) {
        if self.send(message).is_err() {
            tracing::debug!("Inbound consumer gone, dropping client frame");
        }
    }
}

/// Applies the per-user message limiter before forwarding. Rejected frames
/// are dropped and the sender is told when it may retry.
pub struct RateLimitedInbound {
    limiter: Arc<SlidingWindowLimiter>,
    next: Arc<dyn InboundHandler>,
}

impl RateLimitedInbound {
    pub fn new(limiter: Arc<SlidingWindowLimiter>, next: Arc<dyn InboundHandler>) -> Self {
        Self { limiter, next }
    }
}

impl InboundHandler for RateLimitedInbound {
    fn handle(&self, connection: &ConnectionHandle, message: InboundMessage) {
        let key = message.user_id.to_string();
        let decision = self.limiter.try_acquire(&key);
        if !decision.allowed {
            tracing::warn!(
                user_id = %message.user_id,
                connection_id = %message.connection_id,
                retry_after = decision.retry_after_secs,
                "Inbound message rate limited"
            );
            let notice = Arc::new(Notification::rate_limited(decision.retry_after_secs));
            if let Err(e) = connection.try_enqueue(notice) {
                tracing::debug!(connection_id = %message.connection_id, error = %e, "Could not queue rate limit notice");
            }
            return;
        }
        self.next.handle(connection, message);
    }
}
