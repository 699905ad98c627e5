use std::sync::Arc;

use crate::hub::Hub;
use crate::ratelimit::SlidingWindowLimiter;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    /// HS256 secret for access-token verification
    pub jwt_secret: Vec<u8>,
    /// Connection attempts keyed by client IP
    pub ip_limiter: Arc<SlidingWindowLimiter>,
    /// Connection attempts keyed by user id
    pub user_limiter: Arc<SlidingWindowLimiter>,
    /// Cap on inbound frame size, enforced at upgrade
    pub max_frame_bytes: usize,
}
