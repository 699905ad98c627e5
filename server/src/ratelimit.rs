//! Sliding-window admission control.
//!
//! Each key (client IP, user id, ...) owns the timestamps of its attempts
//! within the trailing window. Windows are sharded in a `DashMap`, so
//! contention stays local to a key.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Outcome of a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Suggested delay before retrying, in whole seconds (rounded up).
    pub retry_after_secs: u64,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
        }
    }
}

pub struct SlidingWindowLimiter {
    max_attempts: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: DashMap::new(),
        }
    }

    /// Drop timestamps that fell out of the window.
    fn prune(&self, attempts: &mut VecDeque<Instant>, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while attempts.front().is_some_and(|ts| *ts <= cutoff) {
            attempts.pop_front();
        }
    }

    fn decide(&self, attempts: &VecDeque<Instant>, now: Instant) -> Decision {
        if attempts.len() < self.max_attempts {
            return Decision::allow();
        }
        let retry_after = attempts
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default();
        Decision {
            allowed: false,
            retry_after_secs: (retry_after.as_millis().div_ceil(1000) as u64).max(1),
        }
    }

    /// Check whether another attempt for `key` would be admitted. Does not record.
    pub fn check_limit(&self, key: &str) -> Decision {
        let now = Instant::now();
        match self.windows.get_mut(key) {
            Some(mut attempts) => {
                self.prune(&mut attempts, now);
                self.decide(&attempts, now)
            }
            None => Decision::allow(),
        }
    }

    /// Record an attempt for `key`.
    pub fn record_attempt(&self, key: &str) {
        let now = Instant::now();
        let mut attempts = self.windows.entry(key.to_string()).or_default();
        self.prune(&mut attempts, now);
        attempts.push_back(now);
    }

    /// Check and, when admitted, record in one step under the key's lock.
    pub fn try_acquire(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut attempts = self.windows.entry(key.to_string()).or_default();
        self.prune(&mut attempts, now);
        let decision = self.decide(&attempts, now);
        if decision.allowed {
            attempts.push_back(now);
        }
        decision
    }

    /// Forget keys whose windows have emptied.
    pub fn purge_idle(&self) {
        let now = Instant::now();
        self.windows.retain(|_, attempts| {
            self.prune(attempts, now);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Purge idle keys every `every` until `cancel` fires.
    pub async fn run_purger(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.purge_idle(),
            }
        }
    }
}
