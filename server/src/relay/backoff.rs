use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Jittered exponential delay between resubscription attempts.
#[derive(Debug, Clone)]
pub(crate) struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            current: initial,
        }
    }

    /// The next delay, within +/-20% of the current step.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let jitter = 0.8 + 0.4 * (nanos % 1000) as f64 / 1000.0;
        let delay = Duration::from_secs_f64((base * jitter).min(self.max.as_secs_f64()));
        self.current = Duration::from_secs_f64((base * self.multiplier).min(self.max.as_secs_f64()));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
