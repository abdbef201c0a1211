/*
[INPUT]:  Reconnect policy (base delay, cap) and a random source
[OUTPUT]: Successive retry delays with decorrelated jitter
[POS]:    WebSocket layer - reconnect pacing
[UPDATE]: When changing reconnect backoff behavior
*/

use std::time::Duration;

use rand::Rng;

/// Decorrelated-jitter backoff: each delay is drawn from `[base, 3 * previous]`, clamped to `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    previous: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        let cap = cap.max(base);
        Self {
            base,
            cap,
            previous: base,
        }
    }

    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let low = self.base.as_millis() as u64;
        let high = (self.previous.as_millis() as u64)
            .saturating_mul(3)
            .min(self.cap.as_millis() as u64)
            .max(low);
        let delay = Duration::from_millis(rng.gen_range(low..=high));
        self.previous = delay;
        delay
    }

    /// Forget the growth so far; called after a successful connect.
    pub fn reset(&mut self) {
        self.previous = self.base;
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}
