//! Reconnect delay policy.

use std::time::Duration;

/// First reconnect delay, and the delay after any successful connect.
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on the reconnect delay.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff: 1, 2, 4, ... seconds, capped at [`MAX_DELAY`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_bounds(INITIAL_DELAY, MAX_DELAY)
    }

    pub fn with_bounds(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Delay the next reconnect will wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the delay to wait now and double the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
