//! Bounded reconnection policy.
//!
//! Each disconnection episode gets `max_attempts` retries spaced by a fixed
//! delay. A successful connection ends the episode and resets the count.

use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Cap reached; stay disconnected.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Retries used in the current episode.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    pub fn on_disconnected(&mut self) -> RetryDecision {
        if self.attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        self.attempts += 1;
        RetryDecision::Retry(self.delay)
    }

    /// Fresh copy with the counter at zero, for a new session.
    pub fn reset(&self) -> Self {
        Self::new(self.delay, self.max_attempts)
    }
}
