//! Reconnect backoff for the status channel.

use std::time::Duration;

/// Delay between reconnect attempts after the status feed drops.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// Reconnect immediately. Used by tests to avoid real timers.
    None,
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(delay) => *delay,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(*max, |d| d.min(*max))
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}
