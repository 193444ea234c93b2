//! Jittered exponential backoff between critical-section retries.

use std::time::Duration;

use rand::Rng;

/// Backoff policy applied by the driver between repeated aborts of the same
/// critical section, and by the remote mailbox between commit retries.
///
/// Delays double from `initial` up to `max`, and each delay is jittered
/// uniformly over `[delay / 2, delay]` so two archetypes spinning on
/// reciprocally full buffers cannot stay in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// A policy doubling from `initial` up to `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Reset after a successful commit.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The next jittered delay. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self
            .initial
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        if micros == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(micros / 2..=micros);
        Duration::from_micros(jittered)
    }

    /// Sleep for the next delay.
    pub async fn pause(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }
}
