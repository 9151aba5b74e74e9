//! Retrying throttled source calls.
//!
//! Only [`SourceFault::Throttled`] is retried. The caller's request is
//! repeated unchanged, so a paginated read stays on the same page until the
//! source answers it. Every other fault ends the call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::source::SourceFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// Delay and attempt policy used when the source does not say how long to wait.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Base delay in milliseconds (default: 1000ms).
    pub base_delay_ms: u64,
    /// Cap for both computed delays and server-suggested waits (default: 5 minutes).
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay (default: 0.25).
    pub jitter_factor: f64,
    /// `None` retries for as long as the source keeps throttling.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_reads()
    }
}

impl RetryPolicy {
    /// Unbounded retries; page reads are safe to repeat.
    #[must_use]
    pub fn for_reads() -> Self {
        Self {
            backoff: Backoff::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
            jitter_factor: 0.25,
            max_attempts: None,
        }
    }

    /// Bounded retries for calls that are not idempotent.
    #[must_use]
    pub fn for_writes(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::for_reads()
        }
    }

    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            backoff: Backoff::Fixed,
            base_delay_ms: 5,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be > 0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max_delay_ms must be >= base_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be in range [0.0, 1.0]".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Parses a `Retry-After` value given in seconds.
    #[must_use]
    pub fn parse_retry_after(header_value: &str) -> Option<u64> {
        header_value.trim().parse::<u64>().ok()
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    #[must_use]
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let delay_ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base * f64::from(attempt.saturating_add(1)),
            Backoff::Exponential => base * 2_f64.powi(attempt.min(31) as i32),
        };
        Duration::from_millis(delay_ms.min(max) as u64)
    }

    #[must_use]
    pub fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let delay_ms = delay.as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(0.0..=delay_ms * self.jitter_factor);
        Duration::from_millis((delay_ms + jitter) as u64)
    }

    /// The wait after a throttle. A server-suggested wait wins over the
    /// computed backoff, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let delay = match retry_after {
            Some(suggested) => {
                if suggested > max {
                    warn!(?suggested, ?max, "retry-after exceeds max delay, capping");
                }
                suggested.min(max)
            }
            None => self.calculate_backoff_delay(attempt),
        };
        self.add_jitter(delay)
    }

    /// Runs `op` until it stops being throttled. Cancellation during a wait
    /// returns [`SyncError::Cancelled`] without another attempt.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceFault>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "request succeeded after throttling");
                    }
                    return Ok(value);
                }
                Err(SourceFault::Throttled { retry_after }) => {
                    attempt = attempt.saturating_add(1);
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(SyncError::Throttled { attempts: attempt });
                    }
                    let delay = self.delay_for(attempt - 1, retry_after);
                    warn!(attempt, ?delay, "source throttled, waiting before retry");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(SourceFault::InvalidContinuation { message }) => {
                    return Err(SyncError::invalid_continuation(message));
                }
                Err(SourceFault::Failed { message }) => return Err(SyncError::source(message)),
            }
        }
    }
}
