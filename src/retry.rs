use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::config::RetrySettings;
use crate::error::{Error, Result};

/// Exponential backoff with jitter and an explicit ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// `None` keeps retrying until `max_elapsed` (if any) runs out.
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            initial_interval: Duration::from_millis(settings.initial_interval_ms),
            multiplier: settings.multiplier,
            randomization_factor: settings.randomization_factor,
            max_interval: Duration::from_millis(settings.max_interval_ms),
            max_attempts: (settings.max_attempts > 0).then_some(settings.max_attempts),
            max_elapsed: (settings.max_elapsed > 0).then(|| Duration::from_secs(settings.max_elapsed)),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }

    fn schedule(&self) -> ExponentialBackoff {
        // The elapsed-time ceiling is enforced by `retry` on tokio's clock.
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `call` until it succeeds, fails permanently, or the policy's ceiling
/// is reached.
///
/// Permanent errors are returned untouched after a single attempt. Running out
/// of attempts or time yields [`Error::RetriesExhausted`] wrapping the last
/// retryable error.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut schedule = policy.schedule();
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let err = match call().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        let elapsed = started.elapsed();
        let delay = schedule.next_backoff().unwrap_or(policy.max_interval);
        let out_of_attempts = policy.max_attempts.map_or(false, |max| attempt >= max);
        let out_of_time = policy.max_elapsed.map_or(false, |max| elapsed + delay > max);

        if out_of_attempts || out_of_time {
            error!(operation, attempt, elapsed_ms = elapsed.as_millis() as u64, error = %err, "Giving up");
            return Err(Error::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempt,
                elapsed,
                source: Box::new(err),
            });
        }

        warn!(
            operation,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Call failed; retrying"
        );
        sleep(delay).await;
    }
}
