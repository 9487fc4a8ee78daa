use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::ExchangeConfig;
use crate::error::ExchangeError;

/// Exponential backoff with jitter between exchange call attempts
///
/// Formula: min(max_delay, base * 2^attempt) +/- jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            // gen_range panics on an inverted range
            jitter_factor: jitter_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Next delay; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let exp_delay = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let capped_delay = exp_delay.min(self.max_delay);

        let jitter_range = capped_delay.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64((capped_delay.as_secs_f64() + jitter).max(0.0))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Bounded retry of exchange calls, each attempt under a timeout
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
    pub jitter_factor: f64,
}

impl From<&ExchangeConfig> for RetryPolicy {
    fn from(config: &ExchangeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, self.max_delay, self.jitter_factor)
    }

    /// Run one attempt, turning an elapsed timeout into a network error
    pub async fn timed<T, Fut>(&self, operation: &str, call: Fut) -> Result<T, ExchangeError>
    where
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::timeout(
                operation,
                self.call_timeout.as_millis(),
            )),
        }
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut backoff = self.backoff();
        loop {
            match self.timed(operation, call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && backoff.attempt() < self.max_retries => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation,
                        backoff.attempt(),
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
