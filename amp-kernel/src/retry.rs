//! Exponential backoff for outbound operations.

use std::future::Future;
use std::time::Duration;

use amp_config::RetrySettings;
use amp_transport::TransportError;
use tokio::time::sleep;
use tracing::warn;

use crate::{RuntimeError, RuntimeResult};

/// Classifies failures for [`RetryPolicy::run`].
pub trait Retryable: Sized {
    /// Whether another attempt may succeed.
    fn is_transient(&self) -> bool;

    /// Wraps the final error once every attempt has failed transiently.
    #[must_use]
    fn exhausted(self, attempts: u32) -> Self {
        let _ = attempts;
        self
    }
}

impl Retryable for RuntimeError {
    fn is_transient(&self) -> bool {
        RuntimeError::is_transient(self)
    }

    fn exhausted(self, attempts: u32) -> Self {
        Self::RetriesExhausted {
            attempts,
            last: Box::new(self),
        }
    }
}

impl Retryable for TransportError {
    fn is_transient(&self) -> bool {
        TransportError::is_transient(self)
    }
}

/// `delay = base * multiplier^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 3,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for zero attempts, a
    /// multiplier below one, or a base delay above the cap.
    pub fn new(
        base_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
        max_delay: Duration,
    ) -> RuntimeResult<Self> {
        let policy = Self {
            base_delay,
            multiplier,
            max_attempts,
            max_delay,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Policy that makes a single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy from `[retry]` settings.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::new`].
    pub fn from_settings(settings: &RetrySettings) -> RuntimeResult<Self> {
        Self::new(
            Duration::from_millis(settings.base_delay_ms),
            settings.multiplier,
            settings.max_attempts,
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::new`].
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.max_attempts == 0 {
            return Err(RuntimeError::config("retry max_attempts must be at least 1"));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(RuntimeError::config("retry multiplier must be a finite value >= 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(RuntimeError::config("retry base delay cannot exceed max delay"));
        }
        Ok(())
    }

    /// Total attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Runs `operation` until it succeeds, fails permanently, or the
    /// attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error as is, or the last transient
    /// error passed through [`Retryable::exhausted`].
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt + 1 >= self.max_attempts => {
                    warn!(attempts = attempt + 1, error = %err, "retries exhausted");
                    return Err(err.exhausted(attempt + 1));
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use amp_security::SecurityError;
    use tokio::time::Instant;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(RetryPolicy::new(Duration::from_secs(1), 0.5, 3, Duration::from_secs(5)).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(1), 2.0, 0, Duration::from_secs(5)).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(9), 2.0, 3, Duration::from_secs(5)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = policy
            .run(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RuntimeError::Timeout { elapsed: Duration::from_millis(10) })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_error() {
        let policy = RetryPolicy::default();
        let err = policy
            .run(|_| async {
                Err::<(), _>(RuntimeError::from(TransportError::connection("refused")))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let err = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RuntimeError::from(SecurityError::auth("bad key"))) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Security(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
