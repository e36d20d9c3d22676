//! Retry-with-backoff policy shared by every external call.
//!
//! Each suspension point (model gateway, repository, tracker) runs its call
//! through a [`RetryPolicies`] value. The error decides its own class through
//! [`Retryable`]; the policy decides how often and how long to wait.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Provider asked us to slow down
    RateLimited,
    /// Temporary failure (5xx, network); retry a bounded number of times
    Transient,
    /// Retrying cannot help
    Fatal,
}

/// Errors that can be classified for retry.
pub trait Retryable: Display {
    fn retry_class(&self) -> RetryClass;

    /// Server-provided delay hint (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with jitter.
///
/// # Invariants
/// - `max_attempts >= 1` (the first call counts as an attempt)
/// - `delay_for(n) <= max_delay + jitter`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter (0.0 - 1.0)
    pub jitter: f64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.25,
        }
    }

    /// A policy that never retries.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Backoff before the attempt following `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);

        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Policies per error class for one kind of external call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicies {
    pub rate_limited: RetryPolicy,
    pub transient: RetryPolicy,
}

impl RetryPolicies {
    /// Same policy for every retryable class.
    pub const fn uniform(policy: RetryPolicy) -> Self {
        Self {
            rate_limited: policy,
            transient: policy,
        }
    }

    /// Policies that never retry.
    pub const fn none() -> Self {
        Self::uniform(RetryPolicy::once())
    }

    fn policy_for(&self, class: RetryClass) -> Option<&RetryPolicy> {
        match class {
            RetryClass::RateLimited => Some(&self.rate_limited),
            RetryClass::Transient => Some(&self.transient),
            RetryClass::Fatal => None,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or exhausts its class's attempts.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded after {} attempts", label, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let Some(policy) = self.policy_for(err.retry_class()) else {
                tracing::debug!("{} failed (not retryable): {}", label, err);
                return Err(err);
            };
            if attempt >= policy.max_attempts {
                tracing::warn!("{} failed after {} attempts: {}", label, attempt, err);
                return Err(err);
            }

            let delay = err
                .retry_after()
                .unwrap_or_else(|| policy.delay_for(attempt));
            tracing::warn!(
                "{} attempt {} failed, retrying in {:?}: {}",
                label,
                attempt,
                delay,
                err
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Retry policies for each external collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    /// Model gateway calls
    pub model: RetryPolicies,
    /// Branch + commit + pull request materialization
    pub publish: RetryPolicies,
    /// Tracker updates (best effort)
    pub tracker: RetryPolicies,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            model: RetryPolicies {
                rate_limited: RetryPolicy::new(4, Duration::from_secs(5), Duration::from_secs(60)),
                transient: RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(30)),
            },
            // one retry, exponential backoff
            publish: RetryPolicies::uniform(RetryPolicy::new(
                2,
                Duration::from_secs(2),
                Duration::from_secs(30),
            )),
            tracker: RetryPolicies::uniform(RetryPolicy::new(
                2,
                Duration::from_secs(1),
                Duration::from_secs(5),
            )),
        }
    }
}

impl RetrySettings {
    /// Same attempt counts as the defaults but without any waiting.
    pub fn immediate() -> Self {
        fn zero(p: RetryPolicy) -> RetryPolicy {
            RetryPolicy {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter: 0.0,
                ..p
            }
        }
        let d = Self::default();
        let zero_all = |p: RetryPolicies| RetryPolicies {
            rate_limited: zero(p.rate_limited),
            transient: zero(p.transient),
        };
        Self {
            model: zero_all(d.model),
            publish: zero_all(d.publish),
            tracker: zero_all(d.tracker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(RetryClass);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Retryable for TestError {
        fn retry_class(&self) -> RetryClass {
            self.0
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(8))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.5);
        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_exhausted() {
        let calls = AtomicU32::new(0);
        let policies = RetrySettings::immediate().model;
        let result: Result<(), TestError> = policies
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(RetryClass::Transient)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), policies.transient.max_attempts);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = RetrySettings::immediate()
            .model
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(RetryClass::Fatal)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_rate_limit() {
        let calls = AtomicU32::new(0);
        let result = RetrySettings::immediate()
            .model
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError(RetryClass::RateLimited))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_none_makes_a_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = tokio_test::block_on(RetryPolicies::none().run(
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(RetryClass::RateLimited)) }
            },
        ));
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
