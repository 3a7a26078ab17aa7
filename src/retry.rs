//! Retry policy: how often and how patiently to retry opening a route.
//!
//! A [`RetryPolicy`] bundles a backoff schedule, jitter, an attempt limit, and a sleeper.
//! It is used twice by self-refreshing routers: once to open the first route
//! ([`RetryPolicy::execute`]) and once per refresh cycle ([`RetryPolicy::timer`]).
//!
//! Semantics:
//! - `max_attempts` counts total attempts (first try + retries).
//! - The first attempt runs immediately; retry `n` waits `backoff.delay(n)` with jitter.
//! - Failures are kept (most recent [`crate::error::MAX_RETRY_FAILURES`]) and returned in
//!   [`RetryExhausted`].
//!
//! ```rust
//! use std::time::Duration;
//! use waypoint::{Backoff, Jitter, RetryPolicy, TrackingSleeper};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let sleeper = TrackingSleeper::new();
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_jitter(Jitter::None)
//!     .with_sleeper(sleeper.clone())
//!     .build()
//!     .unwrap();
//! let result: Result<(), _> = policy.execute(|| async { Err("refused") }).await;
//! let err = result.unwrap_err();
//! assert_eq!(err.attempts(), 3);
//! assert_eq!(sleeper.delays(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
//! # });
//! ```

use crate::backoff::{Backoff, BackoffStep, BackoffTimer};
use crate::error::{RetryExhausted, MAX_RETRY_FAILURES};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy combining backoff, jitter, attempt limit, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl RetryPolicy {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Policy for opening the first route: 3 attempts, exponential from 100ms, full jitter.
    pub fn open_default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(100)),
            jitter: Jitter::Full,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Policy for refreshing a lost route: 10 attempts, fibonacci from 100ms capped at 10s,
    /// full jitter.
    pub fn refresh_default() -> Self {
        let backoff = Backoff::fibonacci(Duration::from_millis(100));
        Self {
            max_attempts: 10,
            backoff: backoff.clone().with_max(Duration::from_secs(10)).unwrap_or(backoff),
            jitter: Jitter::Full,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts allowed per cycle.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Fresh attempt cycle following this policy.
    pub fn timer(&self) -> BackoffTimer {
        BackoffTimer::new(self.backoff.clone(), self.jitter, self.max_attempts)
    }

    /// Wait using the policy's sleeper.
    pub fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        self.sleeper.sleep(delay)
    }

    /// Run `operation` until it succeeds or the attempts run out.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, RetryExhausted<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let mut timer = self.timer();
        let mut failures: VecDeque<E> = VecDeque::new();
        loop {
            match timer.next_step() {
                BackoffStep::Exhausted { attempts } => {
                    return Err(RetryExhausted::new(attempts, failures.into_iter().collect()));
                }
                BackoffStep::Wait { delay, .. } => {
                    if !delay.is_zero() {
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    failures.push_back(e);
                    while failures.len() > MAX_RETRY_FAILURES {
                        failures.pop_front();
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::open_default()
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    /// Start from [`RetryPolicy::open_default`].
    pub fn new() -> Self {
        let defaults = RetryPolicy::open_default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff: defaults.backoff,
            jitter: defaults.jitter,
            sleeper: defaults.sleeper,
        }
    }

    /// Set total attempts (first try + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set backoff strategy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
