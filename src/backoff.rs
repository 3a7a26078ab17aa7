//! Backoff strategies and the stateful attempt cycle used to refresh routes.
//!
//! Provides constant, linear, exponential, and fibonacci strategies with optional caps.
//! Attempt semantics: attempt index `0` is the first try (no delay); later attempts wait
//! `delay(attempt)`. Delays saturate at [`MAX_BACKOFF`] instead of overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use waypoint::Backoff;
//!
//! let backoff = Backoff::fibonacci(Duration::from_millis(100))
//!     .with_max(Duration::from_millis(400))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // first try
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(200));
//! assert_eq!(backoff.delay(4), Duration::from_millis(300));
//! assert_eq!(backoff.delay(5), Duration::from_millis(400)); // capped
//! ```

use crate::jitter::Jitter;
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is not valid for constant backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Constant,
    Linear,
    Exponential,
    Fibonacci,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    growth: Growth,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { growth: Growth::Constant, base: delay, max: None }
    }

    /// `base * attempt`.
    pub fn linear(base: Duration) -> Self {
        Self { growth: Growth::Linear, base, max: None }
    }

    /// `base * 2^(attempt - 1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { growth: Growth::Exponential, base, max: None }
    }

    /// `base * fib(attempt)`: 1, 1, 2, 3, 5, 8, ...
    pub fn fibonacci(base: Duration) -> Self {
        Self { growth: Growth::Fibonacci, base, max: None }
    }

    /// Cap the delay. Errors on constant backoff, a zero cap, or a cap below `base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if self.growth == Growth::Constant {
            return Err(BackoffError::ConstantDoesNotSupportMax);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Delay before `attempt` (0-based; 0 = first try, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let step = attempt.min(u32::MAX as usize) as u32;
        let multiplier: u128 = match self.growth {
            Growth::Constant => 1,
            Growth::Linear => u128::from(step),
            Growth::Exponential => 2u128.saturating_pow(step - 1),
            Growth::Fibonacci => fibonacci(step),
        };
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let raw = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        let capped = self.max.map(|m| raw.min(m)).unwrap_or(raw);
        capped.min(MAX_BACKOFF)
    }
}

/// fib(1) = fib(2) = 1; saturates instead of overflowing.
fn fibonacci(n: u32) -> u128 {
    let (mut prev, mut cur) = (0u128, 1u128);
    for _ in 1..n {
        let next = prev.saturating_add(cur);
        prev = cur;
        cur = next;
        if cur == u128::MAX {
            break;
        }
    }
    cur
}

/// Outcome of asking a [`BackoffTimer`] for the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait `delay`, then make attempt number `attempt` (0-based).
    Wait { attempt: usize, delay: Duration },
    /// No attempts left in this cycle.
    Exhausted { attempts: usize },
}

/// Stateful attempt cycle over a [`Backoff`] schedule.
///
/// Each call to [`BackoffTimer::next_step`] consumes one attempt; [`BackoffTimer::reset`] starts
/// the schedule over.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    backoff: Backoff,
    jitter: Jitter,
    max_attempts: usize,
    attempt: usize,
}

impl BackoffTimer {
    /// Allow up to `max_attempts` attempts per cycle.
    pub fn new(backoff: Backoff, jitter: Jitter, max_attempts: usize) -> Self {
        Self { backoff, jitter, max_attempts, attempt: 0 }
    }

    /// Consume the next attempt of the cycle.
    pub fn next_step(&mut self) -> BackoffStep {
        if self.attempt >= self.max_attempts {
            return BackoffStep::Exhausted { attempts: self.attempt };
        }
        let attempt = self.attempt;
        self.attempt += 1;
        let delay = self.jitter.apply(self.backoff.delay(attempt));
        BackoffStep::Wait { attempt, delay }
    }

    /// Start the schedule over.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed in the current cycle.
    pub fn attempts(&self) -> usize {
        self.attempt
    }
}
