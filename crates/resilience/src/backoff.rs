//! Backoff strategies mapping an attempt number to a wait duration
//!
//! Strategies are plain values: computing a delay has no side effects and
//! touches no shared state. The jittered variant draws from the thread-local
//! generator, so concurrent callers never contend on a shared PRNG.

use std::time::Duration;

use rand::Rng;

use crate::error::{ConfigError, ConfigResult};

/// Backoff strategy for calculating retry delays
///
/// `attempt` is 1-based: `delay_for(1)` is the wait after the first failed
/// attempt.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum BackoffStrategy {
    /// Constant delay between attempts
    Fixed {
        #[cfg_attr(feature = "serde", serde(rename = "delay_ms", with = "crate::config::duration_millis"))]
        delay: Duration,
    },
    /// `initial + increment * (attempt - 1)`
    Linear {
        #[cfg_attr(feature = "serde", serde(rename = "initial_ms", with = "crate::config::duration_millis"))]
        initial: Duration,
        #[cfg_attr(feature = "serde", serde(rename = "increment_ms", with = "crate::config::duration_millis"))]
        increment: Duration,
    },
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`
    Exponential {
        #[cfg_attr(feature = "serde", serde(rename = "base_ms", with = "crate::config::duration_millis"))]
        base: Duration,
        multiplier: f64,
        #[cfg_attr(feature = "serde", serde(rename = "max_delay_ms", with = "crate::config::duration_millis"))]
        max_delay: Duration,
    },
    /// Exponential delay scaled by a uniform factor in `[0, 1]` (full jitter)
    ExponentialJitter {
        #[cfg_attr(feature = "serde", serde(rename = "base_ms", with = "crate::config::duration_millis"))]
        base: Duration,
        multiplier: f64,
        #[cfg_attr(feature = "serde", serde(rename = "max_delay_ms", with = "crate::config::duration_millis"))]
        max_delay: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Constant delay
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed { delay }
    }

    /// Linearly growing delay
    pub fn linear(initial: Duration, increment: Duration) -> Self {
        BackoffStrategy::Linear { initial, increment }
    }

    /// Exponentially growing delay capped at `max_delay`
    pub fn exponential(base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        BackoffStrategy::Exponential { base, multiplier, max_delay }
    }

    /// Exponentially growing delay with full jitter
    pub fn exponential_jitter(base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        BackoffStrategy::ExponentialJitter { base, multiplier, max_delay }
    }

    /// Calculate the delay to wait after the given (1-based) attempt failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { initial, increment } => {
                initial.saturating_add(increment.saturating_mul(attempt - 1))
            }
            BackoffStrategy::Exponential { base, multiplier, max_delay } => {
                exponential_delay(*base, *multiplier, *max_delay, attempt)
            }
            BackoffStrategy::ExponentialJitter { base, multiplier, max_delay } => {
                let ceiling = exponential_delay(*base, *multiplier, *max_delay, attempt);
                let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
                ceiling.mul_f64(factor)
            }
        }
    }

    /// Validate the strategy parameters
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            BackoffStrategy::Fixed { .. } | BackoffStrategy::Linear { .. } => Ok(()),
            BackoffStrategy::Exponential { base, multiplier, max_delay }
            | BackoffStrategy::ExponentialJitter { base, multiplier, max_delay } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(ConfigError::invalid(
                        "backoff multiplier must be a finite number >= 1.0",
                    ));
                }
                if max_delay < base {
                    return Err(ConfigError::invalid("backoff max_delay must be >= base delay"));
                }
                Ok(())
            }
        }
    }
}

fn exponential_delay(base: Duration, multiplier: f64, max_delay: Duration, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * multiplier.powi(exponent);
    if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
        return max_delay;
    }
    Duration::from_secs_f64(secs.max(0.0))
}
