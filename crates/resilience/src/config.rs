//! Executor configuration
//!
//! [`ExecutorConfig`] enumerates every option the executor recognizes and is
//! checked once, at construction. With the `serde` feature it can be embedded
//! in a host application's TOML or JSON configuration; durations are encoded
//! as integer milliseconds (`*_ms` keys).

use std::time::Duration;

use crate::backoff::BackoffStrategy;
use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::{CircuitBreakerConfig, WindowKind};
use crate::error::{ConfigError, ConfigResult};

/// How the bulkhead isolates callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum IsolationStrategy {
    /// Counting semaphore; calls run in the caller's own task
    #[default]
    Semaphore,
    /// Named pool of worker lanes; lanes label and account for capacity,
    /// the work still runs in the caller's task
    WorkerPool,
}

/// Token-bucket admission control in front of the pipeline
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitConfig {
    /// Burst size; the bucket starts full
    pub capacity: u64,
    /// Tokens added per second
    pub refill_rate_per_second: f64,
    /// Wait up to this long for a token; `None` rejects immediately
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "max_wait_ms",
            default,
            skip_serializing_if = "Option::is_none",
            with = "crate::config::duration_millis_opt"
        )
    )]
    pub max_wait: Option<Duration>,
}

impl RateLimitConfig {
    /// Non-blocking limiter
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Self {
        Self { capacity, refill_rate_per_second, max_wait: None }
    }

    /// Wait up to `max_wait` for a token instead of rejecting immediately
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("rate_limit.capacity must be greater than 0"));
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(ConfigError::invalid(
                "rate_limit.refill_rate_per_second must be a positive number",
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`ResilienceExecutor`](crate::ResilienceExecutor)
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExecutorConfig {
    /// Name of the protected dependency, carried in logs
    pub name: String,

    /// Maximum concurrent executions
    pub max_concurrency: usize,
    /// Callers allowed to wait for a bulkhead slot
    pub max_queue_depth: usize,
    /// Longest wait for a bulkhead slot; `None` waits indefinitely
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "queue_timeout_ms",
            with = "crate::config::duration_millis_opt"
        )
    )]
    pub queue_timeout: Option<Duration>,
    pub isolation: IsolationStrategy,

    /// Failure ratio in (0, 1] that opens the circuit
    pub failure_threshold: f64,
    /// Count window: the ratio covers the last N calls
    pub failure_window_size: usize,
    /// Time window: when set, replaces the count window
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "failure_window_duration_ms",
            skip_serializing_if = "Option::is_none",
            with = "crate::config::duration_millis_opt"
        )
    )]
    pub failure_window_duration: Option<Duration>,
    /// Outcomes required before the ratio is evaluated; defaults to the
    /// window size (count window) or 1 (time window)
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub minimum_calls: Option<usize>,
    #[cfg_attr(
        feature = "serde",
        serde(rename = "reset_timeout_ms", with = "crate::config::duration_millis")
    )]
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,

    /// Total invocations per call, including the first
    pub max_retry_attempts: u32,
    pub backoff_strategy: BackoffStrategy,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrency: 10,
            max_queue_depth: 10,
            queue_timeout: Some(Duration::from_secs(5)),
            isolation: IsolationStrategy::Semaphore,
            failure_threshold: 0.5,
            failure_window_size: 10,
            failure_window_duration: None,
            minimum_calls: None,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            max_retry_attempts: 3,
            backoff_strategy: BackoffStrategy::default(),
            rate_limit: None,
        }
    }
}

impl ExecutorConfig {
    /// Create a configuration builder
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::new()
    }

    /// Validate every option
    pub fn validate(&self) -> ConfigResult<()> {
        self.bulkhead_config().validate()?;
        self.circuit_breaker_config()?;

        if self.max_retry_attempts == 0 {
            return Err(ConfigError::invalid("max_retry_attempts must be greater than 0"));
        }
        self.backoff_strategy.validate()?;

        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }

    /// Failure window selected by the options
    pub fn failure_window(&self) -> WindowKind {
        match self.failure_window_duration {
            Some(duration) => WindowKind::Time { duration },
            None => WindowKind::Count { size: self.failure_window_size },
        }
    }

    /// Bulkhead settings derived from this configuration
    pub fn bulkhead_config(&self) -> BulkheadConfig {
        BulkheadConfig::new(self.name.clone(), self.max_concurrency, self.max_queue_depth)
    }

    /// Validated circuit breaker settings derived from this configuration
    pub fn circuit_breaker_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        let builder = CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .window(self.failure_window())
            .reset_timeout(self.reset_timeout)
            .half_open_max_calls(self.half_open_max_calls);

        match self.minimum_calls {
            Some(calls) => builder.minimum_calls(calls).build(),
            None => builder.build(),
        }
    }
}

/// Builder for ExecutorConfig
#[derive(Debug, Default)]
pub struct ExecutorConfigBuilder {
    config: ExecutorConfig,
}

impl ExecutorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.config.max_queue_depth = depth;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue_timeout = Some(timeout);
        self
    }

    /// Wait for a bulkhead slot without a bound
    pub fn unbounded_queue_wait(mut self) -> Self {
        self.config.queue_timeout = None;
        self
    }

    pub fn isolation(mut self, isolation: IsolationStrategy) -> Self {
        self.config.isolation = isolation;
        self
    }

    pub fn failure_threshold(mut self, ratio: f64) -> Self {
        self.config.failure_threshold = ratio;
        self
    }

    pub fn failure_window_size(mut self, size: usize) -> Self {
        self.config.failure_window_size = size;
        self.config.failure_window_duration = None;
        self
    }

    pub fn failure_window_duration(mut self, duration: Duration) -> Self {
        self.config.failure_window_duration = Some(duration);
        self
    }

    pub fn minimum_calls(mut self, calls: usize) -> Self {
        self.config.minimum_calls = Some(calls);
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.config.backoff_strategy = strategy;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = Some(rate_limit);
        self
    }

    pub fn build(self) -> ConfigResult<ExecutorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(feature = "serde")]
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(feature = "serde")]
pub(crate) mod duration_millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer
                .serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}
