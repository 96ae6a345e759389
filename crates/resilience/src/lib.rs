//! Composable resilience policies for unreliable async operations.
//!
//! The crate wraps a caller-supplied operation in a fixed pipeline of
//! fault-tolerance policies:
//!
//! ```text
//! RateLimiter -> Bulkhead -> CircuitBreaker -> Retry -> Operation
//! ```
//!
//! Each policy is usable on its own, and [`ResilienceExecutor`] composes them
//! so that they interact correctly under concurrent load:
//! - **Rate Limiter**: admission control (token bucket, sliding window, fixed
//!   window, leaky bucket)
//! - **Bulkhead**: bounded concurrency with a bounded FIFO wait queue
//!   (semaphore or dedicated worker lanes)
//! - **Circuit Breaker**: Closed/Open/HalfOpen state machine over a rolling
//!   failure window
//! - **Retry Controller**: sequential attempts driven by a
//!   [`BackoffStrategy`] and a [`RetryPolicy`]
//!
//! Every executor owns its own policy state; nothing is process-global.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use bulwark_resilience::{BackoffStrategy, ExecutorConfig, ResilienceExecutor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExecutorConfig::builder()
//!     .max_concurrency(8)
//!     .max_retry_attempts(3)
//!     .backoff(BackoffStrategy::fixed(Duration::from_millis(50)))
//!     .build()?;
//!
//! let executor = ResilienceExecutor::<std::io::Error>::new(config)?;
//! let value = executor.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use backoff::BackoffStrategy;
pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit, SemaphoreBulkhead,
    WorkerPoolBulkhead,
};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerMetrics, CircuitState, FailureWindow, WindowKind,
};
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::{ExecutorConfig, ExecutorConfigBuilder, IsolationStrategy, RateLimitConfig};
pub use error::{ConfigError, ConfigResult, Failure, PolicyError, RejectReason};
pub use executor::{ExecutorBuilder, FailurePredicate, ResilienceExecutor};
pub use metrics::ExecutorMetrics;
pub use rate_limiter::{FixedWindow, LeakyBucket, RateLimiter, SlidingWindow, TokenBucket};
pub use retry::{policies, RetryController, RetryDecision, RetryOutcome, RetryPolicy};
