//! The resilience executor
//!
//! Composes the policies into one pipeline per call:
//!
//! ```text
//! rate limiter -> bulkhead -> circuit breaker -> retry -> operation
//! ```
//!
//! Any stage may short-circuit with its [`Failure`] without touching the
//! stages behind it. Permits taken along the way are RAII guards, so they are
//! released on every exit path, including a timeout or the caller dropping
//! the future.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::bulkhead::{Bulkhead, SemaphoreBulkhead, WorkerPoolBulkhead};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::{ExecutorConfig, IsolationStrategy};
use crate::error::{ConfigResult, Failure, PolicyError, RejectReason};
use crate::metrics::{CallOutcome, ExecutorMetrics, MetricsRecorder};
use crate::rate_limiter::{RateLimiter, TokenBucket};
use crate::retry::{policies::AlwaysRetry, RetryController, RetryPolicy};

/// Decides which operation errors count as circuit breaker failures
pub type FailurePredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Fault-tolerant wrapper around calls to one dependency
///
/// Each executor owns its own breaker, bulkhead, limiter and counters; share
/// it between tasks with an `Arc`.
pub struct ResilienceExecutor<E> {
    config: ExecutorConfig,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    bulkhead: Arc<dyn Bulkhead>,
    breaker: CircuitBreaker<SharedClock>,
    retry: RetryController<E>,
    failure_predicate: FailurePredicate<E>,
    metrics: MetricsRecorder,
}

impl<E> fmt::Debug for ResilienceExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceExecutor")
            .field("name", &self.config.name)
            .field("rate_limiter", &self.rate_limiter)
            .field("bulkhead", &self.bulkhead)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`ResilienceExecutor`] with injected collaborators
pub struct ExecutorBuilder<E> {
    config: ExecutorConfig,
    retry_policy: Option<Arc<dyn RetryPolicy<E>>>,
    failure_predicate: Option<FailurePredicate<E>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    bulkhead: Option<Arc<dyn Bulkhead>>,
    clock: Option<SharedClock>,
}

impl<E> ExecutorBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            retry_policy: None,
            failure_predicate: None,
            rate_limiter: None,
            bulkhead: None,
            clock: None,
        }
    }

    /// Decide per error whether to retry (default: retry everything)
    pub fn retry_policy(mut self, policy: impl RetryPolicy<E> + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Decide per error whether it counts against the circuit (default:
    /// every error counts)
    pub fn failure_predicate(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.failure_predicate = Some(Arc::new(predicate));
        self
    }

    /// Use this limiter instead of the token bucket built from `rate_limit`
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Use this bulkhead instead of the one built from the config
    pub fn bulkhead(mut self, bulkhead: Arc<dyn Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Drive the breaker and the built-in limiter from this clock
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn build(self) -> ConfigResult<ResilienceExecutor<E>> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as SharedClock);

        let rate_limiter = match (self.rate_limiter, &config.rate_limit) {
            (Some(limiter), _) => Some(limiter),
            (None, Some(rate_limit)) => Some(Arc::new(TokenBucket::with_clock(
                rate_limit.capacity,
                rate_limit.refill_rate_per_second,
                Arc::clone(&clock),
            )?) as Arc<dyn RateLimiter>),
            (None, None) => None,
        };

        let bulkhead: Arc<dyn Bulkhead> = match self.bulkhead {
            Some(bulkhead) => bulkhead,
            None => match config.isolation {
                IsolationStrategy::Semaphore => {
                    Arc::new(SemaphoreBulkhead::new(config.bulkhead_config())?) as Arc<dyn Bulkhead>
                }
                IsolationStrategy::WorkerPool => {
                    Arc::new(WorkerPoolBulkhead::new(config.bulkhead_config())?) as Arc<dyn Bulkhead>
                }
            },
        };

        let breaker = CircuitBreaker::with_clock(config.circuit_breaker_config()?, clock)?;

        let retry = RetryController::new(
            config.max_retry_attempts,
            config.backoff_strategy.clone(),
            self.retry_policy.unwrap_or_else(|| Arc::new(AlwaysRetry) as Arc<dyn RetryPolicy<E>>),
        )?;

        let failure_predicate = self
            .failure_predicate
            .unwrap_or_else(|| Arc::new(|_: &E| true) as FailurePredicate<E>);

        debug!(
            executor = %config.name,
            max_concurrency = config.max_concurrency,
            isolation = ?config.isolation,
            rate_limited = rate_limiter.is_some(),
            "Resilience executor created"
        );

        Ok(ResilienceExecutor {
            config,
            rate_limiter,
            bulkhead,
            breaker,
            retry,
            failure_predicate,
            metrics: MetricsRecorder::default(),
        })
    }
}

impl<E> ResilienceExecutor<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create an executor from a validated configuration
    pub fn new(config: ExecutorConfig) -> ConfigResult<Self> {
        Self::builder(config).build()
    }

    /// Start building an executor with injected collaborators
    pub fn builder(config: ExecutorConfig) -> ExecutorBuilder<E> {
        ExecutorBuilder::new(config)
    }

    /// Run the operation through the full pipeline
    #[instrument(skip(self, operation), fields(executor = %self.config.name))]
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, Failure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, None).await
    }

    /// Run the operation with one deadline covering every stage
    ///
    /// The rate limiter wait, the bulkhead queue, every attempt and every
    /// backoff sleep share the same deadline. On expiry the call fails with
    /// `Timeout`, which counts as a breaker failure once the breaker admitted
    /// the call.
    #[instrument(skip(self, operation), fields(executor = %self.config.name))]
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        operation: F,
        timeout: Duration,
    ) -> Result<T, Failure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, Some(timeout)).await
    }

    /// Run the operation, turning any failure into `fallback(&failure)`
    #[instrument(skip(self, operation, fallback), fields(executor = %self.config.name))]
    pub async fn execute_with_fallback<F, Fut, T, FB>(&self, operation: F, fallback: FB) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(&Failure<E>) -> T,
    {
        match self.run(operation, None).await {
            Ok(value) => value,
            Err(failure) => {
                debug!(%failure, "Serving fallback");
                fallback(&failure)
            }
        }
    }

    async fn run<F, Fut, T>(&self, operation: F, timeout: Option<Duration>) -> Result<T, Failure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
        let mut record = self.metrics.begin();

        let result = self.pipeline(operation, deadline, &mut record).await;

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(Failure::Rejected(reason)) => {
                debug!(%reason, "Call rejected");
                CallOutcome::Rejected
            }
            Err(Failure::Timeout { timeout }) => {
                warn!(?timeout, "Call timed out");
                CallOutcome::Timeout
            }
            Err(Failure::Exhausted { .. } | Failure::Operation { .. }) => CallOutcome::Failure,
        };
        record.finish(outcome);

        result
    }

    async fn pipeline<F, Fut, T>(
        &self,
        mut operation: F,
        deadline: Option<(Instant, Duration)>,
        record: &mut crate::metrics::CallRecord<'_>,
    ) -> Result<T, Failure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            self.admit_rate(limiter.as_ref(), deadline).await?;
        }

        let queue_wait = bounded_wait(self.config.queue_timeout, deadline);
        let _slot = self.bulkhead.acquire(queue_wait).await.map_err(|error| match (error, deadline) {
            (PolicyError::Timeout { .. }, Some((at, timeout))) if Instant::now() >= at => {
                Failure::Timeout { timeout }
            }
            (error, _) => error.into(),
        })?;
        let _in_flight = self.metrics.enter();

        let permit = self.breaker.try_acquire()?;
        record.operation_started();

        let metrics = &self.metrics;
        let attempts = self.retry.execute_guarded(
            || {
                metrics.record_attempt();
                operation()
            },
            || {
                // A permit from before a trip must not retry alongside the
                // half-open trials.
                if permit.is_current() {
                    Ok(())
                } else {
                    Err(PolicyError::Rejected(RejectReason::CircuitOpen))
                }
            },
        );

        let result = match deadline {
            Some((at, timeout)) => match tokio::time::timeout_at(at, attempts).await {
                Ok(outcome) => outcome.result,
                Err(_) => Err(Failure::Timeout { timeout }),
            },
            None => attempts.await.result,
        };

        match &result {
            Ok(_) => permit.record_success(),
            Err(Failure::Exhausted { source, .. } | Failure::Operation { source }) => {
                if (self.failure_predicate)(source) {
                    permit.record_failure();
                } else {
                    debug!("Error excluded from circuit breaker accounting: {}", source);
                    permit.ignore();
                }
            }
            Err(Failure::Timeout { .. }) => permit.record_failure(),
            // The breaker opened while this call was retrying.
            Err(Failure::Rejected(_)) => permit.ignore(),
        }

        result
    }

    async fn admit_rate(
        &self,
        limiter: &dyn RateLimiter,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<(), Failure<E>> {
        let max_wait = self.config.rate_limit.as_ref().and_then(|rate_limit| rate_limit.max_wait);

        let admitted = match bounded_wait(max_wait, deadline) {
            Some(wait) if max_wait.is_some() => limiter.acquire(wait).await,
            _ => limiter.try_acquire(),
        };
        if admitted {
            return Ok(());
        }

        match deadline {
            Some((at, timeout)) if Instant::now() >= at => Err(Failure::Timeout { timeout }),
            _ => Err(Failure::Rejected(RejectReason::RateLimited)),
        }
    }

    /// Snapshot of the executor's counters
    pub fn metrics(&self) -> ExecutorMetrics {
        self.metrics.snapshot(self.breaker.state())
    }

    /// Current circuit breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Force the circuit closed
    pub fn reset_circuit(&self) {
        info!(executor = %self.config.name, "Resetting circuit breaker");
        self.breaker.reset();
    }

    /// Configuration the executor was built from
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker<SharedClock> {
        &self.breaker
    }

    pub fn bulkhead(&self) -> &Arc<dyn Bulkhead> {
        &self.bulkhead
    }

    pub fn rate_limiter(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn retry_controller(&self) -> &RetryController<E> {
        &self.retry
    }
}

/// The tighter of a stage's own wait bound and the time left to the deadline
fn bounded_wait(wait: Option<Duration>, deadline: Option<(Instant, Duration)>) -> Option<Duration> {
    let remaining = deadline.map(|(at, _)| at.saturating_duration_since(Instant::now()));
    match (wait, remaining) {
        (Some(wait), Some(remaining)) => Some(wait.min(remaining)),
        (wait, None) => wait,
        (None, remaining) => remaining,
    }
}
