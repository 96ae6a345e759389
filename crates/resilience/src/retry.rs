//! Retry controller with pluggable backoff and retry policies
//!
//! Attempts run strictly one after another. Between attempts the controller
//! sleeps on the async runtime (never blocking a thread) and then consults an
//! optional gate, which the executor uses to re-check the circuit breaker so a
//! retry never hits a dependency the breaker has given up on.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backoff::BackoffStrategy;
use crate::error::{ConfigError, ConfigResult, Failure, PolicyError};

/// Outcome of a retry execution including result and summary statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub result: Result<T, Failure<E>>,
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Convert the outcome into the underlying result
    pub fn into_result(self) -> Result<T, Failure<E>> {
        self.result
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Average delay between attempts
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            Duration::ZERO
        } else {
            self.total_delay / (self.attempts - 1)
        }
    }
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E>: Send + Sync {
    /// Decide what to do after `attempt` (1-based) failed with `error`
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the backoff delay
    Retry,
    /// Retry after this delay instead of the backoff delay
    RetryAfter(Duration),
    /// Give up; the error is returned as is
    Stop,
}

/// Sequential retry loop
pub struct RetryController<E> {
    max_attempts: u32,
    backoff: BackoffStrategy,
    policy: Arc<dyn RetryPolicy<E>>,
    _error: PhantomData<fn(E)>,
}

impl<E> fmt::Debug for RetryController<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryController")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<E> Clone for RetryController<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            policy: Arc::clone(&self.policy),
            _error: PhantomData,
        }
    }
}

impl<E> RetryController<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a controller allowing `max_attempts` invocations in total
    pub fn new(
        max_attempts: u32,
        backoff: BackoffStrategy,
        policy: Arc<dyn RetryPolicy<E>>,
    ) -> ConfigResult<Self> {
        if max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        backoff.validate()?;
        Ok(Self { max_attempts, backoff, policy, _error: PhantomData })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Run the operation until it succeeds, the policy stops, or the
    /// attempts run out
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_guarded(operation, || Ok(())).await
    }

    /// Like [`execute`](Self::execute), but `gate` must admit every retry
    ///
    /// The gate runs after the backoff sleep and before each attempt after the
    /// first. A refusal ends the loop with that rejection.
    pub async fn execute_guarded<F, Fut, T, G>(
        &self,
        mut operation: F,
        mut gate: G,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnMut() -> Result<(), PolicyError>,
    {
        let mut attempt = 0;
        let mut total_delay = Duration::ZERO;

        let result = loop {
            attempt += 1;
            debug!("Executing operation (attempt {}/{})", attempt, self.max_attempts);

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Operation succeeded after {} retries", attempt - 1);
                    }
                    break Ok(value);
                }
                Err(error) => error,
            };

            let decision = self.policy.should_retry(&error, attempt);
            if decision == RetryDecision::Stop {
                debug!(attempt, "Retry policy determined not to retry: {}", error);
                break Err(Failure::Operation { source: error });
            }

            if attempt >= self.max_attempts {
                warn!(attempts = attempt, "Retry attempts exhausted: {}", error);
                break Err(Failure::Exhausted { attempts: attempt, source: error });
            }

            let delay = match decision {
                RetryDecision::RetryAfter(delay) => delay,
                _ => self.backoff.delay_for(attempt),
            };
            debug!("Operation failed (attempt {}), retrying after {:?}: {}", attempt, delay, error);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            total_delay = total_delay.saturating_add(delay);

            if let Err(rejection) = gate() {
                debug!(attempt, %rejection, "Retry gate refused the next attempt");
                break Err(rejection.into());
            }
        };

        RetryOutcome { result, attempts: attempt, total_delay }
    }
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug, Clone)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool + Send + Sync,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::policies::*;
    use super::*;
    use crate::error::RejectReason;

    fn controller(
        max_attempts: u32,
        policy: Arc<dyn RetryPolicy<io::Error>>,
    ) -> RetryController<io::Error> {
        RetryController::new(max_attempts, BackoffStrategy::fixed(Duration::from_millis(10)), policy)
            .unwrap()
    }

    #[test]
    fn test_retry_decision_equality() {
        assert_eq!(RetryDecision::Retry, RetryDecision::Retry);
        assert_ne!(RetryDecision::Retry, RetryDecision::Stop);
        assert_ne!(
            RetryDecision::RetryAfter(Duration::from_secs(1)),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_controller_validation() {
        let policy: Arc<dyn RetryPolicy<io::Error>> = Arc::new(AlwaysRetry);
        assert!(RetryController::new(0, BackoffStrategy::default(), Arc::clone(&policy)).is_err());
        assert!(RetryController::new(
            3,
            BackoffStrategy::exponential(Duration::from_secs(2), 2.0, Duration::from_secs(1)),
            Arc::clone(&policy)
        )
        .is_err());
        assert!(RetryController::new(1, BackoffStrategy::default(), policy).is_ok());
    }

    /// Validates K failures followed by a success with `max_attempts > K`.
    ///
    /// Assertions:
    /// - The result is the success value.
    /// - The operation ran K+1 times and slept K backoff delays.
    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = controller(5, Arc::new(AlwaysRetry));

        let outcome = retry
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(io::Error::other("transient"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "ok");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = controller(4, Arc::new(AlwaysRetry));

        let outcome: RetryOutcome<(), io::Error> = retry
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(io::Error::other("down"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        match outcome.result {
            Err(Failure::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source.to_string(), "down");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_retry_returns_operation_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = controller(5, Arc::new(NeverRetry));

        let outcome: RetryOutcome<(), io::Error> = retry
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(io::Error::other("bad input"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.result, Err(Failure::Operation { .. })));
        assert_eq!(outcome.total_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_policy_stops_on_permanent_error() {
        let policy = PredicateRetry::new(|error: &io::Error, _attempt: u32| {
            error.kind() == io::ErrorKind::TimedOut
        });
        let retry = controller(5, Arc::new(policy));
        let calls = Arc::new(AtomicU32::new(0));

        let outcome: RetryOutcome<(), io::Error> = retry
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "slow"))
                    } else {
                        Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.cause().map(io::Error::kind), Some(io::ErrorKind::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        struct Throttled;
        impl RetryPolicy<io::Error> for Throttled {
            fn should_retry(&self, _error: &io::Error, _attempt: u32) -> RetryDecision {
                RetryDecision::RetryAfter(Duration::from_secs(2))
            }
        }

        let retry = controller(3, Arc::new(Throttled));
        let outcome: RetryOutcome<(), io::Error> =
            retry.execute(|| async { Err(io::Error::other("429")) }).await;

        assert_eq!(outcome.total_delay, Duration::from_secs(4));
        assert_eq!(outcome.average_delay(), Duration::from_secs(2));
    }

    /// Validates that a refusing gate stops the loop before the next attempt.
    ///
    /// Assertions:
    /// - Only the first attempt runs.
    /// - The result is the gate's rejection, not an operation failure.
    #[tokio::test(start_paused = true)]
    async fn test_gate_refusal_stops_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = controller(5, Arc::new(AlwaysRetry));

        let outcome: RetryOutcome<(), io::Error> = retry
            .execute_guarded(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(io::Error::other("down"))
                    }
                },
                || Err(PolicyError::Rejected(RejectReason::CircuitOpen)),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result.unwrap_err().reject_reason(), Some(RejectReason::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_are_applied_in_order() {
        let retry = RetryController::new(
            4,
            BackoffStrategy::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(1)),
            Arc::new(AlwaysRetry) as Arc<dyn RetryPolicy<io::Error>>,
        )
        .unwrap();

        let start = tokio::time::Instant::now();
        let outcome: RetryOutcome<(), io::Error> =
            retry.execute(|| async { Err(io::Error::other("down")) }).await;

        // 100 + 200 + 400
        assert_eq!(outcome.total_delay, Duration::from_millis(700));
        assert!(start.elapsed() >= Duration::from_millis(700));
    }
}
