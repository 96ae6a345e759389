//! Failure-ratio circuit breaker
//!
//! The breaker watches the outcomes of recent calls through a rolling
//! [`FailureWindow`] and fails fast once the failure ratio crosses its
//! threshold. After `reset_timeout` it lets a bounded number of trial calls
//! through to probe recovery.
//!
//! Every read-check-transition step runs under one mutex, so concurrent
//! callers can never observe a half-applied transition, a trip is stamped
//! exactly once, and the half-open trial cap holds under contention.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, Failure, PolicyError, RejectReason};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

//==============================================================================
// Failure window
//==============================================================================

/// Shape of the rolling outcome window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// The last `size` counted outcomes
    Count { size: usize },
    /// Outcomes recorded within the last `duration`
    Time { duration: Duration },
}

impl WindowKind {
    fn default_minimum_calls(self) -> usize {
        match self {
            WindowKind::Count { size } => size,
            WindowKind::Time { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    at: Instant,
    failed: bool,
}

/// Rolling record of recent call outcomes
#[derive(Debug, Clone)]
pub struct FailureWindow {
    kind: WindowKind,
    entries: VecDeque<WindowEntry>,
    failures: usize,
}

impl FailureWindow {
    /// Create an empty window of the given kind
    pub fn new(kind: WindowKind) -> Self {
        let capacity = match kind {
            WindowKind::Count { size } => size,
            WindowKind::Time { .. } => 16,
        };
        Self { kind, entries: VecDeque::with_capacity(capacity), failures: 0 }
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    /// Append an outcome observed at `at`, evicting what fell out of the window
    pub fn record(&mut self, at: Instant, failed: bool) {
        self.entries.push_back(WindowEntry { at, failed });
        if failed {
            self.failures += 1;
        }
        match self.kind {
            WindowKind::Count { size } => {
                while self.entries.len() > size {
                    self.pop_oldest();
                }
            }
            WindowKind::Time { .. } => self.evict_expired(at),
        }
    }

    /// Drop entries older than the time window (no-op for count windows)
    pub fn evict_expired(&mut self, now: Instant) {
        let WindowKind::Time { duration } = self.kind else {
            return;
        };
        while self
            .entries
            .front()
            .is_some_and(|entry| now.saturating_duration_since(entry.at) >= duration)
        {
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            if entry.failed {
                self.failures -= 1;
            }
        }
    }

    /// Outcomes currently in the window
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Failed outcomes currently in the window
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Failed share of the window, 0.0 when empty
    pub fn failure_rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.entries.len() as f64
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.failures = 0;
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure ratio in (0, 1] that opens the circuit
    pub failure_threshold: f64,
    /// Outcomes the ratio is computed over
    pub window: WindowKind,
    /// Outcomes required in the window before the ratio is evaluated
    pub minimum_calls: usize,
    /// Time to wait before transitioning from open to half-open
    pub reset_timeout: Duration,
    /// Maximum number of trial calls admitted per half-open episode
    pub half_open_max_calls: u32,
    /// Successful trials needed to close the circuit from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let window = WindowKind::Count { size: 10 };
        Self {
            failure_threshold: 0.5,
            minimum_calls: window.default_minimum_calls(),
            window,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.failure_threshold.is_finite()
            || self.failure_threshold <= 0.0
            || self.failure_threshold > 1.0
        {
            return Err(ConfigError::invalid(format!(
                "failure_threshold must be in (0, 1], got {}",
                self.failure_threshold
            )));
        }

        match self.window {
            WindowKind::Count { size: 0 } => {
                return Err(ConfigError::invalid("failure window size must be greater than 0"));
            }
            WindowKind::Count { size } if self.minimum_calls > size => {
                return Err(ConfigError::invalid(format!(
                    "minimum_calls ({}) cannot exceed the failure window size ({size})",
                    self.minimum_calls
                )));
            }
            WindowKind::Time { duration } if duration.is_zero() => {
                return Err(ConfigError::invalid("failure window duration must be non-zero"));
            }
            _ => {}
        }

        if self.minimum_calls == 0 {
            return Err(ConfigError::invalid("minimum_calls must be greater than 0"));
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }

        if self.success_threshold == 0 || self.success_threshold > self.half_open_max_calls {
            return Err(ConfigError::invalid(
                "success_threshold must be between 1 and half_open_max_calls",
            ));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
///
/// `minimum_calls` follows the window unless set explicitly: the full window
/// size for count windows, one call for time windows.
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
    minimum_calls: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, ratio: f64) -> Self {
        self.config.failure_threshold = ratio;
        self
    }

    pub fn window(mut self, window: WindowKind) -> Self {
        self.config.window = window;
        self
    }

    /// Evaluate the ratio over the last `size` calls
    pub fn count_window(self, size: usize) -> Self {
        self.window(WindowKind::Count { size })
    }

    /// Evaluate the ratio over calls completed within `duration`
    pub fn time_window(self, duration: Duration) -> Self {
        self.window(WindowKind::Time { duration })
    }

    pub fn minimum_calls(mut self, calls: usize) -> Self {
        self.minimum_calls = Some(calls);
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

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn build(mut self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.minimum_calls =
            self.minimum_calls.unwrap_or_else(|| self.config.window.default_minimum_calls());
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Breaker
//==============================================================================

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Failures recorded since construction
    pub failure_count: u64,
    /// Successes recorded since construction
    pub success_count: u64,
    /// Outcomes currently in the failure window
    pub window_len: usize,
    /// Failure ratio of the current window
    pub failure_rate: f64,
    /// Calls admitted
    pub total_calls: u64,
    /// Calls rejected while open or with the trial slots taken
    pub rejected_calls: u64,
    /// Number of times the circuit opened
    pub open_count: u64,
    /// Trial calls admitted while half-open
    pub half_open_calls: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    // Bumped on every transition; outcomes from an older generation are stale.
    generation: u64,
    window: FailureWindow,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
    trial_successes: u32,
    success_count: u64,
    failure_count: u64,
    total_calls: u64,
    rejected_calls: u64,
    open_count: u64,
    half_open_calls: u64,
}

impl BreakerCore {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.trials_in_flight = 0;
        self.trial_successes = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.open_count += 1;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.window.clear();
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Ratio-based circuit breaker
///
/// Generic over its [`Clock`] so tests can drive the reset timeout with a
/// [`MockClock`](crate::clock::MockClock).
///
/// # Examples
///
/// ```rust
/// use bulwark_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let config = CircuitBreakerConfig::builder()
///     .failure_threshold(0.5)
///     .count_window(4)
///     .build()
///     .unwrap();
/// let breaker = CircuitBreaker::new(config).unwrap();
///
/// let permit = breaker.try_acquire().unwrap();
/// permit.record_success();
/// assert_eq!(breaker.state(), CircuitState::Closed);
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    clock: C,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &core.state)
            .field("window_len", &core.window.len())
            .field("failures", &core.window.failures())
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a circuit breaker with a custom clock
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let core = BreakerCore {
            state: CircuitState::Closed,
            generation: 0,
            window: FailureWindow::new(config.window),
            opened_at: None,
            trials_in_flight: 0,
            trial_successes: 0,
            success_count: 0,
            failure_count: 0,
            total_calls: 0,
            rejected_calls: 0,
            open_count: 0,
            half_open_calls: 0,
        };

        Ok(Self { config, core: Mutex::new(core), clock })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask for admission
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// here, and this caller becomes the first trial.
    pub fn try_acquire(&self) -> Result<CallPermit<'_, C>, PolicyError> {
        let now = self.clock.now();
        let mut core = self.core.lock();

        match core.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let cooled_down = core.opened_at.map_or(true, |opened_at| {
                    now.saturating_duration_since(opened_at) >= self.config.reset_timeout
                });
                if !cooled_down {
                    core.rejected_calls += 1;
                    debug!("Circuit breaker rejecting call - state: {}", core.state);
                    return Err(PolicyError::Rejected(RejectReason::CircuitOpen));
                }
                core.transition(CircuitState::HalfOpen, now);
                info!("Circuit breaker half-open, admitting trial calls");
                core.trials_in_flight += 1;
                core.half_open_calls += 1;
            }
            CircuitState::HalfOpen => {
                if core.trials_in_flight + core.trial_successes >= self.config.half_open_max_calls {
                    core.rejected_calls += 1;
                    debug!(
                        trials_in_flight = core.trials_in_flight,
                        "Circuit breaker rejecting call - half-open trials taken"
                    );
                    return Err(PolicyError::Rejected(RejectReason::CircuitOpen));
                }
                core.trials_in_flight += 1;
                core.half_open_calls += 1;
            }
        }

        core.total_calls += 1;
        Ok(CallPermit { breaker: self, generation: core.generation, completed: false })
    }

    fn complete(&self, generation: u64, outcome: Outcome) {
        let now = self.clock.now();
        let mut core = self.core.lock();

        match outcome {
            Outcome::Success => core.success_count += 1,
            Outcome::Failure => core.failure_count += 1,
            Outcome::Ignored => {}
        }

        if generation != core.generation {
            debug!(?outcome, state = %core.state, "Circuit breaker: discarding outcome from an earlier state");
            return;
        }

        match core.state {
            CircuitState::Closed => {
                let failed = match outcome {
                    Outcome::Success => false,
                    Outcome::Failure => true,
                    Outcome::Ignored => return,
                };
                core.window.record(now, failed);

                let rate = core.window.failure_rate();
                if core.window.len() >= self.config.minimum_calls
                    && rate >= self.config.failure_threshold
                {
                    let failures = core.window.failures();
                    core.transition(CircuitState::Open, now);
                    warn!(
                        failure_rate = rate,
                        failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                core.trials_in_flight = core.trials_in_flight.saturating_sub(1);
                match outcome {
                    Outcome::Success => {
                        core.trial_successes += 1;
                        if core.trial_successes >= self.config.success_threshold {
                            let successes = core.trial_successes;
                            core.transition(CircuitState::Closed, now);
                            info!("Circuit breaker closed after {} successful trials", successes);
                        }
                    }
                    Outcome::Failure => {
                        core.transition(CircuitState::Open, now);
                        warn!("Circuit breaker re-opened after a failed trial");
                    }
                    Outcome::Ignored => {}
                }
            }
            // No permit is issued while open, so none can complete in it.
            CircuitState::Open => {}
        }
    }

    /// Current state, without applying any pending transition
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Whether the circuit is not open
    ///
    /// A caller that already holds a permit should ask
    /// [`CallPermit::is_current`] instead: a half-open circuit is not open,
    /// but it only has room for its own trials.
    pub fn is_call_permitted(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Manually force the circuit closed and clear the failure window
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut core = self.core.lock();
        let previous = core.state;
        core.transition(CircuitState::Closed, now);
        info!(%previous, "Circuit breaker manually reset");
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Every error counts as a failure.
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, Failure<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(error) => {
                permit.record_failure();
                warn!("Circuit breaker: operation failed - {}", error);
                Err(Failure::Operation { source: error })
            }
        }
    }

    /// Execute a synchronous operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, Failure<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire()?;

        match operation() {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(error) => {
                permit.record_failure();
                warn!("Circuit breaker: operation failed - {}", error);
                Err(Failure::Operation { source: error })
            }
        }
    }

    /// Get circuit breaker metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = self.clock.now();
        let mut core = self.core.lock();
        core.window.evict_expired(now);

        CircuitBreakerMetrics {
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            window_len: core.window.len(),
            failure_rate: core.window.failure_rate(),
            total_calls: core.total_calls,
            rejected_calls: core.rejected_calls,
            open_count: core.open_count,
            half_open_calls: core.half_open_calls,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
///
/// Consume it with exactly one of `record_success`, `record_failure` or
/// `ignore`. Dropping it unrecorded is the same as `ignore`.
#[must_use = "an unrecorded permit is treated as an ignored outcome"]
pub struct CallPermit<'a, C: Clock = SystemClock> {
    breaker: &'a CircuitBreaker<C>,
    generation: u64,
    completed: bool,
}

impl<C: Clock> CallPermit<'_, C> {
    /// Whether this permit still belongs to the breaker's current state
    ///
    /// False once the circuit has opened or moved on to another episode since
    /// the permit was granted. A caller between retry attempts must stop
    /// then, otherwise it would reach the dependency next to the half-open
    /// trials.
    pub fn is_current(&self) -> bool {
        let core = self.breaker.core.lock();
        core.generation == self.generation && core.state != CircuitState::Open
    }

    /// Count the call as a success
    pub fn record_success(mut self) {
        self.finish(Outcome::Success);
    }

    /// Count the call as a failure
    pub fn record_failure(mut self) {
        self.finish(Outcome::Failure);
    }

    /// Release the permit without counting the outcome
    pub fn ignore(mut self) {
        self.finish(Outcome::Ignored);
    }

    fn finish(&mut self, outcome: Outcome) {
        if !self.completed {
            self.completed = true;
            self.breaker.complete(self.generation, outcome);
        }
    }
}

impl<C: Clock> Drop for CallPermit<'_, C> {
    fn drop(&mut self) {
        self.finish(Outcome::Ignored);
    }
}

impl<C: Clock> fmt::Debug for CallPermit<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("generation", &self.generation)
            .field("completed", &self.completed)
            .finish()
    }
}
