//! Rate limiting implementations for admission control
//!
//! This module provides four rate limiting algorithms behind the
//! [`RateLimiter`] trait:
//! - **Token Bucket**: Allows bursts up to a maximum capacity, refilled at a
//!   fixed rate
//! - **Sliding Window**: Admits at most `limit` calls in any trailing window
//! - **Fixed Window**: Admits at most `limit` calls per aligned window
//! - **Leaky Bucket**: Enforces a smooth, constant rate
//!
//! Each limiter keeps its state behind a single mutex, so the
//! refill-check-deduct sequence is one atomic step and concurrent callers can
//! never spend the same permit twice.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};

/// Tolerance for floating-point token arithmetic
const TOKEN_EPSILON: f64 = 1e-9;

/// Admission control deciding whether a call may proceed right now
#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Try to take one permit without waiting
    fn try_acquire(&self) -> bool;

    /// Estimated time until a permit becomes available (zero if one is
    /// available now)
    fn time_until_available(&self) -> Duration;

    /// Wait up to `timeout` for a permit
    ///
    /// A permit is only consumed when this returns `true`, so dropping the
    /// future while it waits leaks nothing.
    async fn acquire(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            let wait = self.time_until_available().max(Duration::from_millis(1)).min(remaining);
            tokio::time::sleep(wait).await;
        }
    }
}

fn require_positive_rate(rate: f64, name: &str) -> ConfigResult<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::invalid(format!("{name} must be a finite number greater than 0")));
    }
    Ok(())
}

//==============================================================================
// Token Bucket
//==============================================================================

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// Starts full with `capacity` tokens and refills continuously at
/// `refill_rate_per_second`. Each admitted call spends one token.
///
/// # Examples
///
/// ```rust
/// use bulwark_resilience::{RateLimiter, TokenBucket};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = TokenBucket::new(10, 5.0)?;
///
/// if limiter.try_acquire() {
///     println!("Request allowed");
/// } else {
///     println!("Rate limit exceeded");
/// }
/// # Ok(())
/// # }
/// ```
pub struct TokenBucket<C: Clock = SystemClock> {
    capacity: u64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<C>,
}

impl TokenBucket<SystemClock> {
    /// Create a new token bucket with system clock
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> ConfigResult<Self> {
        Self::with_clock(capacity, refill_rate_per_second, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a new token bucket with custom clock
    pub fn with_clock(capacity: u64, refill_rate_per_second: f64, clock: C) -> ConfigResult<Self> {
        if capacity == 0 {
            return Err(ConfigError::invalid("capacity must be greater than 0"));
        }
        require_positive_rate(refill_rate_per_second, "refill_rate_per_second")?;

        Ok(Self {
            capacity,
            refill_rate: refill_rate_per_second,
            state: Mutex::new(BucketState { tokens: capacity as f64, last_refill: clock.now() }),
            clock: Arc::new(clock),
        })
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if !elapsed.is_zero() {
            state.tokens =
                (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity as f64);
            state.last_refill = now;
        }
    }

    /// Get the current number of whole tokens available
    pub fn available_tokens(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        (state.tokens + TOKEN_EPSILON).floor() as u64
    }

    /// Maximum number of tokens the bucket can hold
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reset the limiter to full capacity
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.capacity as f64;
        state.last_refill = self.clock.now();
    }
}

impl<C: Clock> RateLimiter for TokenBucket<C> {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens + TOKEN_EPSILON < 1.0 {
            debug!(tokens = state.tokens, "Rate limit: token bucket empty");
            return false;
        }
        state.tokens = (state.tokens - 1.0).max(0.0);
        true
    }

    fn time_until_available(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);

        let missing = 1.0 - state.tokens;
        if missing <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing / self.refill_rate)
    }
}

impl<C: Clock> fmt::Debug for TokenBucket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

//==============================================================================
// Sliding Window
//==============================================================================

/// Sliding window log rate limiter
///
/// Remembers the admission instant of each call inside the trailing window;
/// a call is admitted while fewer than `limit` admissions remain in it.
pub struct SlidingWindow<C: Clock = SystemClock> {
    limit: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
    clock: Arc<C>,
}

impl SlidingWindow<SystemClock> {
    /// Create a new sliding window limiter with system clock
    pub fn new(limit: usize, window: Duration) -> ConfigResult<Self> {
        Self::with_clock(limit, window, SystemClock)
    }
}

impl<C: Clock> SlidingWindow<C> {
    /// Create a new sliding window limiter with custom clock
    pub fn with_clock(limit: usize, window: Duration, clock: C) -> ConfigResult<Self> {
        if limit == 0 {
            return Err(ConfigError::invalid("limit must be greater than 0"));
        }
        if window.is_zero() {
            return Err(ConfigError::invalid("window must be greater than zero"));
        }
        Ok(Self {
            limit,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(limit)),
            clock: Arc::new(clock),
        })
    }

    fn evict(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of admissions inside the current window
    pub fn current_count(&self) -> usize {
        let mut admitted = self.admitted.lock();
        self.evict(&mut admitted, self.clock.now());
        admitted.len()
    }

    /// Forget every recorded admission
    pub fn reset(&self) {
        self.admitted.lock().clear();
    }
}

impl<C: Clock> RateLimiter for SlidingWindow<C> {
    fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut admitted = self.admitted.lock();
        self.evict(&mut admitted, now);

        if admitted.len() >= self.limit {
            debug!(limit = self.limit, "Rate limit: sliding window full");
            return false;
        }
        admitted.push_back(now);
        true
    }

    fn time_until_available(&self) -> Duration {
        let now = self.clock.now();
        let mut admitted = self.admitted.lock();
        self.evict(&mut admitted, now);

        if admitted.len() < self.limit {
            return Duration::ZERO;
        }
        admitted
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

impl<C: Clock> fmt::Debug for SlidingWindow<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("admitted", &self.admitted.lock().len())
            .finish()
    }
}

//==============================================================================
// Fixed Window
//==============================================================================

#[derive(Debug)]
struct WindowState {
    started: Instant,
    count: usize,
}

/// Fixed window counter rate limiter
///
/// Admits at most `limit` calls per window; the counter resets at each window
/// boundary.
pub struct FixedWindow<C: Clock = SystemClock> {
    limit: usize,
    window: Duration,
    state: Mutex<WindowState>,
    clock: Arc<C>,
}

impl FixedWindow<SystemClock> {
    /// Create a new fixed window limiter with system clock
    pub fn new(limit: usize, window: Duration) -> ConfigResult<Self> {
        Self::with_clock(limit, window, SystemClock)
    }
}

impl<C: Clock> FixedWindow<C> {
    /// Create a new fixed window limiter with custom clock
    pub fn with_clock(limit: usize, window: Duration, clock: C) -> ConfigResult<Self> {
        if limit == 0 {
            return Err(ConfigError::invalid("limit must be greater than 0"));
        }
        if window.is_zero() {
            return Err(ConfigError::invalid("window must be greater than zero"));
        }
        Ok(Self {
            limit,
            window,
            state: Mutex::new(WindowState { started: clock.now(), count: 0 }),
            clock: Arc::new(clock),
        })
    }

    fn roll(&self, state: &mut WindowState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.started);
        if elapsed >= self.window {
            // Align to the window grid so idle periods don't shift boundaries.
            let windows = elapsed.as_nanos() / self.window.as_nanos();
            let skipped = u32::try_from(windows).unwrap_or(u32::MAX);
            state.started += self.window.saturating_mul(skipped);
            state.count = 0;
        }
    }

    /// Reset the counter and start a new window now
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.started = self.clock.now();
        state.count = 0;
    }
}

impl<C: Clock> RateLimiter for FixedWindow<C> {
    fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);

        if state.count >= self.limit {
            debug!(limit = self.limit, "Rate limit: fixed window exhausted");
            return false;
        }
        state.count += 1;
        true
    }

    fn time_until_available(&self) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);

        if state.count < self.limit {
            return Duration::ZERO;
        }
        (state.started + self.window).saturating_duration_since(now)
    }
}

impl<C: Clock> fmt::Debug for FixedWindow<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindow")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("count", &self.state.lock().count)
            .finish()
    }
}

//==============================================================================
// Leaky Bucket
//==============================================================================

#[derive(Debug)]
struct LeakState {
    level: f64,
    last_leak: Instant,
}

/// Leaky bucket rate limiter
///
/// Enforces a smooth, constant rate by leaking requests at a fixed rate.
/// Requests that would overflow the bucket are rejected.
pub struct LeakyBucket<C: Clock = SystemClock> {
    capacity: u64,
    leak_rate: f64,
    state: Mutex<LeakState>,
    clock: Arc<C>,
}

impl LeakyBucket<SystemClock> {
    /// Create a new leaky bucket with system clock
    pub fn new(capacity: u64, leak_rate_per_second: f64) -> ConfigResult<Self> {
        Self::with_clock(capacity, leak_rate_per_second, SystemClock)
    }
}

impl<C: Clock> LeakyBucket<C> {
    /// Create a new leaky bucket with custom clock
    pub fn with_clock(capacity: u64, leak_rate_per_second: f64, clock: C) -> ConfigResult<Self> {
        if capacity == 0 {
            return Err(ConfigError::invalid("capacity must be greater than 0"));
        }
        require_positive_rate(leak_rate_per_second, "leak_rate_per_second")?;

        Ok(Self {
            capacity,
            leak_rate: leak_rate_per_second,
            state: Mutex::new(LeakState { level: 0.0, last_leak: clock.now() }),
            clock: Arc::new(clock),
        })
    }

    fn leak(&self, state: &mut LeakState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_leak);
        if !elapsed.is_zero() {
            state.level = (state.level - elapsed.as_secs_f64() * self.leak_rate).max(0.0);
            state.last_leak = now;
        }
    }

    /// Current fill level of the bucket
    pub fn current_level(&self) -> f64 {
        let mut state = self.state.lock();
        self.leak(&mut state);
        state.level
    }

    /// Reset the limiter to empty
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.level = 0.0;
        state.last_leak = self.clock.now();
    }
}

impl<C: Clock> RateLimiter for LeakyBucket<C> {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.leak(&mut state);

        if state.level + 1.0 > self.capacity as f64 + TOKEN_EPSILON {
            debug!(level = state.level, capacity = self.capacity, "Rate limit: bucket full");
            return false;
        }
        state.level += 1.0;
        true
    }

    fn time_until_available(&self) -> Duration {
        let mut state = self.state.lock();
        self.leak(&mut state);

        let overflow = state.level + 1.0 - self.capacity as f64;
        if overflow <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(overflow / self.leak_rate)
    }
}

impl<C: Clock> fmt::Debug for LeakyBucket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("capacity", &self.capacity)
            .field("leak_rate", &self.leak_rate)
            .field("level", &self.state.lock().level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::MockClock;

    #[test]
    fn test_token_bucket_basic() {
        let bucket = TokenBucket::with_clock(10, 5.0, MockClock::new()).unwrap();

        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert_eq!(bucket.available_tokens(), 0);
        assert!(!bucket.try_acquire());
    }

    /// Validates the burst-then-refill contract: `capacity` immediate calls
    /// succeed, the next is rejected, and exactly one more succeeds after
    /// `1 / refill_rate` seconds.
    #[test]
    fn test_token_bucket_refill_one_token() {
        let clock = MockClock::new();
        let bucket = TokenBucket::with_clock(5, 10.0, clock.clone()).unwrap();

        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        clock.advance(Duration::from_millis(100));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_token_bucket_refill_is_capped() {
        let clock = MockClock::new();
        let bucket = TokenBucket::with_clock(10, 50.0, clock.clone()).unwrap();

        assert!(bucket.try_acquire());
        clock.advance(Duration::from_secs(60));
        assert_eq!(bucket.available_tokens(), 10);
    }

    #[test]
    fn test_token_bucket_time_until_available() {
        let clock = MockClock::new();
        let bucket = TokenBucket::with_clock(1, 4.0, clock.clone()).unwrap();

        assert_eq!(bucket.time_until_available(), Duration::ZERO);
        assert!(bucket.try_acquire());
        assert_eq!(bucket.time_until_available(), Duration::from_millis(250));

        clock.advance_millis(100);
        let wait = bucket.time_until_available();
        assert!(wait > Duration::from_millis(149) && wait <= Duration::from_millis(150));
    }

    #[test]
    fn test_token_bucket_reset() {
        let bucket = TokenBucket::with_clock(3, 1.0, MockClock::new()).unwrap();
        while bucket.try_acquire() {}

        bucket.reset();
        assert_eq!(bucket.available_tokens(), 3);
    }

    #[test]
    fn test_token_bucket_no_double_spend_under_contention() {
        let bucket = Arc::new(TokenBucket::with_clock(100, 1.0, MockClock::new()).unwrap());
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if bucket.try_acquire() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_sliding_window() {
        let clock = MockClock::new();
        let limiter = SlidingWindow::with_clock(3, Duration::from_secs(1), clock.clone()).unwrap();

        assert!(limiter.try_acquire());
        clock.advance_millis(400);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.time_until_available(), Duration::from_millis(600));

        // First admission leaves the window
        clock.advance_millis(600);
        assert_eq!(limiter.current_count(), 2);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_fixed_window_resets_at_boundary() {
        let clock = MockClock::new();
        let limiter = FixedWindow::with_clock(2, Duration::from_secs(1), clock.clone()).unwrap();

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        clock.advance_millis(999);
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.time_until_available(), Duration::from_millis(1));

        clock.advance_millis(1);
        assert!(limiter.try_acquire());

        // Skipping several windows keeps boundaries aligned
        clock.advance_millis(3_500);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.time_until_available(), Duration::from_millis(500));
    }

    #[test]
    fn test_leaky_bucket_leak() {
        let clock = MockClock::new();
        let bucket = LeakyBucket::with_clock(10, 5.0, clock.clone()).unwrap();

        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // Wait 1 second - should leak 5 requests
        clock.advance(Duration::from_secs(1));
        assert!((bucket.current_level() - 5.0).abs() < 1e-9);
        assert!(bucket.try_acquire());

        bucket.reset();
        assert_eq!(bucket.current_level(), 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(TokenBucket::new(0, 1.0).is_err());
        assert!(TokenBucket::new(1, 0.0).is_err());
        assert!(TokenBucket::new(1, f64::INFINITY).is_err());
        assert!(SlidingWindow::new(0, Duration::from_secs(1)).is_err());
        assert!(SlidingWindow::new(1, Duration::ZERO).is_err());
        assert!(FixedWindow::new(0, Duration::from_secs(1)).is_err());
        assert!(LeakyBucket::new(10, -1.0).is_err());
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1, 50.0).unwrap();
        assert!(bucket.try_acquire());

        let started = std::time::Instant::now();
        assert!(bucket.acquire(Duration::from_millis(500)).await);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_blocking_acquire_times_out() {
        let limiter = SlidingWindow::new(1, Duration::from_secs(60)).unwrap();
        assert!(limiter.try_acquire());

        assert!(!limiter.acquire(Duration::from_millis(30)).await);
        assert_eq!(limiter.current_count(), 1);
    }
}
