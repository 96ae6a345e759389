//! Bulkhead pattern for limiting concurrent operations
//!
//! The bulkhead pattern prevents resource exhaustion by limiting the number
//! of concurrent operations. Named after ship bulkheads that contain flooding
//! to specific compartments, this pattern isolates failures and prevents
//! cascading resource exhaustion.
//!
//! Two isolation strategies share the [`Bulkhead`] contract:
//! - [`SemaphoreBulkhead`] limits only the concurrency count and runs the work
//!   in the caller's own execution context.
//! - [`WorkerPoolBulkhead`] owns a named pool of worker lanes and binds every
//!   permit to one lane. Lanes are capacity labels with per-lane accounting;
//!   the work still runs in the caller's task, so neither strategy gives
//!   thread isolation.
//!
//! Callers that find every slot held join a FIFO wait queue bounded by
//! `max_queue`; when the queue is full too they are rejected immediately.
//! Permits release on drop, so every exit path returns the slot.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult, PolicyError, RejectReason};

/// Configuration for bulkhead behavior
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Name of the isolated resource (for logging)
    pub name: String,
    /// Maximum number of concurrent operations allowed
    pub max_concurrent: usize,
    /// Maximum number of operations waiting in queue
    pub max_queue: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { name: "default".to_string(), max_concurrent: 10, max_queue: 10 }
    }
}

impl BulkheadConfig {
    /// Create a configuration for a named resource
    pub fn new(name: impl Into<String>, max_concurrent: usize, max_queue: usize) -> Self {
        Self { name: name.into(), max_concurrent, max_queue }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid("max_concurrent exceeds the semaphore limit"));
        }
        Ok(())
    }
}

/// Metrics for bulkhead monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadMetrics {
    /// Total number of operations admitted
    pub total_operations: u64,
    /// Total number of operations rejected (full)
    pub rejected_operations: u64,
    /// Total number of timeouts waiting for permit
    pub timeout_count: u64,
    /// Current number of concurrent operations
    pub current_concurrent: usize,
    /// Current number of operations waiting in queue
    pub current_queued: usize,
    /// Maximum concurrent operations allowed
    pub max_concurrent: usize,
}

impl BulkheadMetrics {
    /// Calculate the current utilization as a percentage (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_concurrent as f64 / self.max_concurrent as f64
    }

    /// Calculate the rejection rate as a percentage (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_operations + self.rejected_operations;
        if total == 0 {
            return 0.0;
        }
        self.rejected_operations as f64 / total as f64
    }

    /// Check if the bulkhead is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.current_concurrent >= self.max_concurrent
    }
}

/// Bounded concurrency isolation for one logical resource pool
#[async_trait]
pub trait Bulkhead: Send + Sync + fmt::Debug {
    /// Acquire a permit, waiting in the FIFO queue for at most `timeout`
    /// (`None` waits indefinitely)
    ///
    /// Fails with `Rejected(BulkheadFull)` when every slot and every queue
    /// place is taken, or with `Timeout` when the wait exceeds `timeout`.
    async fn acquire(&self, timeout: Option<Duration>) -> Result<BulkheadPermit, PolicyError>;

    /// Maximum number of concurrently held permits
    fn max_concurrency(&self) -> usize;

    /// Snapshot of the bulkhead's counters
    fn metrics(&self) -> BulkheadMetrics;
}

/// A held bulkhead slot
///
/// The slot returns to the pool when the permit is dropped or released.
#[must_use = "the bulkhead slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit {
    // Dropped before `_slot` so the lane is free again before a waiter wakes.
    lane: Option<WorkerLane>,
    _slot: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    /// The dedicated worker lane bound to this permit, if the bulkhead uses
    /// worker-pool isolation
    pub fn worker_id(&self) -> Option<usize> {
        self.lane.as_ref().map(|lane| lane.id)
    }

    /// Return the slot to the pool
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").field("worker_id", &self.worker_id()).finish()
    }
}

/// Counters and the bounded wait queue shared by both strategies
#[derive(Debug)]
struct SlotPool {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    total_operations: AtomicU64,
    rejected_operations: AtomicU64,
    timeout_count: AtomicU64,
}

/// Holds a place in the wait queue until dropped
struct QueuePlace<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueuePlace<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SlotPool {
    fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            queued: AtomicUsize::new(0),
            total_operations: AtomicU64::new(0),
            rejected_operations: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            config,
        })
    }

    fn join_queue(&self) -> Option<QueuePlace<'_>> {
        let max_queue = self.config.max_queue;
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < max_queue).then_some(queued + 1)
            })
            .ok()
            .map(|_| QueuePlace { queued: &self.queued })
    }

    fn reject(&self) -> PolicyError {
        self.rejected_operations.fetch_add(1, Ordering::Relaxed);
        debug!(
            bulkhead = %self.config.name,
            max_concurrent = self.config.max_concurrent,
            max_queue = self.config.max_queue,
            "Bulkhead rejected operation"
        );
        PolicyError::Rejected(RejectReason::BulkheadFull)
    }

    async fn acquire_slot(
        &self,
        timeout: Option<Duration>,
    ) -> Result<OwnedSemaphorePermit, PolicyError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.total_operations.fetch_add(1, Ordering::Relaxed);
                return Ok(permit);
            }
            Err(TryAcquireError::Closed) => return Err(self.reject()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let Some(_place) = self.join_queue() else {
            return Err(self.reject());
        };

        let wait = Arc::clone(&self.semaphore).acquire_owned();
        let acquired = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    self.timeout_count.fetch_add(1, Ordering::Relaxed);
                    warn!(bulkhead = %self.config.name, ?timeout, "Bulkhead: timed out waiting for permit");
                    return Err(PolicyError::Timeout { timeout });
                }
            },
            None => wait.await,
        };

        match acquired {
            Ok(permit) => {
                self.total_operations.fetch_add(1, Ordering::Relaxed);
                Ok(permit)
            }
            // Semaphore closed (never closed by this crate)
            Err(_) => Err(self.reject()),
        }
    }

    fn current_concurrent(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            total_operations: self.total_operations.load(Ordering::Acquire),
            rejected_operations: self.rejected_operations.load(Ordering::Acquire),
            timeout_count: self.timeout_count.load(Ordering::Acquire),
            current_concurrent: self.current_concurrent(),
            current_queued: self.queued.load(Ordering::Acquire),
            max_concurrent: self.config.max_concurrent,
        }
    }
}

//==============================================================================
// Semaphore isolation
//==============================================================================

/// Bulkhead that limits concurrency with a counting semaphore
///
/// # Examples
///
/// ```rust
/// use bulwark_resilience::{Bulkhead, BulkheadConfig, SemaphoreBulkhead};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bulkhead = SemaphoreBulkhead::new(BulkheadConfig::new("payments", 5, 10))?;
///
/// let permit = bulkhead.acquire(None).await?;
/// // Your operation
/// permit.release();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SemaphoreBulkhead {
    pool: SlotPool,
}

impl SemaphoreBulkhead {
    /// Create a new bulkhead with the given configuration
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        Ok(Self { pool: SlotPool::new(config)? })
    }

    /// Try to acquire a permit without waiting
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        let slot = Arc::clone(&self.pool.semaphore).try_acquire_owned().ok()?;
        self.pool.total_operations.fetch_add(1, Ordering::Relaxed);
        Some(BulkheadPermit { lane: None, _slot: slot })
    }

    /// Get the current number of concurrent operations
    pub fn current_concurrent(&self) -> usize {
        self.pool.current_concurrent()
    }
}

#[async_trait]
impl Bulkhead for SemaphoreBulkhead {
    async fn acquire(&self, timeout: Option<Duration>) -> Result<BulkheadPermit, PolicyError> {
        let slot = self.pool.acquire_slot(timeout).await?;
        Ok(BulkheadPermit { lane: None, _slot: slot })
    }

    fn max_concurrency(&self) -> usize {
        self.pool.config.max_concurrent
    }

    fn metrics(&self) -> BulkheadMetrics {
        self.pool.metrics()
    }
}

//==============================================================================
// Worker-pool isolation
//==============================================================================

/// A worker lane held by a permit
struct WorkerLane {
    id: usize,
    idle: Arc<Mutex<Vec<usize>>>,
}

impl Drop for WorkerLane {
    fn drop(&mut self) {
        self.idle.lock().push(self.id);
    }
}

/// Bulkhead backed by a named pool of worker lanes
///
/// The pool size is the concurrency limit. Each permit is bound to one idle
/// lane; the lane returns to the idle set when the permit is dropped. Per-lane
/// call counts show how work spreads across the pool.
///
/// A lane is an id, not a thread. The holder of the permit runs the work in
/// its own task, exactly as with [`SemaphoreBulkhead`]; lanes only label and
/// account for the capacity in use.
///
/// # Examples
///
/// ```rust
/// use bulwark_resilience::{Bulkhead, BulkheadConfig, WorkerPoolBulkhead};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPoolBulkhead::new(BulkheadConfig::new("reports", 2, 0))?;
///
/// let caller = std::thread::current().id();
/// let permit = pool.acquire(None).await?;
/// assert_eq!(permit.worker_id(), Some(0));
/// assert_eq!(pool.idle_workers(), 1);
///
/// // The work runs right here, on the caller's thread.
/// let ran_on = std::thread::current().id();
/// assert_eq!(ran_on, caller);
///
/// permit.release();
/// assert_eq!(pool.idle_workers(), 2);
/// assert_eq!(pool.served_per_worker(), vec![1, 0]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WorkerPoolBulkhead {
    pool: SlotPool,
    idle: Arc<Mutex<Vec<usize>>>,
    served: Vec<AtomicU64>,
}

impl WorkerPoolBulkhead {
    /// Create a worker pool with `config.max_concurrent` lanes
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        let pool = SlotPool::new(config)?;
        let lanes = pool.config.max_concurrent;
        Ok(Self {
            // Reversed so lane 0 is handed out first
            idle: Arc::new(Mutex::new((0..lanes).rev().collect())),
            served: (0..lanes).map(|_| AtomicU64::new(0)).collect(),
            pool,
        })
    }

    /// Name of the isolated resource this pool serves
    pub fn name(&self) -> &str {
        &self.pool.config.name
    }

    /// Number of calls each lane has served, indexed by lane id
    pub fn served_per_worker(&self) -> Vec<u64> {
        self.served.iter().map(|count| count.load(Ordering::Acquire)).collect()
    }

    /// Number of lanes currently idle
    pub fn idle_workers(&self) -> usize {
        self.idle.lock().len()
    }
}

#[async_trait]
impl Bulkhead for WorkerPoolBulkhead {
    async fn acquire(&self, timeout: Option<Duration>) -> Result<BulkheadPermit, PolicyError> {
        let slot = self.pool.acquire_slot(timeout).await?;

        // Holding a slot guarantees at least one idle lane.
        let Some(id) = self.idle.lock().pop() else {
            warn!(pool = %self.pool.config.name, "Worker pool has a free slot but no idle lane");
            return Err(self.pool.reject());
        };
        self.served[id].fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.pool.config.name, worker = id, "Worker lane assigned");

        Ok(BulkheadPermit {
            lane: Some(WorkerLane { id, idle: Arc::clone(&self.idle) }),
            _slot: slot,
        })
    }

    fn max_concurrency(&self) -> usize {
        self.pool.config.max_concurrent
    }

    fn metrics(&self) -> BulkheadMetrics {
        self.pool.metrics()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn config(max_concurrent: usize, max_queue: usize) -> BulkheadConfig {
        BulkheadConfig::new("test", max_concurrent, max_queue)
    }

    #[tokio::test]
    async fn test_bulkhead_basic() {
        let bulkhead = SemaphoreBulkhead::new(config(2, 1)).unwrap();

        let permit = bulkhead.acquire(None).await.unwrap();
        assert_eq!(bulkhead.current_concurrent(), 1);

        permit.release();
        assert_eq!(bulkhead.current_concurrent(), 0);
        assert_eq!(bulkhead.metrics().total_operations, 1);
    }

    /// Validates immediate rejection once every slot and queue place is taken.
    ///
    /// Assertions:
    /// - Confirms the third acquire fails with `Rejected(BulkheadFull)` while
    ///   two permits are held and the queue size is zero.
    #[tokio::test]
    async fn test_bulkhead_rejects_when_queue_full() {
        let bulkhead = SemaphoreBulkhead::new(config(2, 0)).unwrap();

        let _first = bulkhead.acquire(None).await.unwrap();
        let _second = bulkhead.acquire(None).await.unwrap();

        let result = bulkhead.acquire(Some(Duration::from_secs(5))).await;
        assert_eq!(result.unwrap_err(), PolicyError::Rejected(RejectReason::BulkheadFull));

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.rejected_operations, 1);
        assert!(metrics.is_at_capacity());
    }

    #[tokio::test]
    async fn test_bulkhead_timeout_while_queued() {
        let bulkhead = SemaphoreBulkhead::new(config(1, 1)).unwrap();
        let _held = bulkhead.acquire(None).await.unwrap();

        let result = bulkhead.acquire(Some(Duration::from_millis(30))).await;
        assert_eq!(result.unwrap_err(), PolicyError::Timeout { timeout: Duration::from_millis(30) });

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.timeout_count, 1);
        assert_eq!(metrics.current_queued, 0, "timed-out waiter must leave the queue");
    }

    #[tokio::test]
    async fn test_queued_waiter_gets_released_slot() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(config(1, 1)).unwrap());
        let held = bulkhead.acquire(None).await.unwrap();

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.acquire(Some(Duration::from_secs(5))).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bulkhead.metrics().current_queued, 1);

        drop(held);
        assert!(waiter.await.unwrap());
        assert_eq!(bulkhead.metrics().current_queued, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(config(1, 1)).unwrap());
        let _held = bulkhead.acquire(None).await.unwrap();

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.acquire(None).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bulkhead.metrics().current_queued, 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(bulkhead.metrics().current_queued, 0);
    }

    #[tokio::test]
    async fn test_permit_released_on_panic() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(config(1, 0)).unwrap());

        let task = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                let _permit = bulkhead.acquire(None).await.unwrap();
                panic!("operation blew up");
            })
        };
        assert!(task.await.is_err());

        assert_eq!(bulkhead.current_concurrent(), 0);
        assert!(bulkhead.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_worker_pool_assigns_distinct_lanes() {
        let bulkhead = WorkerPoolBulkhead::new(config(3, 0)).unwrap();

        let a = bulkhead.acquire(None).await.unwrap();
        let b = bulkhead.acquire(None).await.unwrap();
        let c = bulkhead.acquire(None).await.unwrap();

        let mut ids = vec![a.worker_id().unwrap(), b.worker_id().unwrap(), c.worker_id().unwrap()];
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(bulkhead.idle_workers(), 0);
        assert_eq!(
            bulkhead.acquire(None).await.unwrap_err(),
            PolicyError::Rejected(RejectReason::BulkheadFull)
        );

        drop(b);
        assert_eq!(bulkhead.idle_workers(), 1);
        let d = bulkhead.acquire(None).await.unwrap();
        assert_eq!(d.worker_id(), Some(ids[1]));
        assert_eq!(bulkhead.served_per_worker().iter().sum::<u64>(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_never_shares_a_lane() {
        let bulkhead = Arc::new(WorkerPoolBulkhead::new(config(2, 64)).unwrap());
        let busy: Arc<Vec<AtomicUsize>> = Arc::new((0..2).map(|_| AtomicUsize::new(0)).collect());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let bulkhead = Arc::clone(&bulkhead);
                let busy = Arc::clone(&busy);
                tokio::spawn(async move {
                    let permit = bulkhead.acquire(None).await.unwrap();
                    let lane = permit.worker_id().unwrap();
                    assert_eq!(busy[lane].fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    busy[lane].fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(bulkhead.idle_workers(), 2);
        assert_eq!(bulkhead.metrics().total_operations, 32);
    }

    #[test]
    fn test_bulkhead_config_validation() {
        assert!(SemaphoreBulkhead::new(config(0, 1)).is_err());
        assert!(WorkerPoolBulkhead::new(config(0, 1)).is_err());
        assert!(SemaphoreBulkhead::new(config(1, 0)).is_ok());
    }

    #[test]
    fn test_bulkhead_metrics_methods() {
        let metrics = BulkheadMetrics {
            total_operations: 80,
            rejected_operations: 20,
            timeout_count: 5,
            current_concurrent: 5,
            current_queued: 0,
            max_concurrent: 10,
        };

        assert_eq!(metrics.utilization(), 0.5);
        assert_eq!(metrics.rejection_rate(), 0.2);
        assert!(!metrics.is_at_capacity());
    }
}
