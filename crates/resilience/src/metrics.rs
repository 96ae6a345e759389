//! Executor-level counters
//!
//! Counters are plain atomics updated by RAII guards, so every call is
//! recorded exactly once whichever way it leaves the pipeline, including a
//! caller dropping the future mid-flight.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::circuit_breaker::CircuitState;

/// Read-only snapshot of an executor's counters
///
/// `success_count + failure_count + rejected_count == total_calls` holds for
/// every snapshot. Timeouts are failures and are also counted in
/// `timeout_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorMetrics {
    /// Completed calls
    pub total_calls: u64,
    /// Calls that returned a value
    pub success_count: u64,
    /// Calls that failed after admission, timeouts included
    pub failure_count: u64,
    /// Calls turned away by the rate limiter, bulkhead or breaker
    pub rejected_count: u64,
    pub timeout_count: u64,
    pub current_state: CircuitState,
    /// Mean latency of calls that reached the operation
    pub average_latency: Duration,
    /// Highest number of calls executing at once
    pub peak_concurrency: usize,
    /// Calls executing right now
    pub in_flight: usize,
    /// Operation invocations, retries included
    pub total_attempts: u64,
}

impl ExecutorMetrics {
    /// Share of completed calls that succeeded (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_calls as f64
    }

    /// Share of completed calls that were rejected (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.rejected_count as f64 / self.total_calls as f64
    }

    /// Average invocations per call that reached the operation
    pub fn attempts_per_call(&self) -> f64 {
        let reached = self.success_count + self.failure_count;
        if reached == 0 {
            return 0.0;
        }
        self.total_attempts as f64 / reached as f64
    }
}

/// How a call left the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallOutcome {
    Success,
    Failure,
    Rejected,
    Timeout,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    success: AtomicU64,
    failure: AtomicU64,
    rejected: AtomicU64,
    timeout: AtomicU64,
    latency_nanos: AtomicU64,
    latency_samples: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    attempts: AtomicU64,
}

impl MetricsRecorder {
    /// Start recording one call; the record settles as a timeout if dropped
    /// unfinished
    pub(crate) fn begin(&self) -> CallRecord<'_> {
        CallRecord { recorder: self, reached_operation: None, finished: false }
    }

    /// Mark one more call as executing until the guard drops
    pub(crate) fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        InFlight { recorder: self }
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn settle(&self, outcome: CallOutcome, reached_operation: Option<Instant>) {
        let counter = match outcome {
            CallOutcome::Success => &self.success,
            CallOutcome::Failure => &self.failure,
            CallOutcome::Rejected => &self.rejected,
            CallOutcome::Timeout => {
                self.timeout.fetch_add(1, Ordering::Relaxed);
                &self.failure
            }
        };

        if let (Some(started), false) = (reached_operation, outcome == CallOutcome::Rejected) {
            let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.latency_nanos.fetch_add(nanos, Ordering::Relaxed);
            self.latency_samples.fetch_add(1, Ordering::Relaxed);
        }

        counter.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn snapshot(&self, current_state: CircuitState) -> ExecutorMetrics {
        let success_count = self.success.load(Ordering::Acquire);
        let failure_count = self.failure.load(Ordering::Acquire);
        let rejected_count = self.rejected.load(Ordering::Acquire);

        let samples = self.latency_samples.load(Ordering::Acquire);
        let average_latency = if samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.latency_nanos.load(Ordering::Acquire) / samples)
        };

        ExecutorMetrics {
            total_calls: success_count + failure_count + rejected_count,
            success_count,
            failure_count,
            rejected_count,
            timeout_count: self.timeout.load(Ordering::Acquire),
            current_state,
            average_latency,
            peak_concurrency: self.peak.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            total_attempts: self.attempts.load(Ordering::Acquire),
        }
    }
}

/// Pending record of a single call
pub(crate) struct CallRecord<'a> {
    recorder: &'a MetricsRecorder,
    reached_operation: Option<Instant>,
    finished: bool,
}

impl CallRecord<'_> {
    /// The call passed admission and is about to invoke the operation
    pub(crate) fn operation_started(&mut self) {
        self.reached_operation = Some(Instant::now());
    }

    pub(crate) fn finish(mut self, outcome: CallOutcome) {
        self.settle(outcome);
    }

    fn settle(&mut self, outcome: CallOutcome) {
        if !self.finished {
            self.finished = true;
            self.recorder.settle(outcome, self.reached_operation);
        }
    }
}

impl Drop for CallRecord<'_> {
    fn drop(&mut self) {
        self.settle(CallOutcome::Timeout);
    }
}

pub(crate) struct InFlight<'a> {
    recorder: &'a MetricsRecorder,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.recorder.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
