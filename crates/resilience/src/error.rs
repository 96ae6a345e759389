//! Failure taxonomy for resilience decisions
//!
//! Every expected outcome of the pipeline is a value, never a panic:
//!
//! | Variant | Raised by | Reaches the operation? |
//! |---------|-----------|------------------------|
//! | `Rejected` | rate limiter, bulkhead, open circuit | no |
//! | `Timeout` | any suspension point exceeding its bound | maybe |
//! | `Exhausted` | retry controller, budget consumed | yes |
//! | `Operation` | the wrapped operation, not retried | yes |
//!
//! Policy components do not know the operation's error type, so they return
//! the non-generic [`PolicyError`], which converts into [`Failure`].
//! Misconfiguration is reported once, at construction, as [`ConfigError`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a call was turned away before reaching the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The rate limiter had no permit available
    RateLimited,
    /// The bulkhead and its wait queue were full
    BulkheadFull,
    /// The circuit breaker is open (or its half-open trials are taken)
    CircuitOpen,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::RateLimited => write!(f, "rate limited"),
            RejectReason::BulkheadFull => write!(f, "bulkhead full"),
            RejectReason::CircuitOpen => write!(f, "circuit open"),
        }
    }
}

/// Admission failure returned by an individual policy component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The component refused the call
    #[error("call rejected: {0}")]
    Rejected(RejectReason),

    /// The component could not admit the call within its bound
    #[error("timed out after {timeout:?} waiting for admission")]
    Timeout { timeout: Duration },
}

/// Classified failure of a call made through the resilience pipeline
///
/// Generic over the wrapped operation's error type `E`, which is preserved as
/// the error source wherever the operation was actually invoked.
#[derive(Debug, Error)]
pub enum Failure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// A suspension point exceeded its bound
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Blocked by the rate limiter, the bulkhead or an open circuit
    #[error("call rejected: {0}")]
    Rejected(RejectReason),

    /// Every permitted attempt failed; carries the last cause
    #[error("retry budget exhausted after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The operation failed and was not retried
    #[error("operation failed")]
    Operation {
        #[source]
        source: E,
    },
}

impl<E> Failure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether the call may succeed later without any change on the caller's
    /// side (load shedding or a timeout rather than a business failure)
    pub fn is_transient(&self) -> bool {
        matches!(self, Failure::Timeout { .. } | Failure::Rejected(_))
    }

    /// Whether the call never reached the operation because a policy said no
    pub fn is_rejected(&self) -> bool {
        matches!(self, Failure::Rejected(_))
    }

    /// Whether the call ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Failure::Timeout { .. })
    }

    /// The rejection reason, if the call was rejected
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Failure::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }

    /// The underlying operation error, if the operation was invoked
    pub fn cause(&self) -> Option<&E> {
        match self {
            Failure::Exhausted { source, .. } | Failure::Operation { source } => Some(source),
            _ => None,
        }
    }

    /// Consume the failure and return the underlying operation error
    pub fn into_cause(self) -> Option<E> {
        match self {
            Failure::Exhausted { source, .. } | Failure::Operation { source } => Some(source),
            _ => None,
        }
    }
}

impl<E> From<PolicyError> for Failure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: PolicyError) -> Self {
        match error {
            PolicyError::Rejected(reason) => Failure::Rejected(reason),
            PolicyError::Timeout { timeout } => Failure::Timeout { timeout },
        }
    }
}

/// Configuration error reported at construction time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;
