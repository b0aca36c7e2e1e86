//! Error types for the circuit breaker subsystem

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::failsafe::BreakerState;

/// Result type alias for registry, configuration and server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors
///
/// These never come out of a protected call; see [`CallError`] for those.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (invalid value, unreadable file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Re-registration of a breaker with a different configuration
    #[error("Configuration conflict: breaker '{0}' is already registered with a different configuration")]
    ConfigConflict(String),

    /// Lookup of an unregistered breaker
    #[error("Unknown circuit breaker: {0}")]
    UnknownBreaker(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a [`CallError`], for branching without matching on messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The protected operation returned an error
    OperationFailure,
    /// The protected operation exceeded its deadline
    OperationTimeout,
    /// The breaker refused admission
    BreakerOpenRejection,
    /// Strict-mode lookup of an unregistered breaker
    UnknownBreaker,
    /// A fallback could not produce a degraded response
    Degraded,
}

/// Error returned from a guarded call
///
/// `E` is the protected operation's own error type. It is carried unchanged
/// so callers can recover the root cause with [`CallError::into_operation_error`].
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The operation failed; `error` is the untouched original
    #[error("{error}")]
    Failed {
        /// The operation's error
        error: E,
        /// Breaker guarding the call
        breaker: String,
        /// Breaker state when the failure was recorded
        state: BreakerState,
    },

    /// The operation did not finish within the call timeout
    #[error("Call through '{breaker}' timed out after {timeout:?}")]
    TimedOut {
        /// Breaker guarding the call
        breaker: String,
        /// Deadline that was exceeded
        timeout: Duration,
        /// Breaker state when the timeout was recorded
        state: BreakerState,
    },

    /// Admission denied without running the operation
    #[error("Circuit breaker '{breaker}' is {state}, call rejected")]
    Rejected {
        /// Breaker that rejected the call
        breaker: String,
        /// State at rejection
        state: BreakerState,
    },

    /// Strict registry has no breaker under this name
    #[error("Unknown circuit breaker: {0}")]
    UnknownBreaker(String),

    /// Fallback could not build a degraded response
    #[error("Fallback for '{breaker}' failed: {reason}")]
    Degraded {
        /// Breaker whose fallback failed
        breaker: String,
        /// What went wrong
        reason: String,
    },
}

impl<E> CallError<E> {
    /// Kind tag of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Failed { .. } => ErrorKind::OperationFailure,
            Self::TimedOut { .. } => ErrorKind::OperationTimeout,
            Self::Rejected { .. } => ErrorKind::BreakerOpenRejection,
            Self::UnknownBreaker(_) => ErrorKind::UnknownBreaker,
            Self::Degraded { .. } => ErrorKind::Degraded,
        }
    }

    /// Name of the breaker involved
    #[must_use]
    pub fn breaker(&self) -> &str {
        match self {
            Self::Failed { breaker, .. }
            | Self::TimedOut { breaker, .. }
            | Self::Rejected { breaker, .. }
            | Self::Degraded { breaker, .. } => breaker,
            Self::UnknownBreaker(name) => name,
        }
    }

    /// Breaker state attached to this error, if any
    #[must_use]
    pub fn state(&self) -> Option<BreakerState> {
        match self {
            Self::Failed { state, .. } | Self::TimedOut { state, .. } | Self::Rejected { state, .. } => {
                Some(*state)
            }
            Self::UnknownBreaker(_) | Self::Degraded { .. } => None,
        }
    }

    /// Whether this error counts as a dependency failure for the window
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut { .. })
    }

    /// The operation's original error, if this is an operation failure
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Borrow the operation's original error
    #[must_use]
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}
