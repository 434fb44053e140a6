//! Error types and error handling strategy.
//!
//! Errors are explicit and typed, with the underlying store error chained as
//! a source so operators can diagnose store-side root causes. The semaphore
//! never retries internally beyond what the store client itself performs;
//! every failure surfaces to the caller after cleanup has run (waiter-list
//! removal, unsubscribe, lock release), so a failed call leaves no queue
//! entries or locks behind.
//!
//! [`Recoverability`] classifies errors for callers that retry: a store
//! outage is worth retrying, a cancellation is not.

use std::error::Error as StdError;
use std::fmt;

use crate::cx::CancelReason;
use crate::store::StoreError;

/// How a failed operation should be treated by retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure, safe to retry.
    Transient,
    /// Unrecoverable, do not retry.
    Permanent,
    /// Recoverability depends on context.
    Unknown,
}

/// Error returned by semaphore operations.
#[derive(Debug)]
pub enum SemaphoreError {
    /// A store operation failed; the store-side cause is chained.
    Store(StoreError),
    /// The operation was cancelled through the capability context.
    Cancelled(CancelReason),
    /// This caller's waiter-list entry disappeared while it was still
    /// listening for admission (for example through store-side expiry).
    /// The wait cannot complete; no slot was granted.
    OrphanedWaiter {
        /// The waiter-list key that no longer contains this caller.
        key: String,
    },
    /// The counter key holds a value that does not parse as an integer.
    CorruptCounter {
        /// The counter key.
        key: String,
        /// The value found there.
        value: String,
    },
}

impl SemaphoreError {
    /// Classifies this error for retry logic.
    #[must_use]
    pub fn recoverability(&self) -> Recoverability {
        match self {
            Self::Store(StoreError::Unavailable { .. } | StoreError::Closed) => {
                Recoverability::Transient
            }
            Self::Store(_) | Self::CorruptCounter { .. } => Recoverability::Permanent,
            Self::Cancelled(_) => Recoverability::Permanent,
            Self::OrphanedWaiter { .. } => Recoverability::Unknown,
        }
    }

    /// Returns true if this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl fmt::Display for SemaphoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "semaphore store operation failed: {e}"),
            Self::Cancelled(reason) => write!(f, "semaphore operation cancelled: {reason}"),
            Self::OrphanedWaiter { key } => {
                write!(f, "waiter entry vanished from {key} before admission")
            }
            Self::CorruptCounter { key, value } => {
                write!(f, "semaphore counter {key} holds non-integer value {value:?}")
            }
        }
    }
}

impl StdError for SemaphoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SemaphoreError {
    fn from(err: StoreError) -> Self {
        // A cancellation observed inside a store call is still a
        // cancellation of the semaphore operation.
        match err {
            StoreError::Cancelled(reason) => Self::Cancelled(reason),
            other => Self::Store(other),
        }
    }
}
