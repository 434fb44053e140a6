//! The shared key-value store interface.
//!
//! The semaphore protocol never talks to a concrete store directly; it is
//! generic over the [`Store`] trait, which captures the minimum surface the
//! protocol needs from a Redis-class store:
//!
//! - string get/set/exists plus atomic increment/decrement on integer keys
//! - a mutual-exclusion lock with explicit acquire/release and an internal
//!   ownership check (release by a non-owner is refused, not escalated)
//! - a list supporting push-to-head, pop-from-tail, read-tail, and
//!   remove-all-matching
//! - publish/subscribe channels with no message persistence: a publish only
//!   reaches subscribers that were already attached
//!
//! The store's own persistence, replication, and availability guarantees are
//! out of scope here; when the store fails, operations surface a
//! [`StoreError`] and the semaphore call fails visibly.
//!
//! [`MemoryStore`](memory::MemoryStore) is the in-process reference
//! implementation used by the test suite; [`FaultStore`](fault::FaultStore)
//! wraps any store with deterministic fault injection for failure-path tests.

use std::error::Error as StdError;
use std::fmt;

use crate::cx::{CancelReason, Cx};

pub mod fault;
pub mod memory;

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The store is unreachable or failed server-side.
    Unavailable {
        /// What the store reported.
        message: String,
        /// Underlying error, when one exists.
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
    /// The store handle or subscription is closed.
    Closed,
    /// The operation was cancelled through the capability context.
    Cancelled(CancelReason),
    /// An integer operation hit a key holding a non-integer value.
    NotAnInteger {
        /// The offending key.
        key: String,
        /// The value found there.
        value: String,
    },
    /// A scripted fault from a [`fault::FaultStore`] wrapper.
    Injected {
        /// The operation that was armed to fail.
        op: fault::StoreOp,
    },
}

impl StoreError {
    /// Convenience constructor for an unavailable-store error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Convenience constructor for a cancelled operation.
    #[must_use]
    pub fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled(reason)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message, .. } => write!(f, "store unavailable: {message}"),
            Self::Closed => write!(f, "store connection closed"),
            Self::Cancelled(reason) => write!(f, "store operation cancelled: {reason}"),
            Self::NotAnInteger { key, value } => {
                write!(f, "key {key} holds non-integer value {value:?}")
            }
            Self::Injected { op } => write!(f, "injected fault on {op}"),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Unavailable {
                source: Some(source),
                ..
            } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published to.
    pub channel: String,
    /// Message payload.
    pub payload: String,
}

/// The shared key-value store the semaphore coordinates through.
///
/// All methods take a [`Cx`] and check it at entry (and at every suspension
/// point for blocking operations), surfacing cancellation as
/// [`StoreError::Cancelled`].
///
/// # Lock semantics
///
/// `lock_acquire` blocks until the lock at `key` is free and then claims it
/// for `owner`, admitting waiters in FIFO order. `lock_release` only
/// releases when `owner` matches the current holder and reports the outcome
/// through its return value; releasing a lock held by someone else is not an
/// error, it is a refused no-op.
///
/// # List semantics
///
/// Lists grow at the head and are consumed from the tail, so the tail is
/// always the oldest entry. An emptied list behaves like an absent key.
#[allow(async_fn_in_trait)] // generic-only use; callers never box these futures
pub trait Store: Send + Sync {
    /// The subscription handle produced by [`subscribe`](Store::subscribe).
    type Subscriber: Subscriber;

    /// Returns true if `key` holds a value.
    async fn exists(&self, cx: &Cx, key: &str) -> Result<bool, StoreError>;

    /// Reads the string value at `key`.
    async fn get(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes the string value at `key`, replacing any previous value.
    async fn set(&self, cx: &Cx, key: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically increments the integer at `key`, creating it at 1 if
    /// absent. Returns the new value.
    async fn incr(&self, cx: &Cx, key: &str) -> Result<i64, StoreError>;

    /// Atomically decrements the integer at `key`, creating it at -1 if
    /// absent. Returns the new value.
    async fn decr(&self, cx: &Cx, key: &str) -> Result<i64, StoreError>;

    /// Blocks until the lock at `key` is claimed for `owner`.
    async fn lock_acquire(&self, cx: &Cx, key: &str, owner: &str) -> Result<(), StoreError>;

    /// Releases the lock at `key` if `owner` holds it. Returns whether the
    /// lock was actually released.
    async fn lock_release(&self, cx: &Cx, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Returns true if the lock at `key` is currently held by `owner`.
    async fn lock_is_held_by(&self, cx: &Cx, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Pushes `value` onto the head of the list at `key`. Returns the new
    /// list length.
    async fn list_push_head(&self, cx: &Cx, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Removes and returns the tail (oldest) entry of the list at `key`.
    async fn list_pop_tail(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns the tail (oldest) entry of the list at `key` without
    /// removing it.
    async fn list_peek_tail(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError>;

    /// Removes every entry equal to `value` from the list at `key`.
    /// Returns how many entries were removed.
    async fn list_remove(&self, cx: &Cx, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Returns the length of the list at `key` (0 when absent).
    async fn list_len(&self, cx: &Cx, key: &str) -> Result<u64, StoreError>;

    /// Publishes `payload` to `channel`. Returns the number of subscribers
    /// the message was delivered to. Messages are not queued for future
    /// subscribers.
    async fn publish(&self, cx: &Cx, channel: &str, payload: &str) -> Result<usize, StoreError>;

    /// Attaches a new subscriber to `channel`.
    async fn subscribe(&self, cx: &Cx, channel: &str) -> Result<Self::Subscriber, StoreError>;
}

/// A live subscription to a pub/sub channel.
///
/// Dropping a subscriber detaches it from the channel; explicit
/// [`unsubscribe`](Subscriber::unsubscribe) does the same under caller
/// control and is idempotent.
#[allow(async_fn_in_trait)]
pub trait Subscriber: Send {
    /// Waits for the next message on the channel.
    ///
    /// Suspends until a message arrives; cancellation of the context
    /// surfaces as [`StoreError::Cancelled`], and a detached subscription
    /// surfaces as [`StoreError::Closed`].
    async fn next_message(&mut self, cx: &Cx) -> Result<Message, StoreError>;

    /// Detaches this subscriber from the channel.
    async fn unsubscribe(&mut self, cx: &Cx) -> Result<(), StoreError>;
}
