//! The distributed semaphore protocol.
//!
//! A [`DistributedSemaphore`] lets up to `capacity` concurrent holders,
//! spread across tasks, processes, or machines, hold a slot at once,
//! coordinated entirely through a shared [`Store`]. The semaphore object
//! itself is stateless apart from configuration; all shared state lives in
//! the store under the four [`SemaphoreKeys`].
//!
//! # Protocol
//!
//! Acquisition runs in two phases:
//!
//! - **Fast path**: under the store's critical-section lock, grant
//!   immediately when a slot is free *and* no earlier waiter is queued.
//!   Requiring an empty waiter list keeps late arrivals from jumping past
//!   callers that queued before them.
//! - **Queued path**: append this caller's identity to the waiter list,
//!   subscribe to the notification channel *before* the lock drops (a
//!   release landing between unlock and subscribe would otherwise be lost),
//!   then listen. Every release notification makes every waiter re-read the
//!   list tail; only the oldest waiter re-enters the critical section to
//!   claim the freed slot. The broadcast-and-recheck fan-out is O(waiters)
//!   per release and accepted for its simplicity.
//!
//! Release increments the counter, never above capacity (double-release is
//! a no-op), and publishes a notification.
//!
//! # Failure and cancellation
//!
//! Any failure after the caller enrolled in the waiter list drives cleanup
//! before the error surfaces: every occurrence of the caller's identity is
//! removed from the list, the subscription is detached, and a decrement
//! that would otherwise leak a slot is restored. Cleanup runs under a
//! cancellation mask so a cancelled context cannot veto it: an abandoned
//! entry left at the tail would stall every later waiter.
//!
//! The critical-section lock is released on every path out of a critical
//! section, with the ownership check internal to the store: releasing a
//! lock this caller does not hold is refused by the store and skipped here,
//! never escalated.

use tracing::{debug, trace, warn};

use crate::config::{ConfigError, SemaphoreConfig, SemaphoreKeys};
use crate::cx::Cx;
use crate::error::SemaphoreError;
use crate::store::{Store, StoreError, Subscriber};

/// Outcome of the first critical section of an acquisition.
enum Admission<Sub> {
    /// A slot was claimed immediately.
    Granted,
    /// No slot free; the caller is enrolled and subscribed.
    Enqueued(Sub),
}

/// A counting semaphore whose state lives in a shared key-value store.
///
/// Cheap to construct; cooperating callers each build their own instance
/// with the same `(namespace, task_name)` and a unique identity.
///
/// # Example
///
/// ```ignore
/// use distsem::{Cx, DistributedSemaphore, SemaphoreConfig};
///
/// let semaphore = DistributedSemaphore::new(
///     store,
///     SemaphoreConfig::new("thumbnail-job", "worker-17").with_capacity(4),
/// )?;
///
/// let cx = Cx::new();
/// semaphore.acquire(&cx).await?;
/// // ... up to 4 workers run here concurrently ...
/// semaphore.release(&cx).await?;
/// ```
#[derive(Debug)]
pub struct DistributedSemaphore<S: Store> {
    store: S,
    config: SemaphoreConfig,
    keys: SemaphoreKeys,
}

impl<S: Store> DistributedSemaphore<S> {
    /// Creates a semaphore handle over `store` with the given configuration.
    pub fn new(store: S, config: SemaphoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let keys = SemaphoreKeys::derive(&config.namespace, &config.task_name);
        Ok(Self {
            store,
            config,
            keys,
        })
    }

    /// The store keys this semaphore coordinates through.
    #[must_use]
    pub fn keys(&self) -> &SemaphoreKeys {
        &self.keys
    }

    /// This caller's identity token.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// The configured capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    /// The underlying store handle.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Acquires one slot, suspending while none is available.
    ///
    /// Returns only once this caller holds a slot. Admission is FIFO: when
    /// the semaphore is exhausted the caller queues behind earlier waiters
    /// and is woken by release notifications.
    ///
    /// # Errors
    ///
    /// Fails visibly on store errors, on cancellation of `cx`, and on the
    /// orphaned-waiter anomaly (this caller's queue entry vanished before
    /// admission). On every failure path the caller's queue entry and
    /// subscription are cleaned up before the error is returned.
    pub async fn acquire(&self, cx: &Cx) -> Result<(), SemaphoreError> {
        cx.checkpoint().map_err(SemaphoreError::Cancelled)?;
        debug!(key = %self.keys.counter, identity = %self.config.identity, "acquiring slot");

        let mut enrolled = false;
        let mut decremented = false;
        let admission = self
            .with_lock(cx, async || {
                if !self.store.exists(cx, &self.keys.counter).await? {
                    self.store
                        .set(cx, &self.keys.counter, &self.config.capacity.to_string())
                        .await?;
                }
                let free = self.read_counter(cx).await?;
                let queue_empty = self
                    .store
                    .list_peek_tail(cx, &self.keys.waiters)
                    .await?
                    .is_none();
                if free > 0 && queue_empty {
                    self.store.decr(cx, &self.keys.counter).await?;
                    decremented = true;
                    return Ok(Admission::Granted);
                }
                self.store
                    .list_push_head(cx, &self.keys.waiters, &self.config.identity)
                    .await?;
                enrolled = true;
                // Subscribe while still holding the lock; a release landing
                // between unlock and subscribe would otherwise be lost.
                let subscription = self.store.subscribe(cx, &self.keys.channel).await?;
                Ok(Admission::Enqueued(subscription))
            })
            .await;

        let mut subscription = match admission {
            Ok(Admission::Granted) => {
                debug!(key = %self.keys.counter, identity = %self.config.identity, "slot acquired");
                return Ok(());
            }
            Ok(Admission::Enqueued(subscription)) => subscription,
            Err(e) => {
                if decremented {
                    self.restore_slot(cx).await;
                }
                if enrolled {
                    self.abandon_wait(cx, None).await;
                }
                return Err(e);
            }
        };

        debug!(key = %self.keys.counter, identity = %self.config.identity, "no free slot, queued");

        match self
            .wait_for_admission(cx, &mut subscription, &mut decremented)
            .await
        {
            Ok(()) => {
                debug!(key = %self.keys.counter, identity = %self.config.identity, "slot acquired after wait");
                Ok(())
            }
            Err(e) => {
                if decremented {
                    self.restore_slot(cx).await;
                }
                self.abandon_wait(cx, Some(&mut subscription)).await;
                Err(e)
            }
        }
    }

    /// Releases one slot and wakes the waiters.
    ///
    /// Increments the counter by one, never above capacity: an unmatched or
    /// doubled release is a logged no-op. When a slot actually frees, a
    /// notification carrying this caller's identity is published; the
    /// payload is informational only, waiters re-check the list rather than
    /// trusting it.
    ///
    /// # Errors
    ///
    /// Fails visibly on store errors and on cancellation of `cx`.
    pub async fn release(&self, cx: &Cx) -> Result<(), SemaphoreError> {
        cx.checkpoint().map_err(SemaphoreError::Cancelled)?;
        self.with_lock(cx, async || {
            if !self.store.exists(cx, &self.keys.counter).await? {
                self.store
                    .set(cx, &self.keys.counter, &self.config.capacity.to_string())
                    .await?;
            }
            let current = self.read_counter(cx).await?;
            if current >= i64::from(self.config.capacity) {
                debug!(key = %self.keys.counter, current, "release at capacity; skipping increment");
                return Ok(());
            }
            let value = self.store.incr(cx, &self.keys.counter).await?;
            let receivers = self
                .store
                .publish(cx, &self.keys.channel, &self.config.identity)
                .await?;
            debug!(key = %self.keys.counter, value, receivers, "slot released");
            Ok(())
        })
        .await
    }

    /// Runs `work` while holding a slot: acquire on entry, release on every
    /// completion path.
    ///
    /// The release runs whether `work` succeeds or fails, and under a
    /// cancellation mask so a context cancelled during `work` still gives
    /// the slot back. A `work` error is primary; a release failure after
    /// successful work becomes the returned error.
    ///
    /// Dropping the returned future mid-`work` skips the release; that is
    /// the tradeoff of a plain async scope. Drive it to completion (the
    /// cancelled context makes that prompt) to keep the guarantee.
    pub async fn with_acquired<T, F>(&self, cx: &Cx, work: F) -> Result<T, SemaphoreError>
    where
        F: AsyncFnOnce(&Cx) -> Result<T, SemaphoreError>,
    {
        self.acquire(cx).await?;
        let result = work(cx).await;
        let released = {
            let _mask = cx.mask();
            self.release(cx).await
        };
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(error = %release_err, "release failed while propagating work error");
                Err(e)
            }
        }
    }

    /// Listens for release notifications until this caller is admitted.
    ///
    /// Sets `*decremented` the moment the counter is taken so the caller
    /// can restore the slot if a later step fails.
    async fn wait_for_admission(
        &self,
        cx: &Cx,
        subscription: &mut S::Subscriber,
        decremented: &mut bool,
    ) -> Result<(), SemaphoreError> {
        loop {
            let message = subscription.next_message(cx).await?;
            trace!(payload = %message.payload, "release notification received");

            let Some(tail) = self.store.list_peek_tail(cx, &self.keys.waiters).await? else {
                // Our own entry is gone without admission. Surface it;
                // callers decide whether to re-enroll.
                return Err(SemaphoreError::OrphanedWaiter {
                    key: self.keys.waiters.clone(),
                });
            };
            if tail != self.config.identity {
                trace!(tail = %tail, "notification admits another waiter");
                continue;
            }

            // We are the oldest waiter: claim under the lock.
            return self
                .with_lock(cx, async || {
                    match self.store.list_pop_tail(cx, &self.keys.waiters).await? {
                        Some(entry) if entry == self.config.identity => {}
                        Some(entry) => {
                            // The tail changed between the unlocked peek and
                            // this critical section. Identities are unique,
                            // so an entry was lost or added externally.
                            warn!(entry = %entry, "popped unexpected waiter entry during admission");
                        }
                        None => {
                            return Err(SemaphoreError::OrphanedWaiter {
                                key: self.keys.waiters.clone(),
                            });
                        }
                    }
                    self.store.decr(cx, &self.keys.counter).await?;
                    *decremented = true;
                    if let Err(e) = subscription.unsubscribe(cx).await {
                        // The slot is already claimed; failing the acquire
                        // now would leak it. The subscription also detaches
                        // on drop.
                        warn!(error = %e, "failed to unsubscribe after admission");
                    }
                    Ok(())
                })
                .await;
        }
    }

    /// Runs `critical` while holding the store's critical-section lock.
    ///
    /// The unlock runs on every path out, masked against cancellation; the
    /// ownership check lives in the store's `lock_release`. An unlock
    /// failure after a successful critical section is surfaced, one after a
    /// failed section is logged so the primary error stays visible.
    async fn with_lock<T, F>(&self, cx: &Cx, critical: F) -> Result<T, SemaphoreError>
    where
        F: AsyncFnOnce() -> Result<T, SemaphoreError>,
    {
        self.store
            .lock_acquire(cx, &self.keys.lock, &self.config.identity)
            .await?;
        let result = critical().await;
        let unlocked = self.unlock(cx).await;
        match (result, unlocked) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock_err)) => {
                warn!(error = %unlock_err, "lock release failed while propagating earlier error");
                Err(e)
            }
        }
    }

    async fn unlock(&self, cx: &Cx) -> Result<(), StoreError> {
        // A leaked lock stalls every cooperating caller, so the release
        // must run even on a cancelled context.
        let _mask = cx.mask();
        match self
            .store
            .lock_release(cx, &self.keys.lock, &self.config.identity)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(key = %self.keys.lock, "lock not held at release; skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Gives back a slot taken by an admission that later failed.
    async fn restore_slot(&self, cx: &Cx) {
        let _mask = cx.mask();
        match self.store.incr(cx, &self.keys.counter).await {
            Ok(value) => {
                debug!(key = %self.keys.counter, value, "restored slot after failed admission");
            }
            Err(e) => {
                warn!(key = %self.keys.counter, error = %e, "failed to restore slot; one slot may be leaked");
            }
        }
    }

    /// Best-effort cleanup after an abandoned wait: removes every
    /// occurrence of this caller's identity (self-healing a duplicate from
    /// a retried append) and detaches the subscription.
    async fn abandon_wait(&self, cx: &Cx, subscription: Option<&mut S::Subscriber>) {
        let _mask = cx.mask();
        match self
            .store
            .list_remove(cx, &self.keys.waiters, &self.config.identity)
            .await
        {
            Ok(0) => {}
            Ok(removed) => {
                debug!(key = %self.keys.waiters, removed, "removed waiter entries during cleanup");
            }
            Err(e) => {
                warn!(key = %self.keys.waiters, error = %e, "failed to remove waiter entry during cleanup");
            }
        }
        if let Some(subscription) = subscription {
            if let Err(e) = subscription.unsubscribe(cx).await {
                warn!(error = %e, "failed to unsubscribe during cleanup");
            }
        }
    }

    async fn read_counter(&self, cx: &Cx) -> Result<i64, SemaphoreError> {
        match self.store.get(cx, &self.keys.counter).await? {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| SemaphoreError::CorruptCounter {
                    key: self.keys.counter.clone(),
                    value: raw,
                }),
        }
    }
}
