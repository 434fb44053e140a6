//! Fault-injecting store wrapper for failure-path tests.
//!
//! [`FaultStore`] delegates every operation to an inner [`Store`] while a
//! shared [`FaultPlan`] arms scripted failures: "fail the nth call to this
//! operation". Deterministic by construction: the same plan produces the
//! same failure sequence, which keeps cleanup-path tests reproducible.
//!
//! # Example
//!
//! ```ignore
//! let plan = FaultPlan::new();
//! plan.fail_nth(StoreOp::ListPeekTail, 2);
//! let store = FaultStore::new(MemoryStore::new(), plan.clone());
//! // The second list_peek_tail call on this wrapper now returns
//! // StoreError::Injected; everything else passes through.
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::cx::Cx;

use super::{Message, Store, StoreError, Subscriber};

/// One store operation, for fault matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `exists`
    Exists,
    /// `get`
    Get,
    /// `set`
    Set,
    /// `incr`
    Incr,
    /// `decr`
    Decr,
    /// `lock_acquire`
    LockAcquire,
    /// `lock_release`
    LockRelease,
    /// `lock_is_held_by`
    LockIsHeldBy,
    /// `list_push_head`
    ListPushHead,
    /// `list_pop_tail`
    ListPopTail,
    /// `list_peek_tail`
    ListPeekTail,
    /// `list_remove`
    ListRemove,
    /// `list_len`
    ListLen,
    /// `publish`
    Publish,
    /// `subscribe`
    Subscribe,
    /// `Subscriber::next_message`
    NextMessage,
    /// `Subscriber::unsubscribe`
    Unsubscribe,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Exists => "exists",
            Self::Get => "get",
            Self::Set => "set",
            Self::Incr => "incr",
            Self::Decr => "decr",
            Self::LockAcquire => "lock_acquire",
            Self::LockRelease => "lock_release",
            Self::LockIsHeldBy => "lock_is_held_by",
            Self::ListPushHead => "list_push_head",
            Self::ListPopTail => "list_pop_tail",
            Self::ListPeekTail => "list_peek_tail",
            Self::ListRemove => "list_remove",
            Self::ListLen => "list_len",
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::NextMessage => "next_message",
            Self::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct FaultRule {
    op: StoreOp,
    countdown: u32,
}

/// Shared, clonable schedule of scripted store failures.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    rules: Arc<Mutex<Vec<FaultRule>>>,
}

impl FaultPlan {
    /// Creates an empty plan (no faults armed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the nth (1-based) call of `op` to fail with
    /// [`StoreError::Injected`]. Each armed rule fires once.
    ///
    /// # Panics
    ///
    /// Panics if `nth` is 0.
    pub fn fail_nth(&self, op: StoreOp, nth: u32) {
        assert!(nth > 0, "fault ordinal is 1-based");
        self.rules.lock().push(FaultRule { op, countdown: nth });
    }

    /// Arms the next call of `op` to fail.
    pub fn fail_next(&self, op: StoreOp) {
        self.fail_nth(op, 1);
    }

    /// Returns how many rules are still armed.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.rules.lock().len()
    }

    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut rules = self.rules.lock();
        let mut fired = None;
        for (index, rule) in rules.iter_mut().enumerate() {
            if rule.op != op {
                continue;
            }
            rule.countdown = rule.countdown.saturating_sub(1);
            if rule.countdown == 0 && fired.is_none() {
                fired = Some(index);
            }
        }
        if let Some(index) = fired {
            rules.remove(index);
            tracing::debug!(op = %op, "firing injected store fault");
            return Err(StoreError::Injected { op });
        }
        Ok(())
    }
}

/// A [`Store`] wrapper that fails according to a [`FaultPlan`].
#[derive(Debug, Clone)]
pub struct FaultStore<S> {
    inner: S,
    plan: FaultPlan,
}

impl<S> FaultStore<S> {
    /// Wraps `inner` with the given plan.
    pub fn new(inner: S, plan: FaultPlan) -> Self {
        Self { inner, plan }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Store> Store for FaultStore<S> {
    type Subscriber = FaultSubscriber<S::Subscriber>;

    async fn exists(&self, cx: &Cx, key: &str) -> Result<bool, StoreError> {
        self.plan.check(StoreOp::Exists)?;
        self.inner.exists(cx, key).await
    }

    async fn get(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError> {
        self.plan.check(StoreOp::Get)?;
        self.inner.get(cx, key).await
    }

    async fn set(&self, cx: &Cx, key: &str, value: &str) -> Result<(), StoreError> {
        self.plan.check(StoreOp::Set)?;
        self.inner.set(cx, key, value).await
    }

    async fn incr(&self, cx: &Cx, key: &str) -> Result<i64, StoreError> {
        self.plan.check(StoreOp::Incr)?;
        self.inner.incr(cx, key).await
    }

    async fn decr(&self, cx: &Cx, key: &str) -> Result<i64, StoreError> {
        self.plan.check(StoreOp::Decr)?;
        self.inner.decr(cx, key).await
    }

    async fn lock_acquire(&self, cx: &Cx, key: &str, owner: &str) -> Result<(), StoreError> {
        self.plan.check(StoreOp::LockAcquire)?;
        self.inner.lock_acquire(cx, key, owner).await
    }

    async fn lock_release(&self, cx: &Cx, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.plan.check(StoreOp::LockRelease)?;
        self.inner.lock_release(cx, key, owner).await
    }

    async fn lock_is_held_by(&self, cx: &Cx, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.plan.check(StoreOp::LockIsHeldBy)?;
        self.inner.lock_is_held_by(cx, key, owner).await
    }

    async fn list_push_head(&self, cx: &Cx, key: &str, value: &str) -> Result<u64, StoreError> {
        self.plan.check(StoreOp::ListPushHead)?;
        self.inner.list_push_head(cx, key, value).await
    }

    async fn list_pop_tail(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError> {
        self.plan.check(StoreOp::ListPopTail)?;
        self.inner.list_pop_tail(cx, key).await
    }

    async fn list_peek_tail(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError> {
        self.plan.check(StoreOp::ListPeekTail)?;
        self.inner.list_peek_tail(cx, key).await
    }

    async fn list_remove(&self, cx: &Cx, key: &str, value: &str) -> Result<u64, StoreError> {
        self.plan.check(StoreOp::ListRemove)?;
        self.inner.list_remove(cx, key, value).await
    }

    async fn list_len(&self, cx: &Cx, key: &str) -> Result<u64, StoreError> {
        self.plan.check(StoreOp::ListLen)?;
        self.inner.list_len(cx, key).await
    }

    async fn publish(&self, cx: &Cx, channel: &str, payload: &str) -> Result<usize, StoreError> {
        self.plan.check(StoreOp::Publish)?;
        self.inner.publish(cx, channel, payload).await
    }

    async fn subscribe(&self, cx: &Cx, channel: &str) -> Result<Self::Subscriber, StoreError> {
        self.plan.check(StoreOp::Subscribe)?;
        let inner = self.inner.subscribe(cx, channel).await?;
        Ok(FaultSubscriber {
            inner,
            plan: self.plan.clone(),
        })
    }
}

/// Subscription handle produced by [`FaultStore`].
#[derive(Debug)]
pub struct FaultSubscriber<Sub> {
    inner: Sub,
    plan: FaultPlan,
}

impl<Sub: Subscriber> Subscriber for FaultSubscriber<Sub> {
    async fn next_message(&mut self, cx: &Cx) -> Result<Message, StoreError> {
        self.plan.check(StoreOp::NextMessage)?;
        self.inner.next_message(cx).await
    }

    async fn unsubscribe(&mut self, cx: &Cx) -> Result<(), StoreError> {
        self.plan.check(StoreOp::Unsubscribe)?;
        self.inner.unsubscribe(cx).await
    }
}
