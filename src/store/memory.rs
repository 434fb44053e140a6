//! In-process reference store.
//!
//! [`MemoryStore`] implements the full [`Store`] surface against process-local
//! state. It exists so the semaphore protocol can be exercised
//! deterministically: the test suite runs many concurrent acquirers against
//! one shared `MemoryStore` the same way production callers would share a
//! Redis-class deployment.
//!
//! Blocking operations (`lock_acquire`, `next_message`) are hand-rolled
//! futures that register wakers with the store and re-check cancellation on
//! every poll, so they behave correctly both under a real executor and under
//! the busy-polling drivers the tests use.
//!
//! Locks are non-reentrant: a second `lock_acquire` for an owner that
//! already holds the lock waits like any other contender.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use crate::cx::Cx;

use super::{Message, Store, StoreError, Subscriber};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<String>,
    waiters: VecDeque<LockWaiter>,
    next_waiter_id: u64,
}

#[derive(Debug)]
struct LockWaiter {
    id: u64,
    waker: Waker,
}

#[derive(Debug, Default)]
struct SubscriberSlot {
    queue: VecDeque<Message>,
    waker: Option<Waker>,
}

#[derive(Debug, Default)]
struct ChannelState {
    subscribers: HashMap<u64, SubscriberSlot>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    strings: Mutex<HashMap<String, String>>,
    locks: Mutex<HashMap<String, LockState>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    channels: Mutex<HashMap<String, ChannelState>>,
    next_subscriber_id: AtomicU64,
}

/// An in-process store backed by shared maps.
///
/// Cloning is cheap and every clone addresses the same underlying state, so
/// one `MemoryStore` can be handed to any number of cooperating callers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live subscribers on `channel`.
    ///
    /// Diagnostic accessor for tests and debugging.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map_or(0, |state| state.subscribers.len())
    }

    /// Returns the current owner of the lock at `key`, if held.
    ///
    /// Diagnostic accessor for tests and debugging.
    #[must_use]
    pub fn lock_owner(&self, key: &str) -> Option<String> {
        self.inner
            .locks
            .lock()
            .get(key)
            .and_then(|state| state.owner.clone())
    }

    fn apply_delta(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut strings = self.inner.strings.lock();
        let current = match strings.get(key) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
                value: raw.clone(),
            })?,
        };
        let next = current.saturating_add(delta);
        strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

impl Store for MemoryStore {
    type Subscriber = MemorySubscriber;

    async fn exists(&self, cx: &Cx, key: &str) -> Result<bool, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        Ok(self.inner.strings.lock().contains_key(key))
    }

    async fn get(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        Ok(self.inner.strings.lock().get(key).cloned())
    }

    async fn set(&self, cx: &Cx, key: &str, value: &str) -> Result<(), StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        self.inner
            .strings
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, cx: &Cx, key: &str) -> Result<i64, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        self.apply_delta(key, 1)
    }

    async fn decr(&self, cx: &Cx, key: &str) -> Result<i64, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        self.apply_delta(key, -1)
    }

    async fn lock_acquire(&self, cx: &Cx, key: &str, owner: &str) -> Result<(), StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        LockAcquire {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            owner: owner.to_string(),
            cx: cx.clone(),
            waiter_id: None,
        }
        .await
    }

    async fn lock_release(&self, cx: &Cx, key: &str, owner: &str) -> Result<bool, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        let mut locks = self.inner.locks.lock();
        let Some(state) = locks.get_mut(key) else {
            return Ok(false);
        };
        if state.owner.as_deref() != Some(owner) {
            return Ok(false);
        }
        state.owner = None;
        let next = state.waiters.front().map(|w| w.waker.clone());
        if next.is_none() {
            locks.remove(key);
        }
        drop(locks);
        if let Some(waker) = next {
            waker.wake();
        }
        Ok(true)
    }

    async fn lock_is_held_by(&self, cx: &Cx, key: &str, owner: &str) -> Result<bool, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        Ok(self
            .inner
            .locks
            .lock()
            .get(key)
            .is_some_and(|state| state.owner.as_deref() == Some(owner)))
    }

    async fn list_push_head(&self, cx: &Cx, key: &str, value: &str) -> Result<u64, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        let mut lists = self.inner.lists.lock();
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn list_pop_tail(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        let mut lists = self.inner.lists.lock();
        let Some(list) = lists.get_mut(key) else {
            return Ok(None);
        };
        let popped = list.pop_back();
        let drained = list.is_empty();
        if drained {
            lists.remove(key);
        }
        Ok(popped)
    }

    async fn list_peek_tail(&self, cx: &Cx, key: &str) -> Result<Option<String>, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        Ok(self
            .inner
            .lists
            .lock()
            .get(key)
            .and_then(|list| list.back().cloned()))
    }

    async fn list_remove(&self, cx: &Cx, key: &str, value: &str) -> Result<u64, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        let mut lists = self.inner.lists.lock();
        let Some(list) = lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|entry| entry != value);
        let removed = (before - list.len()) as u64;
        let drained = list.is_empty();
        if drained {
            lists.remove(key);
        }
        Ok(removed)
    }

    async fn list_len(&self, cx: &Cx, key: &str) -> Result<u64, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        Ok(self
            .inner
            .lists
            .lock()
            .get(key)
            .map_or(0, |list| list.len() as u64))
    }

    async fn publish(&self, cx: &Cx, channel: &str, payload: &str) -> Result<usize, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        let (count, wakers) = {
            let mut channels = self.inner.channels.lock();
            match channels.get_mut(channel) {
                None => (0, Vec::new()),
                Some(state) => {
                    let mut wakers = Vec::with_capacity(state.subscribers.len());
                    for slot in state.subscribers.values_mut() {
                        slot.queue.push_back(Message {
                            channel: channel.to_string(),
                            payload: payload.to_string(),
                        });
                        if let Some(waker) = slot.waker.take() {
                            wakers.push(waker);
                        }
                    }
                    (state.subscribers.len(), wakers)
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(count)
    }

    async fn subscribe(&self, cx: &Cx, channel: &str) -> Result<Self::Subscriber, StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .subscribers
            .insert(id, SubscriberSlot::default());
        Ok(MemorySubscriber {
            inner: Arc::clone(&self.inner),
            channel: channel.to_string(),
            id,
            attached: true,
        })
    }
}

/// Future waiting for a store lock, FIFO among contenders.
struct LockAcquire {
    inner: Arc<MemoryInner>,
    key: String,
    owner: String,
    cx: Cx,
    waiter_id: Option<u64>,
}

impl LockAcquire {
    /// Leaves the waiter queue. Wakes the new front waiter if the lock is
    /// free, so the handoff signal is not lost.
    fn detach_waiter(&mut self) {
        let Some(id) = self.waiter_id.take() else {
            return;
        };
        let next = {
            let mut locks = self.inner.locks.lock();
            let Some(state) = locks.get_mut(&self.key) else {
                return;
            };
            if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                state.waiters.remove(pos);
            }
            if state.owner.is_none() {
                state.waiters.front().map(|w| w.waker.clone())
            } else {
                None
            }
        };
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

impl Future for LockAcquire {
    type Output = Result<(), StoreError>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Err(reason) = this.cx.checkpoint() {
            this.detach_waiter();
            return Poll::Ready(Err(StoreError::Cancelled(reason)));
        }

        let mut locks = this.inner.locks.lock();
        let state = locks.entry(this.key.clone()).or_default();

        let waiter_id = match this.waiter_id {
            Some(id) => id,
            None => {
                let id = state.next_waiter_id;
                state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
                this.waiter_id = Some(id);
                id
            }
        };

        // FIFO handoff: only the front waiter (or a fresh arrival with an
        // empty queue) may claim a free lock.
        let at_front = state.waiters.front().is_none_or(|w| w.id == waiter_id);
        if state.owner.is_none() && at_front {
            state.owner = Some(this.owner.clone());
            if state.waiters.front().is_some_and(|w| w.id == waiter_id) {
                state.waiters.pop_front();
            }
            drop(locks);
            this.waiter_id = None;
            return Poll::Ready(Ok(()));
        }

        if let Some(existing) = state.waiters.iter_mut().find(|w| w.id == waiter_id) {
            if !existing.waker.will_wake(task_cx.waker()) {
                existing.waker.clone_from(task_cx.waker());
            }
        } else {
            state.waiters.push_back(LockWaiter {
                id: waiter_id,
                waker: task_cx.waker().clone(),
            });
        }
        Poll::Pending
    }
}

impl Drop for LockAcquire {
    fn drop(&mut self) {
        if self.waiter_id.is_some() {
            self.detach_waiter();
        }
    }
}

/// Subscription handle for [`MemoryStore`] channels.
#[derive(Debug)]
pub struct MemorySubscriber {
    inner: Arc<MemoryInner>,
    channel: String,
    id: u64,
    attached: bool,
}

impl MemorySubscriber {
    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        let mut channels = self.inner.channels.lock();
        let mut drained = false;
        if let Some(state) = channels.get_mut(&self.channel) {
            state.subscribers.remove(&self.id);
            drained = state.subscribers.is_empty();
        }
        if drained {
            channels.remove(&self.channel);
        }
    }
}

impl Subscriber for MemorySubscriber {
    async fn next_message(&mut self, cx: &Cx) -> Result<Message, StoreError> {
        if !self.attached {
            return Err(StoreError::Closed);
        }
        NextMessage {
            inner: Arc::clone(&self.inner),
            channel: self.channel.clone(),
            id: self.id,
            cx: cx.clone(),
        }
        .await
    }

    async fn unsubscribe(&mut self, cx: &Cx) -> Result<(), StoreError> {
        cx.checkpoint().map_err(StoreError::Cancelled)?;
        self.detach();
        Ok(())
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Future waiting for the next message on a subscription.
struct NextMessage {
    inner: Arc<MemoryInner>,
    channel: String,
    id: u64,
    cx: Cx,
}

impl Future for NextMessage {
    type Output = Result<Message, StoreError>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Err(reason) = this.cx.checkpoint() {
            return Poll::Ready(Err(StoreError::Cancelled(reason)));
        }

        let mut channels = this.inner.channels.lock();
        let slot = channels
            .get_mut(&this.channel)
            .and_then(|state| state.subscribers.get_mut(&this.id));
        let Some(slot) = slot else {
            return Poll::Ready(Err(StoreError::Closed));
        };
        if let Some(message) = slot.queue.pop_front() {
            return Poll::Ready(Ok(message));
        }
        if slot
            .waker
            .as_ref()
            .is_none_or(|w| !w.will_wake(task_cx.waker()))
        {
            slot.waker = Some(task_cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cx::CancelReason;
    use std::task::Waker;

    fn drive<T>(future: impl Future<Output = T>) -> T {
        let mut future = Box::pin(future);
        let waker = Waker::noop();
        let mut task_cx = Context::from_waker(waker);
        loop {
            match future.as_mut().poll(&mut task_cx) {
                Poll::Ready(value) => return value,
                Poll::Pending => std::thread::yield_now(),
            }
        }
    }

    fn poll_once<T>(future: &mut Pin<Box<impl Future<Output = T>>>) -> Option<T> {
        let waker = Waker::noop();
        let mut task_cx = Context::from_waker(waker);
        match future.as_mut().poll(&mut task_cx) {
            Poll::Ready(value) => Some(value),
            Poll::Pending => None,
        }
    }

    #[test]
    fn string_roundtrip_and_exists() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        assert!(!drive(store.exists(&cx, "k")).unwrap());
        drive(store.set(&cx, "k", "v")).unwrap();
        assert!(drive(store.exists(&cx, "k")).unwrap());
        assert_eq!(drive(store.get(&cx, "k")).unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn incr_decr_create_and_count() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        assert_eq!(drive(store.incr(&cx, "n")).unwrap(), 1);
        assert_eq!(drive(store.incr(&cx, "n")).unwrap(), 2);
        assert_eq!(drive(store.decr(&cx, "n")).unwrap(), 1);
        assert_eq!(drive(store.decr(&cx, "missing")).unwrap(), -1);
    }

    #[test]
    fn incr_rejects_non_integer() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        drive(store.set(&cx, "k", "not-a-number")).unwrap();
        let err = drive(store.incr(&cx, "k")).unwrap_err();
        assert!(matches!(err, StoreError::NotAnInteger { .. }));
    }

    #[test]
    fn list_is_fifo_from_the_tail() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        drive(store.list_push_head(&cx, "q", "a")).unwrap();
        drive(store.list_push_head(&cx, "q", "b")).unwrap();
        assert_eq!(drive(store.list_push_head(&cx, "q", "c")).unwrap(), 3);

        // "a" went in first, so it sits at the tail.
        assert_eq!(
            drive(store.list_peek_tail(&cx, "q")).unwrap().as_deref(),
            Some("a")
        );
        assert_eq!(
            drive(store.list_pop_tail(&cx, "q")).unwrap().as_deref(),
            Some("a")
        );
        assert_eq!(
            drive(store.list_pop_tail(&cx, "q")).unwrap().as_deref(),
            Some("b")
        );
        assert_eq!(drive(store.list_len(&cx, "q")).unwrap(), 1);
    }

    #[test]
    fn list_remove_deletes_all_occurrences() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        for value in ["x", "y", "x", "x"] {
            drive(store.list_push_head(&cx, "q", value)).unwrap();
        }
        assert_eq!(drive(store.list_remove(&cx, "q", "x")).unwrap(), 3);
        assert_eq!(drive(store.list_len(&cx, "q")).unwrap(), 1);
        assert_eq!(drive(store.list_remove(&cx, "q", "absent")).unwrap(), 0);
    }

    #[test]
    fn lock_ownership_check_refuses_non_owner() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        drive(store.lock_acquire(&cx, "l", "alice")).unwrap();
        assert!(drive(store.lock_is_held_by(&cx, "l", "alice")).unwrap());
        assert!(!drive(store.lock_is_held_by(&cx, "l", "bob")).unwrap());

        assert!(!drive(store.lock_release(&cx, "l", "bob")).unwrap());
        assert!(drive(store.lock_is_held_by(&cx, "l", "alice")).unwrap());
        assert!(drive(store.lock_release(&cx, "l", "alice")).unwrap());
        assert!(!drive(store.lock_release(&cx, "l", "alice")).unwrap());
    }

    #[test]
    fn lock_hands_off_to_waiting_contender() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        drive(store.lock_acquire(&cx, "l", "alice")).unwrap();

        let mut contender = Box::pin(store.lock_acquire(&cx, "l", "bob"));
        assert!(poll_once(&mut contender).is_none());
        assert!(poll_once(&mut contender).is_none());

        assert!(drive(store.lock_release(&cx, "l", "alice")).unwrap());
        assert!(matches!(poll_once(&mut contender), Some(Ok(()))));
        assert_eq!(store.lock_owner("l").as_deref(), Some("bob"));
    }

    #[test]
    fn abandoned_lock_waiter_leaves_the_queue() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        drive(store.lock_acquire(&cx, "l", "alice")).unwrap();

        let mut bob = Box::pin(store.lock_acquire(&cx, "l", "bob"));
        let mut carol = Box::pin(store.lock_acquire(&cx, "l", "carol"));
        assert!(poll_once(&mut bob).is_none());
        assert!(poll_once(&mut carol).is_none());

        // Bob gives up; Carol must still get the handoff.
        drop(bob);
        assert!(drive(store.lock_release(&cx, "l", "alice")).unwrap());
        assert!(matches!(poll_once(&mut carol), Some(Ok(()))));
        assert_eq!(store.lock_owner("l").as_deref(), Some("carol"));
    }

    #[test]
    fn publish_reaches_only_current_subscribers() {
        let store = MemoryStore::new();
        let cx = Cx::new();

        // Nobody listening yet: delivered to zero subscribers, not queued.
        assert_eq!(drive(store.publish(&cx, "ch", "early")).unwrap(), 0);

        let mut first = drive(store.subscribe(&cx, "ch")).unwrap();
        let mut second = drive(store.subscribe(&cx, "ch")).unwrap();
        assert_eq!(store.subscriber_count("ch"), 2);

        assert_eq!(drive(store.publish(&cx, "ch", "hello")).unwrap(), 2);
        let message = drive(first.next_message(&cx)).unwrap();
        assert_eq!(message.payload, "hello");
        assert_eq!(message.channel, "ch");
        assert_eq!(drive(second.next_message(&cx)).unwrap().payload, "hello");
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_detaches() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        let mut sub = drive(store.subscribe(&cx, "ch")).unwrap();
        drive(sub.unsubscribe(&cx)).unwrap();
        drive(sub.unsubscribe(&cx)).unwrap();
        assert_eq!(store.subscriber_count("ch"), 0);
        assert!(matches!(
            drive(sub.next_message(&cx)),
            Err(StoreError::Closed)
        ));

        let dropped = drive(store.subscribe(&cx, "ch")).unwrap();
        assert_eq!(store.subscriber_count("ch"), 1);
        drop(dropped);
        assert_eq!(store.subscriber_count("ch"), 0);
    }

    #[test]
    fn next_message_observes_cancellation() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        let mut sub = drive(store.subscribe(&cx, "ch")).unwrap();

        let mut pending = Box::pin(sub.next_message(&cx));
        assert!(poll_once(&mut pending).is_none());

        cx.cancel(CancelReason::user("giving up"));
        assert!(matches!(
            poll_once(&mut pending),
            Some(Err(StoreError::Cancelled(_)))
        ));
    }

    #[test]
    fn messages_arrive_in_publish_order() {
        let store = MemoryStore::new();
        let cx = Cx::new();
        let mut sub = drive(store.subscribe(&cx, "ch")).unwrap();
        for payload in ["one", "two", "three"] {
            drive(store.publish(&cx, "ch", payload)).unwrap();
        }
        for expected in ["one", "two", "three"] {
            assert_eq!(drive(sub.next_message(&cx)).unwrap().payload, expected);
        }
    }
}
