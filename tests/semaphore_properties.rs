//! End-to-end properties of the semaphore protocol against a shared
//! in-process store: capacity bounds, FIFO admission, release idempotence,
//! and the canonical two-caller scenario.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use distsem::store::memory::MemoryStore;
use distsem::{Cx, DistributedSemaphore, SemaphoreConfig, Store};

fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn drive<T>(future: impl Future<Output = T>) -> T {
    let mut future: Pin<Box<_>> = Box::pin(future);
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

fn semaphore(
    store: &MemoryStore,
    identity: &str,
    capacity: u32,
) -> DistributedSemaphore<MemoryStore> {
    DistributedSemaphore::new(
        store.clone(),
        SemaphoreConfig::new("job", identity).with_capacity(capacity),
    )
    .expect("valid config")
}

/// Spins until `predicate` holds, panicking after five seconds.
fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn waiter_len(store: &MemoryStore) -> u64 {
    let cx = Cx::new();
    drive(store.list_len(&cx, "semaphore:job:waiters")).expect("list_len")
}

fn counter(store: &MemoryStore) -> Option<String> {
    let cx = Cx::new();
    drive(store.get(&cx, "semaphore:job")).expect("get")
}

#[test]
fn capacity_bounds_concurrent_holders() {
    init_test_logging();
    const CAPACITY: u32 = 3;
    const EXTRA: usize = 2;
    const TOTAL: usize = CAPACITY as usize + EXTRA;

    let store = MemoryStore::new();
    let holding = Arc::new(AtomicUsize::new(0));
    let mut release_signals = Vec::new();
    let mut handles = Vec::new();

    for i in 0..TOTAL {
        let (tx, rx) = mpsc::channel::<()>();
        release_signals.push(tx);
        let store = store.clone();
        let holding = Arc::clone(&holding);
        handles.push(std::thread::spawn(move || {
            let sem = semaphore(&store, &format!("worker-{i}"), CAPACITY);
            let cx = Cx::new();
            drive(sem.acquire(&cx)).expect("acquire");
            holding.fetch_add(1, Ordering::SeqCst);
            rx.recv().expect("release signal");
            drive(sem.release(&cx)).expect("release");
            holding.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    // Exactly CAPACITY acquirers proceed immediately; the rest queue.
    wait_until("initial holders", || {
        holding.load(Ordering::SeqCst) == CAPACITY as usize
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(holding.load(Ordering::SeqCst), CAPACITY as usize);
    wait_until("queued waiters", || waiter_len(&store) == EXTRA as u64);

    // Each release admits exactly one queued waiter.
    for signal in &release_signals {
        signal.send(()).expect("signal");
    }
    for handle in handles {
        handle.join().expect("worker thread");
    }

    assert_eq!(holding.load(Ordering::SeqCst), 0);
    assert_eq!(waiter_len(&store), 0);
    assert_eq!(counter(&store).as_deref(), Some("3"));
}

#[test]
fn admission_follows_enqueue_order() {
    init_test_logging();
    let store = MemoryStore::new();
    let admitted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let holder = semaphore(&store, "holder", 1);
    let holder_cx = Cx::new();
    drive(holder.acquire(&holder_cx)).expect("holder acquire");

    let mut handles = Vec::new();
    for i in 1..=5u64 {
        let store_clone = store.clone();
        let admitted = Arc::clone(&admitted);
        let identity = format!("w{i}");
        handles.push(std::thread::spawn(move || {
            let sem = semaphore(&store_clone, &identity, 1);
            let cx = Cx::new();
            drive(sem.acquire(&cx)).expect("acquire");
            admitted.lock().push(identity);
            // Hand the slot straight to the next waiter in line.
            drive(sem.release(&cx)).expect("release");
        }));
        // Enqueue strictly in spawn order.
        wait_until("waiter enqueued", || waiter_len(&store) == i);
    }

    drive(holder.release(&holder_cx)).expect("holder release");
    for handle in handles {
        handle.join().expect("waiter thread");
    }

    assert_eq!(
        admitted.lock().clone(),
        vec!["w1", "w2", "w3", "w4", "w5"],
        "admission order must match waiter-list insertion order"
    );
    assert_eq!(counter(&store).as_deref(), Some("1"));
}

#[test]
fn over_release_never_exceeds_capacity() {
    init_test_logging();
    let store = MemoryStore::new();
    let sem = semaphore(&store, "w1", 2);
    let cx = Cx::new();

    // Release without any prior acquire on a fresh semaphore.
    drive(sem.release(&cx)).expect("release");
    assert_eq!(counter(&store).as_deref(), Some("2"));

    // And a genuine double-release after one acquire.
    drive(sem.acquire(&cx)).expect("acquire");
    drive(sem.release(&cx)).expect("first release");
    drive(sem.release(&cx)).expect("second release");
    assert_eq!(counter(&store).as_deref(), Some("2"));
}

#[test]
fn single_slot_is_never_double_granted() {
    init_test_logging();
    let store = MemoryStore::new();
    let granted = Arc::new(AtomicUsize::new(0));
    let winners: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let mut release_signals = Vec::new();
    let mut handles = Vec::new();

    for i in 0..2 {
        let (tx, rx) = mpsc::channel::<()>();
        release_signals.push(tx);
        let store = store.clone();
        let granted = Arc::clone(&granted);
        let winners = Arc::clone(&winners);
        handles.push(std::thread::spawn(move || {
            let sem = semaphore(&store, &format!("racer-{i}"), 1);
            let cx = Cx::new();
            drive(sem.acquire(&cx)).expect("acquire");
            granted.fetch_add(1, Ordering::SeqCst);
            winners.lock().push(i);
            rx.recv().expect("release signal");
            drive(sem.release(&cx)).expect("release");
        }));
    }

    // Exactly one racer wins; the other parks in the waiter list.
    wait_until("one winner", || granted.load(Ordering::SeqCst) == 1);
    wait_until("one waiter", || waiter_len(&store) == 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(granted.load(Ordering::SeqCst), 1, "double grant detected");
    assert_eq!(counter(&store).as_deref(), Some("0"));

    // Releasing the winner admits the loser.
    let first = winners.lock()[0];
    release_signals[first].send(()).expect("signal winner");
    wait_until("second grant", || granted.load(Ordering::SeqCst) == 2);
    let second = winners.lock()[1];
    release_signals[second].send(()).expect("signal loser");
    for handle in handles {
        handle.join().expect("racer thread");
    }
}

#[test]
fn two_caller_scenario_walkthrough() {
    init_test_logging();
    let store = MemoryStore::new();
    let caller_a = semaphore(&store, "A", 1);
    let caller_b = semaphore(&store, "B", 1);
    let cx = Cx::new();

    // A acquires: immediate success, counter drops to 0.
    drive(caller_a.acquire(&cx)).expect("A acquires");
    assert_eq!(counter(&store).as_deref(), Some("0"));

    // B acquires: blocks, waiter list holds exactly B.
    let mut b_acquire = Box::pin(caller_b.acquire(&cx));
    for _ in 0..16 {
        assert!(poll_once(&mut b_acquire).is_none(), "B must block");
    }
    assert_eq!(waiter_len(&store), 1);
    assert_eq!(
        drive(store.list_peek_tail(&cx, "semaphore:job:waiters")).expect("peek"),
        Some("B".to_string())
    );

    // A releases: counter back to 1, notification published.
    drive(caller_a.release(&cx)).expect("A releases");
    assert_eq!(counter(&store).as_deref(), Some("1"));

    // B observes it is next, admits: counter 0, waiter list empty.
    drive(b_acquire.as_mut()).expect("B admitted");
    assert_eq!(counter(&store).as_deref(), Some("0"));
    assert_eq!(waiter_len(&store), 0);
    assert_eq!(store.subscriber_count("semaphore:job:channel"), 0);

    // B releases: counter 1.
    drive(caller_b.release(&cx)).expect("B releases");
    assert_eq!(counter(&store).as_deref(), Some("1"));
}
