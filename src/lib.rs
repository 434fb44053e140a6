//! Distributed counting semaphore coordinated through a shared key-value
//! store.
//!
//! Up to `capacity` concurrent holders (tasks, processes, or machines)
//! acquire a limited resource slot without a central coordinator process.
//! All shared state (free-slot counter, critical-section lock, FIFO waiter
//! list, notification channel) lives in a store reachable by every caller;
//! the semaphore handle itself is stateless apart from configuration.
//!
//! # Overview
//!
//! - [`DistributedSemaphore`]: the acquire/release protocol and the scoped
//!   acquisition helper.
//! - [`Store`]: the interface the protocol needs from a Redis-class store:
//!   atomic counters, an ownership-checked mutual-exclusion lock, list
//!   storage, and publish/subscribe. [`MemoryStore`](store::memory::MemoryStore)
//!   is the in-process reference implementation;
//!   [`FaultStore`](store::fault::FaultStore) adds scripted failures for
//!   tests.
//! - [`Cx`]: the capability context carrying cancellation through every
//!   operation.
//!
//! # Example
//!
//! ```ignore
//! use distsem::store::memory::MemoryStore;
//! use distsem::{Cx, DistributedSemaphore, SemaphoreConfig};
//!
//! let store = MemoryStore::new();
//! let semaphore = DistributedSemaphore::new(
//!     store,
//!     SemaphoreConfig::new("encode-job", "worker-1").with_capacity(4),
//! )?;
//!
//! let cx = Cx::new();
//! semaphore
//!     .with_acquired(&cx, async |cx| {
//!         // At most 4 cooperating callers run here at once.
//!         run_guarded_work(cx).await
//!     })
//!     .await?;
//! ```
//!
//! # Guarantees and limits
//!
//! At most `capacity` acquisitions succeed without an intervening release;
//! admission follows waiter-list insertion order (best-effort FIFO; a
//! store that expires entries externally can break it, surfaced as
//! [`SemaphoreError::OrphanedWaiter`]). If the store is unavailable,
//! acquire and release fail visibly; nothing is retried internally beyond
//! what the store client itself performs.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod cx;
pub mod error;
pub mod semaphore;
pub mod store;

pub use config::{ConfigError, SemaphoreConfig, SemaphoreKeys};
pub use cx::{CancelKind, CancelReason, Cx, MaskGuard};
pub use error::{Recoverability, SemaphoreError};
pub use semaphore::DistributedSemaphore;
pub use store::{Message, Store, StoreError, Subscriber};
