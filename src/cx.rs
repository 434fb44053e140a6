//! The capability context type.
//!
//! `Cx` is the token that carries cancellation through every semaphore and
//! store operation. All suspending operations in this crate take a `&Cx` and
//! observe cancellation at their suspension points, so a caller abandoning an
//! acquisition can always drive the cleanup protocol (waiter-list removal,
//! unsubscribe) before the failure surfaces.
//!
//! # Masking
//!
//! Cleanup sections must run even when the context is already cancelled:
//! a cancelled waiter that cannot delete its own queue entry would stall
//! every later waiter behind it. [`Cx::mask`] returns a guard that suppresses
//! cancellation observation for as long as it is held, including across
//! `await` points.
//!
//! # Thread Safety
//!
//! `Cx` is cheaply clonable (it wraps an `Arc`). Clones share the same
//! underlying state, so a cancellation signalled through one clone is visible
//! to all of them.

use std::fmt;
use std::sync::{Arc, RwLock};

/// Why a context was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelKind {
    /// Cancelled by an explicit caller request.
    User,
    /// Cancelled because a deadline or timeout elapsed.
    Timeout,
    /// Cancelled because the owning process is shutting down.
    Shutdown,
}

/// The reason attached to a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    kind: CancelKind,
    detail: Arc<str>,
}

impl CancelReason {
    /// A user-requested cancellation.
    #[must_use]
    pub fn user(detail: &str) -> Self {
        Self {
            kind: CancelKind::User,
            detail: Arc::from(detail),
        }
    }

    /// A timeout-driven cancellation.
    #[must_use]
    pub fn timeout(detail: &str) -> Self {
        Self {
            kind: CancelKind::Timeout,
            detail: Arc::from(detail),
        }
    }

    /// A shutdown-driven cancellation.
    #[must_use]
    pub fn shutdown(detail: &str) -> Self {
        Self {
            kind: CancelKind::Shutdown,
            detail: Arc::from(detail),
        }
    }

    /// Returns the kind of cancellation.
    #[must_use]
    pub fn kind(&self) -> CancelKind {
        self.kind
    }

    /// Returns the human-readable detail string.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CancelKind::User => write!(f, "cancelled: {}", self.detail),
            CancelKind::Timeout => write!(f, "timed out: {}", self.detail),
            CancelKind::Shutdown => write!(f, "shutting down: {}", self.detail),
        }
    }
}

#[derive(Debug)]
struct CxInner {
    cancel_requested: bool,
    cancel_reason: Option<CancelReason>,
    mask_depth: u32,
}

/// The capability context for one caller.
///
/// Every suspending operation takes a `&Cx` and checks it at suspension
/// points via [`checkpoint`](Cx::checkpoint). Cancellation is cooperative:
/// setting the flag does not interrupt an operation mid-flight, it makes the
/// next checkpoint fail.
#[derive(Debug, Clone)]
pub struct Cx {
    inner: Arc<RwLock<CxInner>>,
}

impl Cx {
    /// Creates a fresh, uncancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(CxInner {
                cancel_requested: false,
                cancel_reason: None,
                mask_depth: 0,
            })),
        }
    }

    /// Returns true if cancellation has been requested.
    ///
    /// This ignores masking; it reports the raw flag.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.read().expect("lock poisoned").cancel_requested
    }

    /// Returns the reason attached to the cancellation request, if any.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.inner
            .read()
            .expect("lock poisoned")
            .cancel_reason
            .clone()
    }

    /// Checks for cancellation.
    ///
    /// Returns the cancel reason as an error if cancellation has been
    /// requested and no [`mask`](Cx::mask) guard is held. Call this at the
    /// top of every operation and at every iteration of a wait loop.
    pub fn checkpoint(&self) -> Result<(), CancelReason> {
        let inner = self.inner.read().expect("lock poisoned");
        if inner.cancel_requested && inner.mask_depth == 0 {
            Err(inner
                .cancel_reason
                .clone()
                .unwrap_or_else(|| CancelReason::user("cancelled")))
        } else {
            Ok(())
        }
    }

    /// Requests cancellation with the given reason.
    ///
    /// The first reason wins; later calls keep the original reason.
    pub fn cancel(&self, reason: CancelReason) {
        let mut inner = self.inner.write().expect("lock poisoned");
        if !inner.cancel_requested {
            inner.cancel_requested = true;
            inner.cancel_reason = Some(reason);
        }
    }

    /// Suppresses cancellation observation while the returned guard is held.
    ///
    /// While masked, [`checkpoint`](Cx::checkpoint) returns `Ok(())` even if
    /// cancellation has been requested. Masks nest; cancellation becomes
    /// observable again once every guard has been dropped.
    ///
    /// Use masking sparingly: it exists for short cleanup sections (releasing
    /// a held lock, deleting a queue entry) that must complete even on a
    /// cancelled context.
    #[must_use]
    pub fn mask(&self) -> MaskGuard {
        self.inner.write().expect("lock poisoned").mask_depth += 1;
        MaskGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by [`Cx::mask`]. Unmasks on drop.
#[derive(Debug)]
pub struct MaskGuard {
    inner: Arc<RwLock<CxInner>>,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.mask_depth = inner.mask_depth.saturating_sub(1);
    }
}
