use parking_lot::Mutex;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Internal cancellation state, shared via [`Arc`].
/// Cancelling a parent cancels all of its descendants.
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    #[inline]
    fn new_root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            parent: None,
        })
    }

    #[inline]
    fn child_of(parent: Arc<CancelState>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            parent: Some(parent),
        })
    }

    /// Marks the state cancelled. Only the first reason is kept.
    fn cancel(&self, reason: Option<&str>) {
        if let Some(reason) = reason {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.parent {
            Some(ref p) => p.is_cancelled(),
            None => false,
        }
    }

    fn reason(&self) -> Option<String> {
        if let Some(reason) = self.reason.lock().clone() {
            return Some(reason);
        }
        self.parent.as_ref().and_then(|p| p.reason())
    }
}

/// Hierarchical cancellation token shared by every thread of one run.
///
/// Blocking waits in the pipeline poll it, so cancelling the root unwinds
/// sources, the evaluator and sinks without waiting for end of data.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancelToken {
    /// Create a new root cancellation token.
    #[inline]
    pub fn new_root() -> Self {
        Self {
            state: CancelState::new_root(),
        }
    }

    /// Cancel this token (and all children).
    #[inline]
    pub fn cancel(&self) {
        self.state.cancel(None);
    }

    /// Cancel and record why. The first recorded reason wins.
    pub fn cancel_because(&self, reason: impl AsRef<str>) {
        self.state.cancel(Some(reason.as_ref()));
    }

    /// Check if this token (or any ancestor) has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Reason recorded by the first `cancel_because` on this token or an ancestor.
    pub fn reason(&self) -> Option<String> {
        self.state.reason()
    }

    /// Create a new child token linked to this one.
    #[inline]
    pub fn new_child(&self) -> Self {
        Self {
            state: CancelState::child_of(self.state.clone()),
        }
    }

    /// Sleep until the token is cancelled or `total` has elapsed.
    /// Returns false if the sleep was cut short by cancellation.
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        let tick = Duration::from_millis(10);
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.is_cancelled() {
                return false;
            }
            let step = tick.min(total - slept);
            std::thread::sleep(step);
            slept += step;
        }
        !self.is_cancelled()
    }

    /// Guard that cancels this token if dropped while still armed,
    /// e.g. when a worker thread unwinds from a panic.
    pub fn guard(&self, owner: impl Into<String>) -> CancelGuard {
        CancelGuard {
            token: self.clone(),
            owner: owner.into(),
            armed: true,
        }
    }
}

pub struct CancelGuard {
    token: CancelToken,
    owner: String,
    armed: bool,
}

impl CancelGuard {
    /// The owner finished normally; dropping no longer cancels.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.token
                .cancel_because(format!("{} exited abnormally", self.owner));
        }
    }
}
