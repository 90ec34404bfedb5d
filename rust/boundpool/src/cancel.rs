//! Cooperative cancellation of a whole pool invocation.
//!
//! A [`CancelToken`] is the pool's interrupt signal. It is tripped either by
//! the caller (from any thread) or by a worker whose task reports
//! [`Cancelled`]. Every blocking wait of the dispatcher is registered with the
//! token and wakes up immediately when it trips; the invocation then unwinds
//! with [`ErrorKind::Cancelled`](crate::error::ErrorKind::Cancelled).
//!
//! Each invocation works on a [`CancelToken::child`] of the pool's token:
//! cancelling the pool's token stops every running invocation, while a worker
//! only ever trips its own invocation's child.
//!
//! Running workers are never interrupted: the token only stops further
//! dispatch and releases the caller.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

/// Marker error a task returns to abort the entire invocation.
///
/// Unlike any other error, this one is not contained at the worker: it trips
/// the invocation's [`CancelToken`]. It is recognised anywhere in the source
/// chain of the returned error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Something blocked on a condition variable that must re-check its state
/// once the token trips.
pub(crate) trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// A clonable, thread-safe cancellation flag. All clones share one state.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    watchers: Mutex<Vec<Weak<dyn Interrupt>>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Trips the token and every token derived from it. Idempotent.
    pub fn cancel(&self) {
        if self.0.trip() {
            log::debug!("pool cancellation requested");
        }
    }

    /// Creates a token that trips together with `self`, but whose own
    /// cancellation stays invisible to `self`.
    ///
    /// Every pool invocation runs on a child of the pool's token, so a worker
    /// that cancels its invocation leaves other invocations alone.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        self.watch(Arc::downgrade(&child.0) as Weak<dyn Interrupt>);
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `watcher` to be interrupted when the token trips. If the
    /// token has already tripped, the watcher is interrupted right away.
    pub(crate) fn watch(&self, watcher: Weak<dyn Interrupt>) {
        let mut watchers = self
            .0
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_cancelled() {
            drop(watchers);
            if let Some(watcher) = watcher.upgrade() {
                watcher.interrupt();
            }
            return;
        }
        watchers.retain(|w| w.strong_count() > 0);
        watchers.push(watcher);
    }
}

impl CancelState {
    /// Sets the flag and wakes the watchers; returns whether this call did it.
    fn trip(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let watchers = std::mem::take(
            &mut *self
                .watchers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for watcher in watchers.iter().filter_map(Weak::upgrade) {
            watcher.interrupt();
        }
        true
    }
}

impl Interrupt for CancelState {
    fn interrupt(&self) {
        self.trip();
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
