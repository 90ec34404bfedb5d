//! Concurrency gate: a counting semaphore over live workers.
//!
//! The dispatcher takes a [`Lease`] before launching each worker and the
//! worker gives it back (by dropping it) when it finishes. [`Gate::acquire`]
//! sleeps on a condition variable while `limit` leases are out, and
//! [`Gate::wait_idle`] sleeps until none are, which makes the gate double as
//! the invocation's completion barrier. Both waits are registered with the
//! invocation's [`CancelToken`] and return [`ErrorKind::Cancelled`] when it
//! trips.
//!
//! [`ErrorKind::Cancelled`]: crate::error::ErrorKind::Cancelled

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use crate::{
    cancel::{CancelToken, Interrupt},
    error::{Error, Result},
};

pub(crate) struct Gate {
    limit: usize,
    state: Mutex<GateState>,
    changed: Condvar,
}

struct GateState {
    live: usize,
    peak: usize,
    cancelled: bool,
}

impl Gate {
    /// Creates a gate admitting at most `limit` leases and wires it to
    /// `cancel`.
    pub fn new(limit: usize, cancel: &CancelToken) -> Arc<Gate> {
        assert_ne!(limit, 0);
        let gate = Arc::new(Gate {
            limit,
            state: Mutex::new(GateState {
                live: 0,
                peak: 0,
                cancelled: false,
            }),
            changed: Condvar::new(),
        });
        let weak: Weak<dyn Interrupt> = Arc::downgrade(&gate) as Weak<dyn Interrupt>;
        cancel.watch(weak);
        gate
    }

    /// Blocks until fewer than `limit` leases are outstanding, then takes one.
    pub fn acquire(self: &Arc<Self>) -> Result<Lease> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Err(Error::cancelled());
            }
            if state.live < self.limit {
                break;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.live += 1;
        state.peak = state.peak.max(state.live);
        Ok(Lease {
            gate: Some(self.clone()),
        })
    }

    /// Completion barrier: blocks until every lease has been released.
    ///
    /// Fails once the gate has been cancelled, even if it is idle by then.
    pub fn wait_idle(&self) -> Result<()> {
        let state = self
            .changed
            .wait_while(self.lock(), |state| state.live > 0 && !state.cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.cancelled {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Number of leases currently held.
    pub fn live(&self) -> usize {
        self.lock().live
    }

    /// Highest number of leases ever held at the same time.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    fn release(&self) {
        let mut state = self.lock();
        debug_assert!(state.live > 0);
        state.live -= 1;
        drop(state);
        // Both the dispatcher (slot free) and the barrier (maybe idle) may be
        // waiting on the same condvar.
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Interrupt for Gate {
    fn interrupt(&self) {
        self.lock().cancelled = true;
        self.changed.notify_all();
    }
}

/// One unit of the gate's capacity, held for the lifetime of a worker.
///
/// Dropping the lease releases the slot, so a worker gives its slot back even
/// when it unwinds.
pub(crate) struct Lease {
    gate: Option<Arc<Gate>>,
}

impl Lease {
    /// Gives the slot back explicitly.
    pub fn release(mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_acquire_blocks_at_limit() {
        let cancel = CancelToken::new();
        let gate = Gate::new(2, &cancel);
        let a = gate.acquire().unwrap();
        let _b = gate.acquire().unwrap();
        assert_eq!(gate.live(), 2);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            a.release();
        });

        let start = Instant::now();
        let _c = gate.acquire().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        releaser.join().unwrap();
        assert_eq!(gate.live(), 2);
        assert_eq!(gate.peak(), 2);
    }

    #[test]
    fn test_wait_idle() {
        let cancel = CancelToken::new();
        let gate = Gate::new(4, &cancel);
        let leases: Vec<_> = (0..4).map(|_| gate.acquire().unwrap()).collect();

        let handle = thread::spawn(move || {
            for lease in leases {
                thread::sleep(Duration::from_millis(10));
                drop(lease);
            }
        });

        gate.wait_idle().unwrap();
        assert_eq!(gate.live(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_wakes_blocked_acquire() {
        let cancel = CancelToken::new();
        let gate = Gate::new(1, &cancel);
        let _held = gate.acquire().unwrap();

        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.cancel();
        });

        let err = gate.acquire().err().expect("acquire must be interrupted");
        assert!(err.is_cancelled());
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_wakes_barrier() {
        let cancel = CancelToken::new();
        let gate = Gate::new(1, &cancel);
        let _held = gate.acquire().unwrap();
        cancel.cancel();
        assert!(gate.wait_idle().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_idle_gate_reports_earlier_cancel() {
        let cancel = CancelToken::new();
        let gate = Gate::new(1, &cancel);
        drop(gate.acquire().unwrap());
        cancel.cancel();
        assert_eq!(gate.live(), 0);
        assert!(gate.wait_idle().unwrap_err().is_cancelled());
    }
}
