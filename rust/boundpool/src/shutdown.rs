//! Process-wide accounting of non-daemon workers.
//!
//! A worker launched with `daemon = false` must not be torn down just because
//! `main` returned. Rust gives detached threads no such guarantee, so every
//! non-daemon worker (thread, or the watcher of a worker process) registers
//! here for its lifetime, and the program blocks on [`wait_for_workers`] (or
//! holds an [`ExitGuard`]) before it exits.
//!
//! ```rust,no_run
//! fn main() {
//!     let _exit = boundpool::shutdown::exit_guard();
//!     // ... run pools with `join = false, daemon = false` ...
//! } // blocks here until those workers are done
//! ```

use std::sync::{Condvar, Mutex};

static TRACKER: Tracker = Tracker {
    live: Mutex::new(0),
    changed: Condvar::new(),
};

struct Tracker {
    live: Mutex<usize>,
    changed: Condvar,
}

/// Number of non-daemon workers currently alive in this process.
pub fn live_workers() -> usize {
    *TRACKER
        .live
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Blocks until every non-daemon worker of this process has finished.
pub fn wait_for_workers() {
    let live = TRACKER
        .live
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if *live > 0 {
        log::debug!("waiting for {} non-daemon workers", *live);
    }
    let _live = TRACKER
        .changed
        .wait_while(live, |live| *live > 0)
        .unwrap_or_else(|poisoned| poisoned.into_inner());
}

/// Returns a guard that calls [`wait_for_workers`] when dropped.
pub fn exit_guard() -> ExitGuard {
    ExitGuard(())
}

#[must_use = "the guard waits for non-daemon workers when it is dropped"]
pub struct ExitGuard(());

impl Drop for ExitGuard {
    fn drop(&mut self) {
        wait_for_workers();
    }
}

/// Registration of one non-daemon worker; dropping it unregisters.
pub(crate) struct Registration(());

pub(crate) fn register() -> Registration {
    *TRACKER
        .live
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
    Registration(())
}

/// Registers only when the worker is not a daemon.
pub(crate) fn register_unless_daemon(daemon: bool) -> Option<Registration> {
    (!daemon).then(register)
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut live = TRACKER
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *live -= 1;
        if *live == 0 {
            TRACKER.changed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_wait_blocks_on_registered_worker() {
        let registration = register();
        assert!(live_workers() >= 1);
        assert!(register_unless_daemon(true).is_none());

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(registration);
        });

        let start = Instant::now();
        wait_for_workers();
        assert!(start.elapsed() >= Duration::from_millis(40));
        handle.join().unwrap();
    }
}
