//! Worker handles and their completion signal.
//!
//! Each launched worker gets a [`WorkerHandle`] (kept by the dispatcher) and a
//! matching [`Completion`] (moved into the worker). The worker fires the
//! completion when it is done; dropping the completion without firing it
//! counts as done as well, so a handle can never stay pending after its
//! worker is gone.
//!
//! ## Lifecycle
//!
//! 1. **Running**: the worker holds its [`Completion`].
//! 2. **Finished**: the completion fired or was dropped;
//!    [`WorkerHandle::is_finished`] turns `true` and [`WorkerHandle::join`]
//!    returns immediately.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use crate::config::Isolation;

/// Creates a linked handle/completion pair for worker `id`.
pub(crate) fn worker(id: u64, isolation: Isolation, daemon: bool) -> (WorkerHandle, Completion) {
    let cell = Arc::new(DoneCell::default());
    (
        WorkerHandle {
            id,
            isolation,
            daemon,
            cell: cell.clone(),
        },
        Completion(cell),
    )
}

/// The dispatcher's view of one in-flight worker.
pub struct WorkerHandle {
    id: u64,
    isolation: Isolation,
    daemon: bool,
    cell: Arc<DoneCell>,
}

impl WorkerHandle {
    /// A handle for a worker that never ran (its launch failed and was
    /// reported as an item failure).
    pub(crate) fn finished(id: u64, isolation: Isolation, daemon: bool) -> WorkerHandle {
        let (handle, completion) = worker(id, isolation, daemon);
        completion.complete();
        handle
    }

    /// Sequence number of the worker within its invocation, starting at 0.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Non-blocking liveness check.
    pub fn is_finished(&self) -> bool {
        self.cell.is_done()
    }

    /// Blocks until the worker has finished.
    pub fn join(&self) {
        self.cell.wait();
    }

    /// Blocks for at most `timeout`; returns whether the worker finished.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait_for(timeout)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("daemon", &self.daemon)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Worker-side half of the completion signal.
pub(crate) struct Completion(Arc<DoneCell>);

impl Completion {
    pub fn complete(self) {
        // Drop does the work.
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

#[derive(Default)]
struct DoneCell {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl DoneCell {
    fn mark_done(&self) {
        *self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.condvar.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(&self) {
        let guard = self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _guard = self
            .condvar
            .wait_while(guard, |done| !*done)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_send_sync() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<WorkerHandle>();
        is_send_sync::<Completion>();
    }

    #[test]
    fn test_complete_from_other_thread() {
        let (handle, completion) = worker(3, Isolation::Thread, true);
        assert!(!handle.is_finished());
        assert_eq!(handle.id(), 3);
        assert!(handle.is_daemon());

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completion.complete();
        });
        handle.join();
        assert!(handle.is_finished());
    }

    #[test]
    fn test_dropped_completion_counts_as_finished() {
        let (handle, completion) = worker(0, Isolation::Process, false);
        let result = std::thread::spawn(move || {
            let _completion = completion;
            panic!("worker unwound");
        })
        .join();
        assert!(result.is_err());
        assert!(handle.is_finished());
    }

    #[test]
    fn test_join_timeout() {
        let (handle, completion) = worker(1, Isolation::Thread, true);
        assert!(!handle.join_timeout(Duration::from_millis(10)));
        drop(completion);
        assert!(handle.join_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_finished_handle() {
        let handle = WorkerHandle::finished(9, Isolation::Process, true);
        assert!(handle.is_finished());
        assert_eq!(handle.isolation(), Isolation::Process);
    }
}
