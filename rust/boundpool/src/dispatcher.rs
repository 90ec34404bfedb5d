//! The engine shared by both pool flavours.
//!
//! [`Dispatcher::run`] wires one invocation together:
//!
//! ```text
//! items --(producer thread)--> intake queue --(dispatcher)--> Launcher --> workers
//! ```
//!
//! The producer runs on a scoped thread so that an unbounded source is
//! consumed concurrently with dispatch, blocking whenever `max_buffer` items
//! are waiting. The dispatcher itself runs on the caller's thread; for every
//! item it first lets the launcher flush pending failure reports, then takes a
//! lease from the [`Gate`] (blocking while `max_concurrency` workers are
//! live), and finally hands the item and the lease to the [`Launcher`].
//! How a worker is actually started is the launcher's business.
//!
//! The gate and the intake queue both watch the invocation's [`CancelToken`],
//! so every wait of the dispatcher ends when it trips. A token found tripped
//! at any point before `run` returns turns the outcome into
//! [`ErrorKind::Cancelled`](crate::error::ErrorKind::Cancelled), including a
//! cancellation raised by the very last worker.

use std::{sync::Arc, thread};

use crate::{
    cancel::CancelToken,
    config::PoolConfig,
    error::{Error, Result},
    gate::{Gate, Lease},
    handle::WorkerHandle,
    intake::{self, Receiver},
};

/// Starts workers for a dispatcher.
pub(crate) trait Launcher<T> {
    /// Starts a worker for `item`. The worker owns `lease` and must drop it
    /// only after firing its completion.
    ///
    /// An `Err` aborts the invocation, so per-item launch problems must be
    /// reported as failures and answered with an already finished handle.
    fn launch(&mut self, id: u64, item: T, lease: Lease) -> Result<WorkerHandle>;

    /// Delivers failure reports that arrived out of band. Must not block.
    fn drain_failures(&mut self) {}

    /// Called once when the invocation ends, successfully or not.
    fn finish(&mut self) {}
}

/// Bookkeeping for one invocation.
pub(crate) struct Dispatcher<'a, L> {
    config: &'a PoolConfig,
    cancel: CancelToken,
    launcher: L,
}

/// What a finished invocation leaves behind.
#[derive(Debug, Default)]
pub(crate) struct DispatchSummary {
    pub dispatched: u64,
    pub live_at_return: usize,
    pub peak: usize,
}

impl<'a, L> Dispatcher<'a, L> {
    pub fn new(config: &'a PoolConfig, cancel: CancelToken, launcher: L) -> Self {
        Dispatcher {
            config,
            cancel,
            launcher,
        }
    }

    /// Runs the invocation to completion (or to the end of dispatch when
    /// `join` is off).
    pub fn run<T, I>(mut self, items: I) -> Result<DispatchSummary>
    where
        L: Launcher<T>,
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send,
    {
        self.config.validate()?;
        let gate = Gate::new(self.config.max_concurrency, &self.cancel);

        let (tx, rx) = intake::bounded::<T>(self.config.max_buffer);
        rx.interrupt_on(&self.cancel);
        let items = items.into_iter();
        let cancel = self.cancel.clone();

        let dispatched = thread::scope(|s| {
            thread::Builder::new()
                .name("boundpool-producer".to_string())
                .spawn_scoped(s, move || {
                    for item in items {
                        if cancel.is_cancelled() || tx.send(item).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| Error::io("spawn producer thread", e))?;

            // `rx` is dropped when the loop returns, which unblocks the
            // producer if dispatch stopped early.
            self.dispatch_loop(&gate, rx)
        });

        let outcome = dispatched.and_then(|dispatched| {
            if self.config.join {
                gate.wait_idle()?;
            }
            if self.cancel.is_cancelled() {
                return Err(Error::cancelled());
            }
            Ok(dispatched)
        });
        self.launcher.drain_failures();
        self.launcher.finish();
        let dispatched = outcome?;

        let summary = DispatchSummary {
            dispatched,
            live_at_return: gate.live(),
            peak: gate.peak(),
        };
        log::debug!(
            "pool invocation done: {} items dispatched, peak concurrency {}, {} still running",
            summary.dispatched,
            summary.peak,
            summary.live_at_return,
        );
        Ok(summary)
    }

    fn dispatch_loop<T>(&mut self, gate: &Arc<Gate>, rx: Receiver<T>) -> Result<u64>
    where
        L: Launcher<T>,
    {
        let mut live: Vec<WorkerHandle> = Vec::new();
        let mut next_id = 0u64;
        loop {
            self.launcher.drain_failures();
            let lease = gate.acquire()?;
            live.retain(|handle| !handle.is_finished());

            let item = rx.recv();
            if self.cancel.is_cancelled() {
                return Err(Error::cancelled());
            }
            let Ok(item) = item else {
                break;
            };

            log::trace!("dispatching item to worker {next_id}");
            let handle = self.launcher.launch(next_id, item, lease)?;
            next_id += 1;
            live.push(handle);
        }
        log::trace!(
            "intake exhausted after {next_id} items, {} workers still live",
            live.iter().filter(|h| !h.is_finished()).count()
        );
        Ok(next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Isolation, handle};
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    /// Runs every item on a plain thread and records what it saw.
    #[derive(Default)]
    struct RecordingLauncher {
        seen: Arc<Mutex<Vec<u32>>>,
        drains: usize,
        finished: bool,
        delay: Duration,
    }

    impl Launcher<u32> for &mut RecordingLauncher {
        fn launch(&mut self, id: u64, item: u32, lease: Lease) -> Result<WorkerHandle> {
            let (handle, completion) = handle::worker(id, Isolation::Thread, true);
            let seen = self.seen.clone();
            let delay = self.delay;
            thread::spawn(move || {
                thread::sleep(delay);
                seen.lock().unwrap().push(item);
                completion.complete();
                lease.release();
            });
            Ok(handle)
        }

        fn drain_failures(&mut self) {
            self.drains += 1;
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn test_dispatches_every_item_in_order() {
        let config = PoolConfig::default().with_max_concurrency(1);
        let mut launcher = RecordingLauncher::default();
        let summary = Dispatcher::new(&config, CancelToken::new(), &mut launcher)
            .run(0..20u32)
            .unwrap();
        assert_eq!(summary.dispatched, 20);
        assert_eq!(summary.live_at_return, 0);
        assert_eq!(summary.peak, 1);
        // With a single slot, dispatch order is completion order.
        assert_eq!(*launcher.seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert!(launcher.drains > 20);
        assert!(launcher.finished);
    }

    #[test]
    fn test_invalid_config_consumes_nothing() {
        let config = PoolConfig::default().with_max_buffer(0);
        let pulled = AtomicUsize::new(0);
        let items = (0..10u32).inspect(|_| {
            pulled.fetch_add(1, Ordering::SeqCst);
        });
        let mut launcher = RecordingLauncher::default();
        let err = Dispatcher::new(&config, CancelToken::new(), &mut launcher)
            .run(items)
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::InvalidArgument { .. }
        ));
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_join_returns_before_workers_finish() {
        let config = PoolConfig::default().with_max_concurrency(4).with_join(false);
        let mut launcher = RecordingLauncher {
            delay: Duration::from_millis(200),
            ..Default::default()
        };
        let summary = Dispatcher::new(&config, CancelToken::new(), &mut launcher)
            .run(0..4u32)
            .unwrap();
        assert_eq!(summary.dispatched, 4);
        assert!(summary.live_at_return > 0);
        assert!(launcher.seen.lock().unwrap().len() < 4);
    }

    #[test]
    fn test_cancel_while_producing_last_item_is_reported() {
        let config = PoolConfig::default();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut launcher = RecordingLauncher::default();
        let err = Dispatcher::new(&config, cancel, &mut launcher)
            .run((0..1u32).inspect(move |_| trigger.cancel()))
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(launcher.finished);
    }

    #[test]
    fn test_cancel_releases_wait_on_slow_source() {
        let config = PoolConfig::default();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.cancel();
        });
        let items = std::iter::once(0u32).chain(std::iter::from_fn(|| {
            thread::sleep(Duration::from_millis(500));
            Some(1)
        }));
        let start = std::time::Instant::now();
        let mut launcher = RecordingLauncher::default();
        let err = Dispatcher::new(&config, cancel, &mut launcher)
            .run(items)
            .unwrap_err();
        assert!(err.is_cancelled());
        // The call still waits for the producer's pending pull, but nothing
        // after the first item is dispatched.
        assert!(start.elapsed() < Duration::from_millis(900));
        assert_eq!(*launcher.seen.lock().unwrap(), vec![0]);
        canceller.join().unwrap();
    }

    #[test]
    fn test_cancelled_token_aborts() {
        let config = PoolConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut launcher = RecordingLauncher::default();
        let err = Dispatcher::new(&config, cancel, &mut launcher)
            .run(0..1_000_000u32)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(launcher.seen.lock().unwrap().is_empty());
        assert!(launcher.finished);
    }
}
