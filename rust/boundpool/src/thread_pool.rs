//! Thread-isolated pool.
//!
//! Every item runs on a fresh OS thread named `boundpool-worker-<id>`, which
//! exits as soon as the task returns. Task failures and panics are contained
//! on that thread and reported to the pool's [`FailureSink`] right where they
//! are captured; only a [`Cancelled`](crate::cancel::Cancelled) failure
//! escapes, by tripping the invocation's [`CancelToken`].

use std::{sync::Arc, thread};

use crate::{
    cancel::CancelToken,
    config::{Isolation, PoolConfig},
    dispatcher::{Dispatcher, Launcher},
    error::{Error, Result},
    failure::{FailureSink, LogSink},
    gate::Lease,
    handle::{self, WorkerHandle},
    shutdown,
    worker::{self, TaskError},
};

/// A bounded pool of short-lived worker threads.
///
/// The pool object only holds settings; each [`run`](Self::run) call builds
/// its own queue, gate and worker set, so one `ThreadPool` can serve several
/// invocations (even concurrently from different threads) without them
/// interfering.
///
/// ```rust
/// use boundpool::{PoolConfig, ThreadPool};
///
/// let pool = ThreadPool::new(PoolConfig::default().with_max_concurrency(2));
/// pool.run(0..10u32, |n| {
///     if n == 7 { Err("seven is not allowed") } else { Ok(()) }
/// })
/// .unwrap();
/// ```
#[derive(Clone)]
pub struct ThreadPool {
    config: PoolConfig,
    sink: Arc<dyn FailureSink>,
    cancel: CancelToken,
}

impl ThreadPool {
    /// Creates a pool that logs failures through [`LogSink`].
    pub fn new(config: PoolConfig) -> ThreadPool {
        ThreadPool {
            config,
            sink: Arc::new(LogSink),
            cancel: CancelToken::new(),
        }
    }

    /// Routes failure records to `sink` instead of the log.
    pub fn with_sink(mut self, sink: impl FailureSink + 'static) -> ThreadPool {
        self.sink = Arc::new(sink);
        self
    }

    /// Uses `cancel` as the interrupt signal of every invocation.
    ///
    /// Cancelling it stops all invocations of this pool. A worker returning
    /// [`Cancelled`](crate::cancel::Cancelled) only stops its own invocation
    /// and leaves `cancel` untouched.
    pub fn with_cancel(mut self, cancel: CancelToken) -> ThreadPool {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `func` once for every item of `items`.
    ///
    /// Returns `Ok(())` even if some items failed; those failures went to the
    /// sink. Returns an error only for an invalid configuration, for a
    /// cancellation, or when a worker thread cannot be spawned.
    pub fn run<T, I, F, E>(&self, items: I, func: F) -> Result<()>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send,
        F: Fn(T) -> Result<(), E> + Send + Sync + 'static,
        E: Into<TaskError>,
    {
        let cancel = self.cancel.child();
        let launcher = ThreadLauncher {
            func: Arc::new(func),
            sink: self.sink.clone(),
            cancel: cancel.clone(),
            daemon: self.config.daemon,
        };
        Dispatcher::new(&self.config, cancel, launcher)
            .run(items)
            .map(|_| ())
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        ThreadPool::new(PoolConfig::default())
    }
}

/// Runs `func` for every item on a fresh thread pool built from `config`,
/// reporting failures through the `log` facade.
pub fn run_threads<T, I, F, E>(items: I, func: F, config: PoolConfig) -> Result<()>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send,
    F: Fn(T) -> Result<(), E> + Send + Sync + 'static,
    E: Into<TaskError>,
{
    ThreadPool::new(config).run(items, func)
}

struct ThreadLauncher<F> {
    func: Arc<F>,
    sink: Arc<dyn FailureSink>,
    cancel: CancelToken,
    daemon: bool,
}

impl<T, F, E> Launcher<T> for ThreadLauncher<F>
where
    T: Send + 'static,
    F: Fn(T) -> Result<(), E> + Send + Sync + 'static,
    E: Into<TaskError>,
{
    fn launch(&mut self, id: u64, item: T, lease: Lease) -> Result<WorkerHandle> {
        let (handle, completion) = handle::worker(id, Isolation::Thread, self.daemon);
        let registration = shutdown::register_unless_daemon(self.daemon);
        let func = self.func.clone();
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();

        thread::Builder::new()
            .name(format!("boundpool-worker-{id}"))
            .spawn(move || {
                let _registration = registration;
                if let Some(record) = worker::execute(|| func(item)) {
                    let record = record.with_worker(id);
                    sink.report(&record);
                    if record.is_cancellation() {
                        cancel.cancel();
                    }
                }
                completion.complete();
                lease.release();
            })
            .map_err(|e| Error::io(format!("spawn worker thread {id}"), e))?;

        Ok(handle)
    }
}
