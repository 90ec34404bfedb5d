//! Process-isolated pool.
//!
//! Each item runs in its own child process, so a task that corrupts memory,
//! aborts or leaks cannot take the caller down with it. Rust cannot ship a
//! closure into another process, so tasks are named: a [`ProcessTask`]
//! implementation is registered in a [`WorkerRegistry`] in the worker
//! program's `main`, and the pool launches that program once per item.
//!
//! ```rust,no_run
//! use boundpool::{PoolConfig, ProcessPool, ProcessTask, WorkerRegistry};
//!
//! struct Touch;
//!
//! impl ProcessTask for Touch {
//!     const NAME: &'static str = "touch";
//!     type Item = std::path::PathBuf;
//!     type Error = std::io::Error;
//!
//!     fn run(path: Self::Item) -> std::io::Result<()> {
//!         std::fs::write(path, "")
//!     }
//! }
//!
//! fn main() -> boundpool::Result<()> {
//!     // Returns only in the parent; a worker launch exits inside this call.
//!     WorkerRegistry::new().register::<Touch>().run_if_worker();
//!
//!     let files = ["/tmp/a", "/tmp/b"].map(std::path::PathBuf::from);
//!     ProcessPool::new(PoolConfig::default()).run::<Touch, _>(files)
//! }
//! ```
//!
//! ## Worker protocol
//!
//! The parent starts the worker program with two environment variables:
//! [`WORKER_TASK_ENV`] names the task and [`RESULT_PATH_ENV`] names a scratch
//! file for the failure record. The item is written to the child's stdin
//! (bincode, serde encoding) and stdin is closed. A child that fails writes
//! the encoded [`FailureRecord`] to the scratch file and exits with
//! [`EXIT_FAILED`]. A child that dies without a record is reported as
//! [`FailureKind::Abnormal`] with its exit status.
//!
//! On the parent side one watcher thread per child feeds stdin, waits for
//! the exit and publishes any record on the failure channel, which the
//! dispatcher drains between dispatch cycles. The channel is best-effort: if
//! `failure_buffer` records are already waiting, further records are dropped
//! (and counted). A `Cancelled` record is never lost, because the watcher
//! trips the invocation's own [`CancelToken`] itself.

use std::{
    any::TypeId,
    collections::HashMap,
    ffi::OsString,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    cancel::CancelToken,
    config::{Isolation, PoolConfig},
    dispatcher::{Dispatcher, Launcher},
    error::{Error, Result},
    failure::{
        self, FailureDrain, FailureKind, FailureRecord, FailureReporter, FailureSink, LogSink,
        binc_config,
    },
    gate::Lease,
    handle::{self, WorkerHandle},
    shutdown,
    worker::{self, TaskError},
};

/// Names the registered task a worker process must run.
pub const WORKER_TASK_ENV: &str = "BOUNDPOOL_WORKER_TASK";

/// Path of the file a failing worker writes its record to.
pub const RESULT_PATH_ENV: &str = "BOUNDPOOL_RESULT_PATH";

/// Exit code of a worker that processed its item successfully.
pub const EXIT_OK: i32 = 0;

/// Exit code of a worker that wrote a failure record.
pub const EXIT_FAILED: i32 = 70;

/// A task that can run inside a worker process.
pub trait ProcessTask: 'static {
    /// Identifies the task between parent and worker. Must be unique within
    /// a [`WorkerRegistry`].
    const NAME: &'static str;

    /// The work item, shipped to the worker through serde.
    type Item: Serialize + DeserializeOwned + Send + 'static;

    type Error: Into<TaskError>;

    fn run(item: Self::Item) -> Result<(), Self::Error>;
}

type TaskEntry = fn(&[u8]) -> Option<FailureRecord>;

/// The worker-side dispatch table.
///
/// Build it at the very top of the worker program's `main` and call
/// [`run_if_worker`](Self::run_if_worker) before doing anything else.
#[derive(Default)]
pub struct WorkerRegistry {
    tasks: HashMap<&'static str, (TypeId, TaskEntry)>,
}

impl WorkerRegistry {
    pub fn new() -> WorkerRegistry {
        WorkerRegistry::default()
    }

    /// Adds `P` to the table.
    ///
    /// # Panics
    ///
    /// Panics if a different task with the same name is already registered.
    pub fn register<P: ProcessTask>(mut self) -> WorkerRegistry {
        let task = TypeId::of::<P>();
        let entry: TaskEntry = run_entry::<P>;
        let previous = self.tasks.insert(P::NAME, (task, entry));
        assert!(
            previous.is_none_or(|(previous, _)| previous == task),
            "task name '{}' registered twice",
            P::NAME
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Serves one item if this process was launched as a worker.
    ///
    /// Returns `None` in an ordinary process. In a worker process, reads the
    /// item from stdin, runs the task, stores any failure record and returns
    /// the exit code the process should terminate with.
    pub fn serve_worker(&self) -> Option<i32> {
        let name = std::env::var(WORKER_TASK_ENV).ok()?;
        let result_path = std::env::var_os(RESULT_PATH_ENV).map(PathBuf::from);

        let record = match self.tasks.get(name.as_str()) {
            Some((_, entry)) => {
                let mut payload = Vec::new();
                match std::io::stdin().lock().read_to_end(&mut payload) {
                    Ok(_) => entry(&payload),
                    Err(e) => Some(FailureRecord {
                        kind: FailureKind::Launch,
                        ..FailureRecord::from_error(&e)
                    }),
                }
            }
            None => Some(FailureRecord::new(
                FailureKind::Launch,
                format!("no task named '{name}' is registered in this worker program"),
            )),
        };

        let Some(record) = record else {
            return Some(EXIT_OK);
        };
        if let Err(e) = store_record(&record, result_path.as_deref()) {
            log::error!("worker could not store its failure record ({record}): {e}");
        }
        Some(EXIT_FAILED)
    }

    /// Like [`serve_worker`](Self::serve_worker), but terminates the process
    /// with the worker's exit code instead of returning it.
    pub fn run_if_worker(&self) {
        if let Some(code) = self.serve_worker() {
            std::process::exit(code);
        }
    }
}

/// Decodes one item and runs `P` on it.
fn run_entry<P: ProcessTask>(payload: &[u8]) -> Option<FailureRecord> {
    match bincode::serde::decode_from_slice::<P::Item, _>(payload, binc_config()) {
        Ok((item, _)) => worker::execute(|| P::run(item)),
        Err(e) => Some(
            FailureRecord::new(
                FailureKind::Launch,
                format!("could not decode work item for task '{}'", P::NAME),
            )
            .with_cause(e.to_string()),
        ),
    }
}

fn store_record(record: &FailureRecord, path: Option<&Path>) -> std::io::Result<()> {
    let path = path.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{RESULT_PATH_ENV} is not set"),
        )
    })?;
    std::fs::write(path, record.to_vec()?)
}

/// A bounded pool of short-lived worker processes.
///
/// By default the worker program is the current executable, which must call
/// [`WorkerRegistry::run_if_worker`] early in `main`. Use
/// [`program`](Self::program) to launch a different binary.
///
/// With `daemon = true` on Linux, workers are killed when the thread that
/// launched them (the thread calling [`run`](Self::run)) terminates, not when
/// the process does. Call `run` from a thread that lives at least as long as
/// the workers should, or use `daemon = false` and
/// [`shutdown::wait_for_workers`](crate::shutdown::wait_for_workers) to keep
/// them alive past the calling thread.
#[derive(Clone)]
pub struct ProcessPool {
    config: PoolConfig,
    program: Option<PathBuf>,
    args: Vec<OsString>,
    sink: Arc<dyn FailureSink>,
    cancel: CancelToken,
}

impl ProcessPool {
    pub fn new(config: PoolConfig) -> ProcessPool {
        ProcessPool {
            config,
            program: None,
            args: Vec::new(),
            sink: Arc::new(LogSink),
            cancel: CancelToken::new(),
        }
    }

    /// Launches `program` instead of the current executable.
    pub fn program(mut self, program: impl Into<PathBuf>) -> ProcessPool {
        self.program = Some(program.into());
        self
    }

    /// Appends a command-line argument passed to every worker.
    pub fn arg(mut self, arg: impl Into<OsString>) -> ProcessPool {
        self.args.push(arg.into());
        self
    }

    pub fn with_sink(mut self, sink: impl FailureSink + 'static) -> ProcessPool {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> ProcessPool {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Runs task `P` once for every item, each in its own process.
    ///
    /// Failures of individual items are delivered to the sink and do not
    /// fail the call.
    pub fn run<P, I>(&self, items: I) -> Result<()>
    where
        P: ProcessTask,
        I: IntoIterator<Item = P::Item>,
        I::IntoIter: Send,
    {
        self.config.validate()?;
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| Error::io("resolve the current executable", e))?,
        };
        let (reporter, drain) = failure::channel(self.config.failure_buffer);
        let cancel = self.cancel.child();
        let launcher = ProcessLauncher::<P> {
            program,
            args: self.args.clone(),
            daemon: self.config.daemon,
            sink: self.sink.clone(),
            cancel: cancel.clone(),
            reporter,
            drain,
            _task: std::marker::PhantomData,
        };
        Dispatcher::new(&self.config, cancel, launcher)
            .run(items)
            .map(|_| ())
    }
}

/// Runs task `P` for every item in worker processes of the current
/// executable, reporting failures through the `log` facade.
pub fn run_processes<P, I>(items: I, config: PoolConfig) -> Result<()>
where
    P: ProcessTask,
    I: IntoIterator<Item = P::Item>,
    I::IntoIter: Send,
{
    ProcessPool::new(config).run::<P, I>(items)
}

struct ProcessLauncher<P> {
    program: PathBuf,
    args: Vec<OsString>,
    daemon: bool,
    sink: Arc<dyn FailureSink>,
    cancel: CancelToken,
    reporter: FailureReporter,
    drain: FailureDrain,
    _task: std::marker::PhantomData<fn(P)>,
}

impl<P: ProcessTask> ProcessLauncher<P> {
    fn command(&self, result_path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(WORKER_TASK_ENV, P::NAME)
            .env(RESULT_PATH_ENV, result_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if self.daemon {
            kill_with_parent(&mut command);
        }
        command
    }

    /// Reports a failure that happened before a worker existed and returns
    /// the handle standing in for it.
    fn launch_failed(&self, id: u64, what: &str, err: impl std::fmt::Display) -> WorkerHandle {
        let record = FailureRecord::new(FailureKind::Launch, format!("could not {what}"))
            .with_cause(err.to_string())
            .with_worker(id);
        self.sink.report(&record);
        WorkerHandle::finished(id, Isolation::Process, self.daemon)
    }
}

impl<P: ProcessTask> Launcher<P::Item> for ProcessLauncher<P> {
    fn launch(&mut self, id: u64, item: P::Item, lease: Lease) -> Result<WorkerHandle> {
        let payload = match bincode::serde::encode_to_vec(&item, binc_config()) {
            Ok(payload) => payload,
            Err(e) => return Ok(self.launch_failed(id, "encode the work item", e)),
        };
        let result_file = match tempfile::Builder::new()
            .prefix("boundpool-")
            .suffix(".result")
            .tempfile()
        {
            Ok(file) => file,
            Err(e) => return Ok(self.launch_failed(id, "create the result file", e)),
        };
        let child = match self.command(result_file.path()).spawn() {
            Ok(child) => child,
            Err(e) => return Ok(self.launch_failed(id, "start the worker process", e)),
        };
        log::trace!("worker {id} started as process {}", child.id());

        let (handle, completion) = handle::worker(id, Isolation::Process, self.daemon);
        let registration = shutdown::register_unless_daemon(self.daemon);
        let reporter = self.reporter.clone();
        let cancel = self.cancel.clone();

        // If this spawn fails the child is orphaned with a closed stdin; it
        // fails to decode an item and exits on its own.
        thread::Builder::new()
            .name(format!("boundpool-watch-{id}"))
            .spawn(move || {
                let _registration = registration;
                if let Some(record) = watch(child, &payload, result_file.path()) {
                    let record = record.with_worker(id);
                    let cancelled = record.is_cancellation();
                    reporter.publish(record);
                    if cancelled {
                        cancel.cancel();
                    }
                }
                drop(result_file);
                completion.complete();
                lease.release();
            })
            .map_err(|e| Error::io(format!("spawn watcher thread {id}"), e))?;

        Ok(handle)
    }

    fn drain_failures(&mut self) {
        self.drain.drain(self.sink.as_ref());
    }

    fn finish(&mut self) {
        let dropped = self.drain.dropped();
        if dropped > 0 {
            log::warn!("{dropped} failure records were dropped: the failure channel was full");
        }
    }
}

/// Feeds the item to the child, waits for it and collects its outcome.
fn watch(mut child: Child, payload: &[u8], result_path: &Path) -> Option<FailureRecord> {
    if let Some(mut stdin) = child.stdin.take() {
        // A child that dies before reading its input breaks the pipe; its
        // exit status is what gets reported.
        if let Err(e) = stdin.write_all(payload) {
            log::debug!("could not hand the item to worker process {}: {e}", child.id());
        }
    }

    let status = match child.wait() {
        Ok(status) => status,
        Err(e) => {
            return Some(FailureRecord {
                kind: FailureKind::Abnormal,
                ..FailureRecord::from_error(&e)
            });
        }
    };

    match std::fs::read(result_path) {
        Ok(bytes) if !bytes.is_empty() => match FailureRecord::from_slice(&bytes) {
            Ok(record) => return Some(record.with_exit_code(status.code())),
            Err(e) => log::warn!("discarding unreadable failure record: {e}"),
        },
        Ok(_) => {}
        Err(e) => log::debug!("could not read failure record: {e}"),
    }

    if status.success() {
        None
    } else {
        Some(
            FailureRecord::new(
                FailureKind::Abnormal,
                format!("worker process ended without a result ({status})"),
            )
            .with_exit_code(status.code()),
        )
    }
}

/// Makes the kernel SIGKILL the child when the spawning thread exits.
#[cfg(target_os = "linux")]
fn kill_with_parent(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the hook runs between fork and exec and only issues prctl,
    // which is async-signal-safe and touches no parent memory.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_with_parent(_command: &mut Command) {}
