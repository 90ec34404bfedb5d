//! Bounded-concurrency execution of independent work items.
//!
//! This crate runs a function over a (possibly unbounded) stream of items
//! with at most `max_concurrency` workers alive at any moment and at most
//! `max_buffer` items read ahead of them. Each item gets a short-lived worker
//! of its own, either a thread or a child process. A failing item never stops
//! the others: its error, panic or abnormal exit is captured as a
//! [`FailureRecord`] and handed to a [`FailureSink`]. Only a task returning
//! [`Cancelled`] aborts the whole invocation.
//!
//! # Key Components
//!
//! ## Pools
//!
//! - [`ThreadPool`] / [`run_threads`] - one OS thread per item, for any
//!   `Fn(T) -> Result<(), E>` closure
//! - [`ProcessPool`] / [`run_processes`] - one child process per item, for
//!   tasks registered in a [`WorkerRegistry`]
//!
//! ## Configuration and Control
//!
//! - [`PoolConfig`] - bounds, join and daemon policy; serde-friendly
//! - [`CancelToken`] - interrupts a running invocation from any thread
//! - [`shutdown`] - waits for non-daemon workers before the program exits
//!
//! ## Failures
//!
//! - [`FailureRecord`] - the captured form of one item's failure
//! - [`LogSink`] (default) and [`MemorySink`] - ready-made sinks
//!
//! ## Building Blocks
//!
//! - [`intake`] - the bounded blocking queue between producer and dispatcher
//! - [`worker::execute`] - runs one task and captures its failure
//! - [`WorkerHandle`] - completion handle of a single worker

pub mod cancel;
pub mod config;
pub(crate) mod dispatcher;
pub mod error;
pub mod failure;
pub(crate) mod gate;
pub mod handle;
pub mod intake;
pub mod process_pool;
pub mod shutdown;
pub mod thread_pool;
pub mod worker;

pub use cancel::{CancelToken, Cancelled};
pub use config::{Isolation, PoolConfig};
pub use error::{Error, ErrorKind, Result};
pub use failure::{FailureKind, FailureRecord, FailureSink, LogSink, MemorySink};
pub use handle::WorkerHandle;
pub use process_pool::{ProcessPool, ProcessTask, WorkerRegistry, run_processes};
pub use thread_pool::{ThreadPool, run_threads};
pub use worker::TaskError;
