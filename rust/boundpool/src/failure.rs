//! Failure records, the sinks that receive them, and the failure channel.
//!
//! A [`FailureRecord`] is what is left of a task error once it has been
//! captured by a worker: a kind, the rendered message and its source chain.
//! Records are plain data so they can be encoded with bincode and carried out
//! of a worker process.
//!
//! Records end up in a [`FailureSink`]. The default sink, [`LogSink`], writes
//! one `log::error!` line per record; callers that own their logging (or
//! tests) inject their own sink instead.
//!
//! Process workers cannot report into the caller's sink directly. Their
//! watchers publish into a bounded [`channel`] that the dispatcher drains
//! between dispatch cycles. Publishing never blocks: when the channel is full
//! the record is dropped and counted. Items are never dropped this way, only
//! the reports about them.

use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{TryRecvError, TrySendError},
    },
};

use bincode::{Decode, Encode};

use crate::{
    cancel::Cancelled,
    intake::{self, Receiver, Sender},
};

/// Category of a captured failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum FailureKind {
    /// The task returned an error.
    Error,
    /// The task panicked.
    Panic,
    /// The task asked for the whole invocation to be cancelled.
    Cancelled,
    /// A worker process exited without producing a result.
    Abnormal,
    /// The worker could not be started for this item.
    Launch,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Abnormal => "abnormal exit",
            FailureKind::Launch => "launch failure",
        };
        f.write_str(name)
    }
}

/// The captured form of one item's failure.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// `Display` of the top-level error (or the panic payload).
    pub message: String,
    /// `Display` of each error in the source chain, outermost first.
    pub causes: Vec<String>,
    /// Id of the worker that produced the record, when known.
    pub worker: Option<u64>,
    /// Exit code of the worker process, when there was one.
    pub exit_code: Option<i32>,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> FailureRecord {
        FailureRecord {
            kind,
            message: message.into(),
            causes: Vec::new(),
            worker: None,
            exit_code: None,
        }
    }

    /// Captures `err` and its source chain. The record is of kind
    /// [`FailureKind::Cancelled`] if [`Cancelled`] appears anywhere in the
    /// chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> FailureRecord {
        let chain = std::iter::successors(Some(err), |e| e.source());
        let mut cancelled = false;
        let mut causes = Vec::new();
        for (i, e) in chain.enumerate() {
            cancelled |= e.is::<Cancelled>();
            if i > 0 {
                causes.push(e.to_string());
            }
        }
        let kind = if cancelled {
            FailureKind::Cancelled
        } else {
            FailureKind::Error
        };
        FailureRecord {
            causes,
            ..FailureRecord::new(kind, err.to_string())
        }
    }

    /// Captures a panic payload as returned by `catch_unwind`.
    pub fn from_panic(payload: &(dyn Any + Send)) -> FailureRecord {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        FailureRecord::new(FailureKind::Panic, message)
    }

    pub fn with_worker(mut self, worker: u64) -> FailureRecord {
        self.worker = Some(worker);
        self
    }

    /// Appends `cause` to the source chain.
    pub fn with_cause(mut self, cause: impl Into<String>) -> FailureRecord {
        self.causes.push(cause.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> FailureRecord {
        self.exit_code = exit_code;
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }

    /// Encodes the record for transfer out of a worker process.
    pub fn to_vec(&self) -> std::io::Result<Vec<u8>> {
        bincode::encode_to_vec(self, binc_config()).map_err(std::io::Error::other)
    }

    /// Decodes a record produced by [`to_vec`](Self::to_vec).
    pub fn from_slice(slice: &[u8]) -> std::io::Result<FailureRecord> {
        bincode::decode_from_slice(slice, binc_config())
            .map_err(std::io::Error::other)
            .map(|(record, _)| record)
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(worker) = self.worker {
            write!(f, "worker {worker}: ")?;
        }
        write!(f, "{}: {}", self.kind, self.message)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        Ok(())
    }
}

/// The bincode configuration shared by records and process payloads.
pub(crate) fn binc_config() -> impl bincode::config::Config {
    bincode::config::standard()
}

/// Receives captured failures.
///
/// Thread workers call the sink from their own thread; process failures are
/// delivered on the dispatcher's thread. Implementations must therefore be
/// thread-safe.
pub trait FailureSink: Send + Sync {
    fn report(&self, record: &FailureRecord);
}

impl<F> FailureSink for F
where
    F: Fn(&FailureRecord) + Send + Sync,
{
    fn report(&self, record: &FailureRecord) {
        self(record)
    }
}

/// Default sink: one `log::error!` line per record, target `boundpool`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl FailureSink for LogSink {
    fn report(&self, record: &FailureRecord) {
        log::error!(target: "boundpool", "{record}");
    }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<FailureRecord>>>);

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FailureRecord>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FailureSink for MemorySink {
    fn report(&self, record: &FailureRecord) {
        self.lock().push(record.clone());
    }
}

/// Creates a failure channel holding at most `capacity` undelivered records.
pub(crate) fn channel(capacity: usize) -> (FailureReporter, FailureDrain) {
    let (tx, rx) = intake::bounded(capacity);
    let dropped = Arc::new(AtomicUsize::new(0));
    (
        FailureReporter {
            tx,
            dropped: dropped.clone(),
        },
        FailureDrain { rx, dropped },
    )
}

/// Publishing side of the failure channel, one clone per process watcher.
#[derive(Clone)]
pub(crate) struct FailureReporter {
    tx: Sender<FailureRecord>,
    dropped: Arc<AtomicUsize>,
}

impl FailureReporter {
    /// Best-effort publish. Returns `false` if the record was dropped because
    /// the channel was full or nobody drains it any more.
    pub fn publish(&self, record: FailureRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) | Err(TrySendError::Disconnected(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("failure record dropped: {record}");
                false
            }
        }
    }
}

/// Dispatcher side of the failure channel.
pub(crate) struct FailureDrain {
    rx: Receiver<FailureRecord>,
    dropped: Arc<AtomicUsize>,
}

impl FailureDrain {
    /// Hands every record buffered right now to `sink`; returns how many
    /// were delivered. Never blocks.
    pub fn drain(&self, sink: &dyn FailureSink) -> usize {
        let mut delivered = 0;
        loop {
            match self.rx.try_recv() {
                Ok(record) => {
                    sink.report(&record);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        delivered
    }

    /// Number of records lost so far because the channel was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("could not process item")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[derive(Debug)]
    struct Aborted(Cancelled);

    impl std::fmt::Display for Aborted {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("shutting down")
        }
    }

    impl std::error::Error for Aborted {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_record_from_error_chain() {
        let err = Outer(std::io::Error::other("disk full"));
        let record = FailureRecord::from_error(&err).with_worker(4);
        assert_eq!(record.kind, FailureKind::Error);
        assert_eq!(record.message, "could not process item");
        assert_eq!(record.causes, vec!["disk full".to_string()]);
        assert_eq!(
            record.to_string(),
            "worker 4: error: could not process item: disk full"
        );
    }

    #[test]
    fn test_cancelled_detected_in_chain() {
        assert!(FailureRecord::from_error(&Cancelled).is_cancellation());
        assert!(FailureRecord::from_error(&Aborted(Cancelled)).is_cancellation());
        let plain = std::io::Error::other("nope");
        assert!(!FailureRecord::from_error(&plain).is_cancellation());
    }

    #[test]
    fn test_record_from_panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(FailureRecord::from_panic(payload.as_ref()).message, "static message");

        let payload: Box<dyn Any + Send> = Box::new(format!("item {}", 3));
        let record = FailureRecord::from_panic(payload.as_ref());
        assert_eq!(record.kind, FailureKind::Panic);
        assert_eq!(record.message, "item 3");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(
            FailureRecord::from_panic(payload.as_ref()).message,
            "panic with a non-string payload"
        );
    }

    #[test]
    fn test_record_survives_encoding() {
        let record = FailureRecord::new(FailureKind::Abnormal, "signal: 9")
            .with_worker(12)
            .with_exit_code(Some(137));
        let bytes = record.to_vec().unwrap();
        assert_eq!(FailureRecord::from_slice(&bytes).unwrap(), record);
        assert!(FailureRecord::from_slice(&bytes[..1]).is_err());
    }

    #[test]
    fn test_channel_drops_when_full() {
        let (reporter, drain) = channel(2);
        for i in 0..5 {
            reporter.publish(FailureRecord::new(FailureKind::Error, format!("e{i}")));
        }
        assert_eq!(drain.dropped(), 3);

        let sink = MemorySink::new();
        assert_eq!(drain.drain(&sink), 2);
        let messages: Vec<_> = sink.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["e0", "e1"]);

        assert!(reporter.publish(FailureRecord::new(FailureKind::Error, "e5")));
        assert_eq!(drain.drain(&sink), 1);
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_publish_after_drain_gone_is_dropped() {
        let (reporter, drain) = channel(4);
        let dropped = drain.dropped.clone();
        drop(drain);
        assert!(!reporter.publish(FailureRecord::new(FailureKind::Error, "late")));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_closure_sink() {
        let count = AtomicUsize::new(0);
        let sink = |_: &FailureRecord| {
            count.fetch_add(1, Ordering::SeqCst);
        };
        sink.report(&FailureRecord::new(FailureKind::Panic, "boom"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
