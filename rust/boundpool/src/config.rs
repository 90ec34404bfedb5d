//! Per-invocation pool settings.
//!
//! A [`PoolConfig`] is fixed for the lifetime of one `run` call: the concurrency
//! limit and the buffer sizes never change while items are being dispatched.
//! The struct derives serde traits with `#[serde(default)]`, so a partially
//! specified document (JSON, TOML, environment-backed deserializers) fills the
//! missing fields with the defaults below.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default upper bound on simultaneously live workers.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Default capacity of the intake queue.
pub const DEFAULT_MAX_BUFFER: usize = 200;

/// Default capacity of the failure channel used by process workers.
pub const DEFAULT_FAILURE_BUFFER: usize = 200;

/// The execution context a worker runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// A separate OS process with its own address space.
    Process,
    /// An OS thread sharing the caller's memory.
    Thread,
}

/// Settings for a single pool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of workers alive at the same time. Must be at least 1.
    pub max_concurrency: usize,
    /// How many items may be read ahead of dispatch before the producer blocks.
    /// Must be at least 1.
    pub max_buffer: usize,
    /// Block the caller until every launched worker has finished.
    pub join: bool,
    /// Let the host tear workers down when it exits instead of waiting for them.
    ///
    /// Daemon threads are detached. Daemon processes on Linux are killed as
    /// soon as the thread that called `run` terminates, which for a `join =
    /// false` run started from a short-lived thread is well before the host
    /// process exits. Elsewhere daemon processes simply outlive the host.
    pub daemon: bool,
    /// Capacity of the failure channel (process isolation only). Records that
    /// do not fit are dropped. Must be at least 1.
    pub failure_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_buffer: DEFAULT_MAX_BUFFER,
            join: true,
            daemon: true,
            failure_buffer: DEFAULT_FAILURE_BUFFER,
        }
    }
}

impl PoolConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    pub fn with_join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn with_failure_buffer(mut self, failure_buffer: usize) -> Self {
        self.failure_buffer = failure_buffer;
        self
    }

    /// Checks the bounds of every numeric setting.
    ///
    /// Runs before the first item is pulled from the source, so a bad
    /// configuration never consumes input.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency < 1 {
            return Err(Error::invalid_arg(
                "max_concurrency",
                format!("must be at least 1, got {}", self.max_concurrency),
            ));
        }
        if self.max_buffer < 1 {
            return Err(Error::invalid_arg(
                "max_buffer",
                format!("must be at least 1, got {}", self.max_buffer),
            ));
        }
        if self.failure_buffer < 1 {
            return Err(Error::invalid_arg(
                "failure_buffer",
                format!("must be at least 1, got {}", self.failure_buffer),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.max_buffer, 200);
        assert!(config.join);
        assert!(config.daemon);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = PoolConfig::default()
            .with_max_concurrency(0)
            .validate()
            .unwrap_err();
        match err.kind() {
            ErrorKind::InvalidArgument { name, .. } => assert_eq!(name, "max_concurrency"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_buffers_rejected() {
        assert!(PoolConfig::default().with_max_buffer(0).validate().is_err());
        assert!(
            PoolConfig::default()
                .with_failure_buffer(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: PoolConfig =
            serde_json::from_str(r#"{ "max_concurrency": 12, "join": false }"#).unwrap();
        assert_eq!(config.max_concurrency, 12);
        assert!(!config.join);
        assert_eq!(config.max_buffer, DEFAULT_MAX_BUFFER);
        assert!(config.daemon);
    }

    #[test]
    fn test_isolation_names() {
        let isolation: Isolation = serde_json::from_str(r#""process""#).unwrap();
        assert_eq!(isolation, Isolation::Process);
        assert_eq!(
            serde_json::to_string(&Isolation::Thread).unwrap(),
            r#""thread""#
        );
    }
}
