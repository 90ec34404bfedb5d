//! The per-item execution wrapper shared by both isolation kinds.

use std::panic::{self, AssertUnwindSafe};

use crate::failure::FailureRecord;

/// Error type tasks may return. Anything convertible into it works, which
/// covers `std::io::Error`, `String`, `&str` and every `Error + Send + Sync`.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Runs one task invocation, containing its failure.
///
/// Returns `None` when the task succeeded, otherwise the captured record:
/// an error becomes a [`FailureKind::Error`](crate::failure::FailureKind::Error)
/// (or `Cancelled`, see [`FailureRecord::from_error`]), a panic becomes a
/// [`FailureKind::Panic`](crate::failure::FailureKind::Panic). Nothing
/// escapes to the caller.
pub fn execute<F, E>(task: F) -> Option<FailureRecord>
where
    F: FnOnce() -> Result<(), E>,
    E: Into<TaskError>,
{
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            let err: TaskError = err.into();
            Some(FailureRecord::from_error(err.as_ref()))
        }
        Err(payload) => Some(FailureRecord::from_panic(payload.as_ref())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cancel::Cancelled, failure::FailureKind};

    #[test]
    fn test_success_has_no_record() {
        assert!(execute(|| Ok::<(), std::io::Error>(())).is_none());
    }

    #[test]
    fn test_error_is_captured() {
        let record = execute(|| Err("bad item")).unwrap();
        assert_eq!(record.kind, FailureKind::Error);
        assert_eq!(record.message, "bad item");
    }

    #[test]
    fn test_panic_is_captured() {
        let record = execute(|| -> Result<(), TaskError> { panic!("worker blew up") }).unwrap();
        assert_eq!(record.kind, FailureKind::Panic);
        assert_eq!(record.message, "worker blew up");
    }

    #[test]
    fn test_cancellation_is_classified() {
        let record = execute(|| Err(Cancelled)).unwrap();
        assert!(record.is_cancellation());

        #[derive(Debug, thiserror::Error)]
        #[error("stopping early")]
        struct Stopping(#[source] Cancelled);

        let record = execute(|| Err(Stopping(Cancelled))).unwrap();
        assert_eq!(record.kind, FailureKind::Cancelled);
        assert_eq!(record.causes, vec!["operation cancelled".to_string()]);
    }
}
