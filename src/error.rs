//! # Error Taxonomy
//!
//! All fallible operations return `eyre::Result`. Failures that callers need
//! to react to programmatically carry a [`StoreError`] with a stable
//! [`ErrorCode`]; everything else is plain context. Use
//! [`StoreError::code_of`] to extract the code from a report.
//!
//! Corruption and format errors are fatal to the operation that produced
//! them; the store refuses to open over a corrupt header. Lock timeouts are
//! recoverable and expected under row contention. A concurrent writer on the
//! same map is a programming error and surfaces immediately.

/// Stable failure codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    /// A header checksum failed, a page position points outside the file, or
    /// a chunk entry is missing.
    #[error("FILE_CORRUPT")]
    FileCorrupt,
    /// The file was written by a newer format than this build supports.
    #[error("UNSUPPORTED_FORMAT")]
    UnsupportedFormat,
    /// The store is read-only or a write could not be performed.
    #[error("WRITING_FAILED")]
    WritingFailed,
    /// The store or map has been closed.
    #[error("CLOSED")]
    Closed,
    /// An internal invariant was violated.
    #[error("INTERNAL")]
    Internal,
    /// A transactional write could not acquire the row within the lock
    /// timeout.
    #[error("LOCK_TIMEOUT")]
    LockTimeout,
    /// A rollback or snapshot was requested for a version that is not
    /// retained.
    #[error("UNKNOWN_VERSION")]
    UnknownVersion,
    /// A second writer was detected on a map while a write was in progress.
    #[error("CONCURRENT_MODIFICATION")]
    ConcurrentModification,
}

/// A coded failure. Constructed through [`StoreError::new`] and carried
/// inside an `eyre::Report`.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StoreError {
    pub code: ErrorCode,
    pub message: String,
}

impl StoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> eyre::Report {
        eyre::Report::new(StoreError {
            code,
            message: message.into(),
        })
    }

    /// Extracts the error code from a report, if it carries one.
    pub fn code_of(report: &eyre::Report) -> Option<ErrorCode> {
        report.downcast_ref::<StoreError>().map(|e| e.code)
    }
}

/// Shorthand for `return Err(StoreError::new(code, format!(...)))`.
macro_rules! store_bail {
    ($code:expr, $($arg:tt)*) => {
        return Err($crate::error::StoreError::new($code, format!($($arg)*)))
    };
}

pub(crate) use store_bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_survives_round_trip_through_report() {
        let report = StoreError::new(ErrorCode::LockTimeout, "row is locked");

        assert_eq!(StoreError::code_of(&report), Some(ErrorCode::LockTimeout));
        assert!(report.to_string().contains("LOCK_TIMEOUT"));
    }

    #[test]
    fn plain_reports_have_no_code() {
        let report = eyre::eyre!("some io problem");

        assert_eq!(StoreError::code_of(&report), None);
    }

    #[test]
    fn store_bail_returns_coded_error() {
        fn failing() -> eyre::Result<()> {
            store_bail!(ErrorCode::UnknownVersion, "version {} not stored", 42);
        }

        let err = failing().unwrap_err();
        assert_eq!(StoreError::code_of(&err), Some(ErrorCode::UnknownVersion));
        assert!(err.to_string().contains("42"));
    }
}
