use std::path::PathBuf;

use thiserror::Error;

use crate::creator::BuildState;

/// Error type for segment storage, segment creation and query execution.
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Row, column, dictionary id or bit offset beyond the bounds of a segment structure.
    /// Always a caller bug; never retried.
    #[error("Out of range: {what} {index} (bound {bound})")]
    OutOfRange {
        what: &'static str,
        index: u64,
        bound: u64,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Checksum mismatch or malformed header. The whole segment is rejected.
    #[error("Corrupt segment: {details}")]
    CorruptSegment {
        details: String,
        path: Option<PathBuf>,
    },

    /// Segment creation aborted before publish. Nothing is visible under the final name.
    #[error("Segment build failed during {stage}: {reason}")]
    BuildFailure { stage: BuildState, reason: String },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Invalid value for column {column}: {details}")]
    InvalidValue { column: String, details: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuarryError {
    pub(crate) fn corrupt(details: impl Into<String>, path: &std::path::Path) -> Self {
        QuarryError::CorruptSegment {
            details: details.into(),
            path: Some(path.to_path_buf()),
        }
    }

    pub(crate) fn out_of_range(what: &'static str, index: u64, bound: u64) -> Self {
        QuarryError::OutOfRange { what, index, bound }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for QuarryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        QuarryError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
