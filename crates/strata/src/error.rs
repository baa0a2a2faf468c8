//! Error and Result types for Strata storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for Strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// The error type for Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    /// The series schema is malformed or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The series schema file could not be parsed.
    #[error("Schema parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A block or packed word could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The decoder hit a fatal error earlier and must be re-attached.
    #[error("Decoder is in error state: {0}")]
    DecoderFailed(String),

    /// Block was written with a format version this build cannot read.
    #[error("Unsupported block version: {0}")]
    UnsupportedVersion(u8),

    /// A block write did not write the full block.
    #[error("Partial block write to {path}: wrote {written} of {expected} bytes")]
    PartialWrite {
        /// Data file that received the partial write.
        path: PathBuf,
        /// Bytes actually written.
        written: usize,
        /// Bytes that should have been written.
        expected: usize,
    },

    /// The data file refuses writes after an earlier integrity violation.
    #[error("Data file is poisoned after a partial write: {0}")]
    FilePoisoned(PathBuf),

    /// A block buffer passed to a data file had the wrong size.
    #[error("Invalid block size: {0} bytes")]
    InvalidBlockSize(usize),

    /// No column matches the tags of an incoming value.
    #[error("No column matches tags {0}")]
    UnknownColumn(String),

    /// More than one column matches the tags of an incoming value.
    #[error("Ambiguous column match for tags {0}")]
    AmbiguousColumn(String),

    /// Row width does not match the bucket's column layout.
    #[error("Column count mismatch: expected {expected}, got {actual}")]
    ColumnMismatch {
        /// Expected column count.
        expected: usize,
        /// Column count supplied.
        actual: usize,
    },

    /// The point's time is already archived on disk.
    #[error("Time {time} already archived (last time on disk {last_time_on_disk})")]
    TimeArchived {
        /// Time of the rejected point.
        time: i64,
        /// Current last time on disk of the bucket.
        last_time_on_disk: i64,
    },

    /// No series matches the point or query.
    #[error("No matching series")]
    NoMatchingSeries,

    /// An aggregation or function name is not registered.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// The requested time range is empty or inverted.
    #[error("Invalid time range [{start}, {end}]")]
    InvalidTimeRange {
        /// Start of the range (inclusive).
        start: i64,
        /// End of the range (inclusive).
        end: i64,
    },

    /// The requested step is not positive.
    #[error("Invalid step: {0}")]
    InvalidStep(i64),

    /// The query receiver was dropped before results were delivered.
    #[error("Query cancelled")]
    QueryCancelled,

    /// A clustered query failed; the message is shared by every receiver.
    #[error("Clustered query failed: {0}")]
    ClusterFailed(String),

    /// The coordinator loop has shut down.
    #[error("Coordinator closed")]
    CoordinatorClosed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Response serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrataError {
    /// Returns true for errors that reject a single request but leave the
    /// engine healthy.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownColumn(_)
                | Self::AmbiguousColumn(_)
                | Self::ColumnMismatch { .. }
                | Self::TimeArchived { .. }
                | Self::NoMatchingSeries
                | Self::UnknownFunction(_)
                | Self::InvalidTimeRange { .. }
                | Self::InvalidStep(_)
        )
    }

    /// Produces an equivalent error for another receiver of the same result.
    ///
    /// Request errors keep their variant; everything else is carried as
    /// `ClusterFailed` with the original message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::UnknownColumn(s) => Self::UnknownColumn(s.clone()),
            Self::AmbiguousColumn(s) => Self::AmbiguousColumn(s.clone()),
            Self::ColumnMismatch { expected, actual } => Self::ColumnMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::TimeArchived {
                time,
                last_time_on_disk,
            } => Self::TimeArchived {
                time: *time,
                last_time_on_disk: *last_time_on_disk,
            },
            Self::NoMatchingSeries => Self::NoMatchingSeries,
            Self::UnknownFunction(s) => Self::UnknownFunction(s.clone()),
            Self::InvalidTimeRange { start, end } => Self::InvalidTimeRange {
                start: *start,
                end: *end,
            },
            Self::InvalidStep(s) => Self::InvalidStep(*s),
            Self::QueryCancelled => Self::QueryCancelled,
            Self::CoordinatorClosed => Self::CoordinatorClosed,
            other => Self::ClusterFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_errors() {
        assert!(StrataError::NoMatchingSeries.is_request_error());
        assert!(StrataError::InvalidStep(0).is_request_error());
        assert!(!StrataError::Decode("x".into()).is_request_error());
        assert!(!StrataError::FilePoisoned(PathBuf::from("a")).is_request_error());
    }

    #[test]
    fn test_duplicate_keeps_request_variants() {
        let e = StrataError::InvalidTimeRange { start: 5, end: 1 };
        assert!(matches!(
            e.duplicate(),
            StrataError::InvalidTimeRange { start: 5, end: 1 }
        ));
        let io = StrataError::Io(io::Error::new(io::ErrorKind::Other, "disk gone"));
        match io.duplicate() {
            StrataError::ClusterFailed(msg) => assert!(msg.contains("disk gone")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
