//! Model error types

use std::path::PathBuf;
use thiserror::Error;

/// Malformed profile, trace or scenario.
///
/// Always raised before any side effect takes place.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: f64,
    },

    #[error("Trace is empty")]
    EmptyTrace,

    #[error("Line {line}: time_ms must be non-decreasing ({offset_ms} after {previous_ms})")]
    DecreasingOffset {
        line: usize,
        offset_ms: u64,
        previous_ms: u64,
    },

    #[error("Segment {index}: offset must be non-decreasing ({offset_ms}ms after {previous_ms}ms)")]
    SegmentOutOfOrder {
        index: usize,
        offset_ms: u64,
        previous_ms: u64,
    },

    #[error("Line {line}: {message}")]
    InvalidRow { line: usize, message: String },

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Invalid network_profile.type: {0}")]
    UnknownProfileType(String),

    #[error("Scenario id must not be empty")]
    EmptyId,

    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },
}

impl ValidationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

/// Rejected metric submission (client error at the ingestion boundary)
#[derive(Error, Debug, PartialEq)]
pub enum IngestError {
    #[error("No JSON object provided")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}
