//! Error types for QTrace operations
//!
//! This module provides the error handling system shared by the producer
//! handle, the tailer and the controller:
//! - Structured error types with descriptive messages
//! - Stable error codes for programmatic handling
//! - Error categories for grouping and filtering
//!
//! # The write path
//!
//! Producers must never be disturbed by tracing I/O. The only error that
//! `Tracer::trace` ever surfaces is [`QtError::ArgTypeMismatch`]; every
//! other failure is folded into an `Ok(false)` "record dropped" result.
//!
//! # Example
//!
//! ```rust
//! use qtrace_core::error::{QtError, ErrorCategory};
//!
//! fn handle_error(err: QtError) {
//!     match err.category() {
//!         ErrorCategory::Configuration => println!("Fix the trace configuration"),
//!         ErrorCategory::Corruption => println!("Trace file is damaged"),
//!         _ => println!("Other error"),
//!     }
//!
//!     if err.is_recoverable() {
//!         println!("Retry may succeed");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for QTrace operations
pub type Result<T> = std::result::Result<T, QtError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad configuration (path, size spec, selector)
    Configuration,
    /// A call site presented arguments that do not match its registration
    Validation,
    /// File is not a trace file or has an unsupported layout
    Format,
    /// Trace data failed to decode
    Corruption,
    /// A message id or file could not be found
    NotFound,
    /// Filesystem or serialization failure
    Io,
    /// Internal error that shouldn't happen
    Internal,
}

/// Errors that can occur in QTrace operations
#[derive(Error, Debug)]
pub enum QtError {
    // ═══════════════════════════════════════════════════════════════════════
    // Initialization errors (creating or attaching a trace file)
    // ═══════════════════════════════════════════════════════════════════════

    /// The trace path could not be resolved or used
    #[error("Invalid trace path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A per-level size spec could not be parsed
    #[error("Invalid size spec '{spec}': {reason}. Expected up to ten KB sizes separated by commas or spaces.")]
    InvalidSizeSpec { spec: String, reason: String },

    /// The trace file could not be created (unwritable medium, disk full)
    #[error("Failed to initialize trace file '{path}': {reason}")]
    InitializationFailed { path: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Write path errors
    // ═══════════════════════════════════════════════════════════════════════

    /// A dynamic argument does not match the type registered for its slot
    #[error("Argument {slot} of message {message_id} has type '{presented}', but the message was registered with '{registered}'")]
    ArgTypeMismatch {
        message_id: u32,
        slot: usize,
        registered: char,
        presented: char,
    },

    /// Encoded record does not fit in its level
    #[error("Record of {len} bytes does not fit in level {level} (capacity {capacity})")]
    RecordTooLarge { level: u8, len: usize, capacity: usize },

    /// Level outside 0..=9
    #[error("Invalid trace level {level}. Levels range from 0 to 9.")]
    InvalidLevel { level: u8 },

    // ═══════════════════════════════════════════════════════════════════════
    // File format errors
    // ═══════════════════════════════════════════════════════════════════════

    /// File does not start with the trace file magic
    #[error("'{path}' is not a trace file (bad magic)")]
    BadMagic { path: String },

    /// File was written by an incompatible format version
    #[error("'{path}' has unsupported format version {version}")]
    UnsupportedVersion { path: String, version: u32 },

    /// File is shorter than its header claims
    #[error("'{path}' is truncated: expected at least {expected} bytes, found {actual}")]
    TruncatedFile { path: String, expected: u64, actual: u64 },

    // ═══════════════════════════════════════════════════════════════════════
    // Catalog and decode errors
    // ═══════════════════════════════════════════════════════════════════════

    /// No descriptor is registered for a message id
    #[error("Unknown message id {id}")]
    UnknownMessage { id: u32 },

    /// A catalog entry could not be parsed
    #[error("Malformed catalog entry at offset {offset}: {reason}")]
    CatalogEntry { offset: u64, reason: String },

    /// A message's argument format does not fit in one catalog entry
    #[error("Catalog entry for {site} needs {len} bytes; the limit is {limit}")]
    CatalogEntryTooLarge { site: String, len: usize, limit: usize },

    /// A record failed to decode against its descriptor
    #[error("Corrupt record in level {level}: {reason}")]
    Corruption { level: u8, reason: String },

    /// A tailer formatter plugin descriptor could not be loaded
    #[error("Invalid formatter plugin '{path}': {reason}")]
    FormatterPlugin { path: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Control and tool option errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Tailer level filter could not be parsed
    #[error("{reason}: '{spec}'")]
    InvalidLevelFilter { spec: String, reason: String },

    /// Controller selector is missing or ambiguous
    #[error("Invalid message selector: {reason}")]
    InvalidSelector { reason: String },

    /// Regular expression failed to compile
    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors (serialization, I/O)
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("IO error: {message}")]
    IoError { message: String },

    /// The tailer's output went away (closed pipe, hung-up terminal)
    #[error("Output closed: {reason}")]
    OutputClosed { reason: String },

    /// Internal error that shouldn't happen
    #[error("Internal error: {reason}. This is a bug; please report it.")]
    InternalError { reason: String },
}

impl From<std::io::Error> for QtError {
    fn from(err: std::io::Error) -> Self {
        QtError::IoError {
            message: err.to_string(),
        }
    }
}

impl QtError {
    /// Returns true if this error might succeed on retry
    ///
    /// Unknown message ids can become visible once a concurrent writer
    /// finishes its catalog append; an initialization failure may clear
    /// once disk space is freed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QtError::UnknownMessage { .. }
                | QtError::InitializationFailed { .. }
                | QtError::IoError { .. }
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            QtError::InvalidPath { .. }
            | QtError::InvalidSizeSpec { .. }
            | QtError::InvalidSelector { .. }
            | QtError::InvalidLevelFilter { .. }
            | QtError::Regex(_)
            | QtError::FormatterPlugin { .. }
            | QtError::InvalidLevel { .. } => ErrorCategory::Configuration,

            QtError::ArgTypeMismatch { .. }
            | QtError::RecordTooLarge { .. }
            | QtError::CatalogEntryTooLarge { .. } => ErrorCategory::Validation,

            QtError::BadMagic { .. }
            | QtError::UnsupportedVersion { .. }
            | QtError::TruncatedFile { .. } => ErrorCategory::Format,

            QtError::CatalogEntry { .. } | QtError::Corruption { .. } => {
                ErrorCategory::Corruption
            }

            QtError::UnknownMessage { .. } => ErrorCategory::NotFound,

            QtError::InitializationFailed { .. }
            | QtError::JsonError(_)
            | QtError::IoError { .. }
            | QtError::OutputClosed { .. } => ErrorCategory::Io,

            QtError::InternalError { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            QtError::InvalidPath { .. } => "INVALID_PATH",
            QtError::InvalidSizeSpec { .. } => "INVALID_SIZE_SPEC",
            QtError::InitializationFailed { .. } => "INITIALIZATION_FAILED",
            QtError::ArgTypeMismatch { .. } => "ARG_TYPE_MISMATCH",
            QtError::RecordTooLarge { .. } => "RECORD_TOO_LARGE",
            QtError::InvalidLevel { .. } => "INVALID_LEVEL",
            QtError::BadMagic { .. } => "BAD_MAGIC",
            QtError::UnsupportedVersion { .. } => "UNSUPPORTED_VERSION",
            QtError::TruncatedFile { .. } => "TRUNCATED_FILE",
            QtError::UnknownMessage { .. } => "UNKNOWN_MESSAGE",
            QtError::CatalogEntry { .. } => "CATALOG_ENTRY",
            QtError::CatalogEntryTooLarge { .. } => "CATALOG_ENTRY_TOO_LARGE",
            QtError::Corruption { .. } => "CORRUPTION",
            QtError::FormatterPlugin { .. } => "FORMATTER_PLUGIN",
            QtError::InvalidSelector { .. } => "INVALID_SELECTOR",
            QtError::InvalidLevelFilter { .. } => "INVALID_LEVEL_FILTER",
            QtError::Regex(_) => "INVALID_REGEX",
            QtError::JsonError(_) => "JSON_ERROR",
            QtError::IoError { .. } => "IO_ERROR",
            QtError::OutputClosed { .. } => "OUTPUT_CLOSED",
            QtError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        assert!(QtError::UnknownMessage { id: 3 }.is_recoverable());
        assert!(QtError::InitializationFailed {
            path: "/tmp/x.qt".to_string(),
            reason: "No space left on device".to_string()
        }
        .is_recoverable());
        assert!(!QtError::ArgTypeMismatch {
            message_id: 1,
            slot: 0,
            registered: 'q',
            presented: 'p'
        }
        .is_recoverable());
        assert!(!QtError::BadMagic {
            path: "x".to_string()
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            QtError::ArgTypeMismatch {
                message_id: 1,
                slot: 0,
                registered: 'q',
                presented: 'p'
            }
            .error_code(),
            "ARG_TYPE_MISMATCH"
        );
        assert_eq!(QtError::UnknownMessage { id: 9 }.error_code(), "UNKNOWN_MESSAGE");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            QtError::InvalidSizeSpec {
                spec: "a".to_string(),
                reason: "bad".to_string()
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            QtError::Corruption {
                level: 3,
                reason: "length".to_string()
            }
            .category(),
            ErrorCategory::Corruption
        );
        let io: QtError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(io.category(), ErrorCategory::Io);
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&ErrorCategory::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }

    #[test]
    fn test_error_messages_are_helpful() {
        let err = QtError::ArgTypeMismatch {
            message_id: 7,
            slot: 1,
            registered: 'd',
            presented: 'p',
        };
        let msg = err.to_string();
        assert!(msg.contains("message 7"));
        assert!(msg.contains("'d'"));
    }
}
