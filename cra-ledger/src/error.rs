//! Error types for ledger operations
//!
//! Every error variant carries:
//! - A human-readable message
//! - A stable error code for programmatic handling (e.g. `QUEUE_FULL`)
//! - A category for grouping and alerting
//!
//! Fatal errors (`is_fatal`) are integrity or durability incidents that an
//! operator has to look at. They are never retried automatically beyond the
//! bounded retry the processor already performed.
//!
//! # Example
//!
//! ```rust
//! use cra_ledger::error::{LedgerError, ErrorCategory};
//!
//! fn handle(err: LedgerError) {
//!     match err.category() {
//!         ErrorCategory::Backpressure => println!("slow down and retry"),
//!         ErrorCategory::Integrity => println!("raise an incident"),
//!         _ => println!("{}", err),
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Input could not be accepted as-is
    Validation,
    /// Queue capacity or deadline pressure
    Backpressure,
    /// Persistence failed
    Durability,
    /// Hash chain or replay baseline does not hold
    Integrity,
    /// Configuration or manifest is malformed
    Configuration,
    /// Internal error
    Internal,
    /// I/O or serialization outside the canonical encoder
    External,
}

/// Errors that can occur in ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    // ═══════════════════════════════════════════════════════════════════════
    // Producer-facing errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Event content cannot be canonically encoded
    #[error("Serialization error: {reason}. Event content must be canonically encodable (finite numbers, valid UTF-8, string keys).")]
    Serialization { reason: String },

    /// The ingestion queue is at capacity
    #[error("Trace queue full: capacity {capacity} reached under '{policy}' overflow policy.")]
    QueueFull { capacity: usize, policy: String },

    /// A readiness or flush deadline elapsed
    #[error("Timed out after {waited_ms}ms waiting for {operation}.")]
    Timeout { operation: String, waited_ms: u64 },

    /// Session id cannot be used by the storage backend
    #[error("Invalid session id '{session_id}': {reason}")]
    InvalidSession { session_id: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Durability errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Storage writes for a batch failed after every retry
    #[error("Storage write failed for session '{session_id}' after {attempts} attempts: {reason}. Batch kept for recovery.")]
    StorageWriteFailure {
        session_id: String,
        attempts: u32,
        reason: String,
    },

    /// Session has a failed batch that has not been recovered
    #[error("Session '{session_id}' is halted by an unrecovered failed batch. Call retry_failed() once storage is healthy.")]
    SessionHalted { session_id: String },

    /// Backend rejected or could not complete an operation
    #[error("Storage error in '{backend}' backend: {reason}")]
    Storage { backend: String, reason: String },

    /// Storage backend lock is poisoned (panic occurred while holding lock)
    #[error("Storage backend lock poisoned. This is a bug; please report it.")]
    StorageLocked,

    // ═══════════════════════════════════════════════════════════════════════
    // Integrity errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Hash chain verification failed
    #[error("Chain break in session '{session_id}' at sequence {sequence}: {reason}. The audit trail may have been tampered with.")]
    ChainBreak {
        session_id: String,
        sequence: u64,
        reason: String,
    },

    /// Replayed events do not match the golden manifest
    #[error("Manifest '{manifest}' mismatch: {failures} event(s) failed.")]
    ManifestMismatch { manifest: String, failures: usize },

    // ═══════════════════════════════════════════════════════════════════════
    // Configuration errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Golden manifest is malformed
    #[error("Invalid golden manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Ledger configuration is malformed
    #[error("Invalid ledger configuration: {reason}")]
    InvalidConfig { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("IO error: {message}")]
    IoError { message: String },

    /// The background processor is not running
    #[error("Trace processor stopped: {reason}")]
    ProcessorStopped { reason: String },

    /// Internal error that shouldn't happen
    #[error("Internal error: {reason}. This is a bug; please report it.")]
    InternalError { reason: String },
}

impl LedgerError {
    /// Returns true if this error might succeed on retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LedgerError::QueueFull { .. }
                | LedgerError::Timeout { .. }
                | LedgerError::StorageLocked
                | LedgerError::Storage { .. }
        )
    }

    /// Returns true if this error is an operator-visible incident
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::StorageWriteFailure { .. }
                | LedgerError::SessionHalted { .. }
                | LedgerError::ChainBreak { .. }
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::Serialization { .. } | LedgerError::InvalidSession { .. } => {
                ErrorCategory::Validation
            }

            LedgerError::QueueFull { .. } | LedgerError::Timeout { .. } => {
                ErrorCategory::Backpressure
            }

            LedgerError::StorageWriteFailure { .. }
            | LedgerError::SessionHalted { .. }
            | LedgerError::Storage { .. } => ErrorCategory::Durability,

            LedgerError::ChainBreak { .. } | LedgerError::ManifestMismatch { .. } => {
                ErrorCategory::Integrity
            }

            LedgerError::InvalidManifest { .. } | LedgerError::InvalidConfig { .. } => {
                ErrorCategory::Configuration
            }

            LedgerError::StorageLocked
            | LedgerError::ProcessorStopped { .. }
            | LedgerError::InternalError { .. } => ErrorCategory::Internal,

            LedgerError::JsonError(_) | LedgerError::IoError { .. } => ErrorCategory::External,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Serialization { .. } => "SERIALIZATION_ERROR",
            LedgerError::QueueFull { .. } => "QUEUE_FULL",
            LedgerError::Timeout { .. } => "TIMEOUT",
            LedgerError::InvalidSession { .. } => "INVALID_SESSION",
            LedgerError::StorageWriteFailure { .. } => "STORAGE_WRITE_FAILURE",
            LedgerError::SessionHalted { .. } => "SESSION_HALTED",
            LedgerError::Storage { .. } => "STORAGE_ERROR",
            LedgerError::StorageLocked => "STORAGE_LOCKED",
            LedgerError::ChainBreak { .. } => "CHAIN_BREAK",
            LedgerError::ManifestMismatch { .. } => "MANIFEST_MISMATCH",
            LedgerError::InvalidManifest { .. } => "INVALID_MANIFEST",
            LedgerError::InvalidConfig { .. } => "INVALID_CONFIG",
            LedgerError::JsonError(_) => "JSON_ERROR",
            LedgerError::IoError { .. } => "IO_ERROR",
            LedgerError::ProcessorStopped { .. } => "PROCESSOR_STOPPED",
            LedgerError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Converts this error to a JSON-serializable response object
    ///
    /// ```json
    /// {
    ///   "error": {
    ///     "code": "QUEUE_FULL",
    ///     "message": "Trace queue full: ...",
    ///     "category": "backpressure",
    ///     "recoverable": true
    ///   }
    /// }
    /// ```
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                category: self.category(),
                recoverable: self.is_recoverable(),
            },
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::IoError {
            message: err.to_string(),
        }
    }
}

/// JSON-serializable error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "QUEUE_FULL")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Error category
    pub category: ErrorCategory,
    /// Whether retry might succeed
    pub recoverable: bool,
}
