//! Error types for Tessera.
//!
//! This module provides a unified error type [`TesseraError`] for every
//! lock-gated metadata operation, along with a convenient [`Result`] alias.
//!
//! # Error Categories
//!
//! - **Access**: capability or ownership checks that failed
//! - **Request shape**: malformed requests, wrong token lengths, wrong payload sizes
//! - **Capacity**: journal, attribute or quota capacity exceeded (always checked
//!   before any mutation)
//! - **Identity**: stale file handles and missing objects
//! - **Consistency**: violated caller invariants, which are bugs rather than
//!   transient faults
//!
//! # Example
//!
//! ```rust
//! use tessera::error::{Result, TesseraError};
//!
//! fn check_token_len(words: usize) -> Result<()> {
//!     match words {
//!         3 | 5 | 6 => Ok(()),
//!         n => Err(TesseraError::InvalidArgument(format!("bad token length {}", n))),
//!     }
//! }
//!
//! let err = check_token_len(4).unwrap_err();
//! assert_eq!(err.to_errno(), libc::EINVAL);
//! assert!(!err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    // Access errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    // Request errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Capacity errors
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    // Identity errors
    #[error("Stale file handle: {0}")]
    StaleHandle(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Consistency errors
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    // Lock errors
    #[error("Lock wait timed out: {0}")]
    LockTimeout(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TesseraError {
    /// Convert to a POSIX errno value.
    pub fn to_errno(&self) -> i32 {
        match self {
            TesseraError::PermissionDenied(_) => libc::EACCES,
            TesseraError::Unsupported(_) => libc::EOPNOTSUPP,
            TesseraError::InvalidArgument(_) => libc::EINVAL,
            TesseraError::OutOfMemory(_) => libc::ENOMEM,
            TesseraError::OutOfSpace(_) => libc::ENOSPC,
            TesseraError::QuotaExceeded(_) => libc::EDQUOT,
            TesseraError::StaleHandle(_) => libc::ESTALE,
            TesseraError::NotFound(_) => libc::ENOENT,
            TesseraError::InternalInconsistency(_) => libc::EIO,
            TesseraError::LockTimeout(_) => libc::ETIMEDOUT,
            TesseraError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            TesseraError::Config(_)
            | TesseraError::InvalidConfig { .. }
            | TesseraError::Serialization(_) => libc::EINVAL,
        }
    }

    /// Check if the error is retryable.
    ///
    /// Only lock waits are retryable; everything else is a final answer for
    /// the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TesseraError::LockTimeout(_))
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for TesseraError {
    fn from(e: std::collections::TryReserveError) -> Self {
        TesseraError::OutOfMemory(e.to_string())
    }
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;
