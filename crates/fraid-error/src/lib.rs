#![forbid(unsafe_code)]
//! Error types for FrankenRAID.
//!
//! Defines `FraidError` and a `Result<T>` alias used throughout the
//! workspace, plus the errno classification that separates "the disk is
//! physically failing" (`EIO`) from "the user touched a file during a sync"
//! (`ENOENT`/`EACCES`).

use thiserror::Error;

/// Unified error type for all FrankenRAID operations.
#[derive(Debug, Error)]
pub enum FraidError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("corrupt content file: {detail}")]
    Content { detail: String },

    #[error("{level} file error: {detail}")]
    Parity { level: &'static str, detail: String },

    #[error(
        "sync failed: {file_errors} file errors, {io_errors} io errors, {data_errors} data errors"
    )]
    Unrecoverable {
        file_errors: u32,
        io_errors: u32,
        data_errors: u32,
    },

    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias using `FraidError`.
pub type Result<T> = std::result::Result<T, FraidError>;

/// Errno-level classification of an I/O failure.
///
/// `Eio` means the device itself reported a hardware-level fault and is
/// always treated as fatal or rate-limited; `Enoent`/`Eaccess` mean the file
/// tree changed underneath us and are per-block warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    Eio,
    Enoent,
    Eaccess,
    Other,
}

impl IoClass {
    /// Classify a `std::io::Error` by its raw OS errno.
    #[must_use]
    pub fn of(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EIO) => Self::Eio,
            Some(libc::ENOENT) => Self::Enoent,
            Some(libc::EACCES) => Self::Eaccess,
            _ => Self::Other,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
