//! Error types for chapter-dl
//!
//! This module provides the error taxonomy for the download pipeline:
//! - Domain-specific error types (storage, download, integrity)
//! - [`FailureKind`], the coarse classification the scheduler uses to decide
//!   between automatic retry and terminal failure
//!
//! No error produced here is meant to escape to the host application as a
//! panic; component boundaries catch, log, and convert.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for chapter-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chapter-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download_dir")
        key: Option<String>,
    },

    /// Persistence layer failure (queue snapshot, runtime markers)
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Integrity validation or repair error
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Malformed source reference (never retried)
    #[error("invalid source reference: {0}")]
    InvalidSource(String),

    /// URL parse failure
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Remote server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// The HTTP status code returned
        status: u16,
        /// The URL that was requested
        url: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Image decoding error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Operation was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,

    /// Shutdown in progress - the queue is no longer accepting commands
    #[error("shutdown in progress: queue is not accepting commands")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored record could not be decoded
    #[error("corrupt record under key {key}: {reason}")]
    CorruptRecord {
        /// The storage key whose value was unreadable
        key: String,
        /// Why decoding failed
        reason: String,
    },
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The chapter page list was empty
    #[error("chapter {id} resolved to no pages")]
    NoPages {
        /// The queue item id
        id: String,
    },

    /// A fetched piece is not a recognisable image
    #[error("piece {index} of {id} is not a supported image")]
    UnsupportedPiece {
        /// The queue item id
        id: String,
        /// Index of the offending piece
        index: u32,
    },

    /// Piece-scoped request for a unit with no manifest on disk
    #[error("no manifest for {id}, cannot repair single piece")]
    ManifestMissing {
        /// The queue item id
        id: String,
    },

    /// Dispatch to the executor failed synchronously
    #[error("executor rejected {id}: {reason}")]
    DispatchRejected {
        /// The queue item id
        id: String,
        /// Reason given by the executor
        reason: String,
    },
}

/// Integrity validation and repair errors
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// Unit directory does not exist
    #[error("unit {owner_id}/{unit_key} not found at {path}")]
    UnitNotFound {
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
        /// The expected directory
        path: PathBuf,
    },

    /// The recommended action is not one the repair engine handles
    #[error("unit {owner_id}/{unit_key} requires manual inspection")]
    ManualCheckRequired {
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
    },

    /// No source reference is known for the unit
    #[error("no source reference known for {owner_id}/{unit_key}")]
    UnknownSource {
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
    },

    /// Waiting for repair downloads exceeded the configured timeout
    #[error("repair of {owner_id}/{unit_key} timed out")]
    RepairTimedOut {
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
    },
}

/// Coarse failure classification reported by executors to the scheduler
///
/// Only [`FailureKind::Transient`] failures are eligible for automatic retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network-class failure, likely recoverable
    Transient,
    /// Malformed input such as a bad source reference
    TerminalInput,
    /// Persistence read/write failure
    Storage,
    /// Validation or repair failure
    Integrity,
}

impl FailureKind {
    /// Whether the scheduler may re-enqueue an item that failed this way
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::TerminalInput => "terminal_input",
            FailureKind::Storage => "storage",
            FailureKind::Integrity => "integrity",
        };
        f.write_str(s)
    }
}

impl From<&Error> for FailureKind {
    fn from(error: &Error) -> Self {
        use crate::retry::IsRetryable;

        if error.is_retryable() {
            return FailureKind::Transient;
        }

        match error {
            Error::InvalidSource(_)
            | Error::Url(_)
            | Error::HttpStatus { .. }
            | Error::Download(DownloadError::NoPages { .. })
            | Error::Download(DownloadError::UnsupportedPiece { .. })
            | Error::Download(DownloadError::DispatchRejected { .. }) => FailureKind::TerminalInput,
            Error::Storage(_) | Error::Sqlx(_) | Error::Io(_) | Error::Serialization(_) => {
                FailureKind::Storage
            }
            Error::Integrity(_)
            | Error::Image(_)
            | Error::Download(DownloadError::ManifestMissing { .. }) => FailureKind::Integrity,
            // Remaining variants are not input problems and not retryable; report as
            // terminal input so they are never retried automatically.
            _ => FailureKind::TerminalInput,
        }
    }
}
