// src/error.rs

use crate::packages::PackageId;
use crate::resolver::Unsatisfiable;
use std::path::PathBuf;
use thiserror::Error;

/// Core error types for Nest
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors for indexes and journals
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// A repository definition could not be loaded
    #[error("Malformed definition for '{package}': {reason}")]
    MalformedDefinition { package: String, reason: String },

    /// The resolver could not find a consistent package set
    #[error(transparent)]
    Unsatisfiable(#[from] Unsatisfiable),

    /// A requested package is known to no repository
    #[error("Package '{0}' was not found in any repository")]
    PackageNotFound(String),

    /// A removal or upgrade targeted a package that is not installed
    #[error("Package '{0}' is not installed")]
    NotInstalled(String),

    /// HTTP transfer errors
    #[error("Download error: {0}")]
    DownloadError(String),

    /// No mirror could deliver a package archive
    #[error("Failed to fetch {package}: {reason}")]
    FetchFailed { package: PackageId, reason: String },

    /// An archive does not hash to the expected value
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A filesystem operation on a package root failed
    #[error("Filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The installed state changed between resolution and execution
    #[error("Installed state changed concurrently (expected generation {expected}, found {found})")]
    StaleSnapshot { expected: u64, found: u64 },

    /// A package's instruction script failed
    #[error("The {hook} hook of {package} failed: {reason}")]
    HookFailed {
        package: PackageId,
        hook: String,
        reason: String,
    },

    /// Another process holds the depgraph write lock
    #[error("Another transaction is running on {}; try again once it has finished", .0.display())]
    StoreBusy(PathBuf),

    /// The transaction was cancelled before commit
    #[error("Transaction cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap an I/O error with the path it occurred on
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort and roll back a running transaction
    pub fn is_step_fatal(&self) -> bool {
        matches!(
            self,
            Error::FetchFailed { .. }
                | Error::ChecksumMismatch { .. }
                | Error::Filesystem { .. }
                | Error::HookFailed { .. }
                | Error::Cancelled
        )
    }
}

/// Result type alias using Nest's Error type
pub type Result<T> = std::result::Result<T, Error>;
