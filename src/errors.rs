//! Error types for the resource fetcher
//!
//! Errors are grouped by the component that raises them. Transport and
//! persistence failures are recorded and logged rather than thrown across the
//! public execution and cache APIs; configuration errors fail fast at the call
//! site.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by a [`Transport`](crate::app::transport::Transport)
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP request error
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// I/O error while talking to the remote end
    #[error("Transport I/O error")]
    Io(#[from] std::io::Error),

    /// Request exceeded its timeout
    #[error("Request timed out after {millis} ms")]
    Timeout { millis: u64 },

    /// Request was aborted through cancellation
    #[error("Request {request_id} was aborted")]
    Aborted { request_id: u64 },

    /// Invalid URL provided
    #[error("Invalid URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },

    /// The request description could not be turned into an executable request
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Transport-specific failure
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Check if the failure is likely transient
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. } | TransportError::Io(_) => true,
            TransportError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Durable completion store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error reading or writing the store
    #[error("Completion store I/O error for {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Store contents could not be (de)serialized
    #[error("Completion store serialization error")]
    Serialization(#[from] serde_json::Error),

    /// Atomic replace of the store file failed
    #[error("Failed to persist completion store to {path}")]
    PersistFailed { path: PathBuf },
}

/// Keyed download cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Cache directory not found or inaccessible
    #[error("Cache directory not accessible: {path}")]
    DirectoryNotAccessible { path: PathBuf },

    /// A cache key could not be derived from the request
    #[error("Cannot derive cache key from: {url}")]
    InvalidKey { url: String },

    /// Completion store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The download backing a cache lookup failed
    #[error(transparent)]
    DownloadFailed(#[from] DownloadFailure),
}

/// Failure delivered to every waiter of a failed cache download
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Download of {key} failed: {reason}")]
pub struct DownloadFailure {
    /// Cache key of the resource
    pub key: String,
    /// HTTP status code, or `-1` if there was no response
    pub response_code: i32,
    /// Whether the download was cancelled
    pub cancelled: bool,
    /// Human-readable cause
    pub reason: String,
}

/// Priority work queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Work submitted after the pool was shut down
    #[error("Work queue has been shut down")]
    Shutdown,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Configuration file could not be read
    #[error("Failed to read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration format
    #[error("Invalid configuration format")]
    InvalidFormat(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// HTTP client could not be built from the configuration
    #[error("Failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

impl ConfigError {
    /// Shorthand for an [`ConfigError::InvalidValue`]
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Top-level error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Completion store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Check if the error is recoverable (transient)
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Transport(e) => e.is_transient(),
            AppError::Store(_) | AppError::Io(_) => true,
            AppError::Cache(CacheError::Store(_)) => true,
            AppError::Cache(CacheError::DownloadFailed(failure)) => !failure.cancelled,
            AppError::Cache(_) | AppError::Queue(_) | AppError::Config(_) => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Transport(_) => "transport",
            AppError::Store(_) => "persistence",
            AppError::Cache(_) => "cache",
            AppError::Queue(_) => "queue",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Transport result type alias
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Store result type alias
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Cache result type alias
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Queue result type alias
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Configuration result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
