//! Error types for Lorebase.
//!
//! A single unified error enum covers every subsystem. Each variant carries a
//! descriptive message prefixed by a `KB-XXX` code, and maps to a stable
//! machine-readable kind tag via [`Error::kind`].

use thiserror::Error;

/// Result type alias for Lorebase operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Lorebase operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid caller input (KB-001): empty query, mismatched batch lengths,
    /// out-of-range fusion weights, delete without ids or filter.
    #[error("[KB-001] Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration value at construction (KB-002).
    #[error("[KB-002] Configuration error for '{key}': {message}")]
    Config {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },

    /// Project not found (KB-003).
    #[error("[KB-003] Project '{0}' not found")]
    ProjectNotFound(String),

    /// Document not found (KB-004).
    #[error("[KB-004] Document '{0}' not found")]
    DocumentNotFound(String),

    /// Project name collision on create/update/import (KB-005).
    #[error("[KB-005] Project with name '{0}' already exists")]
    DuplicateName(String),

    /// Collection already exists (KB-006).
    #[error("[KB-006] Collection '{0}' already exists")]
    CollectionExists(String),

    /// Collection not found (KB-007).
    #[error("[KB-007] Collection '{0}' not found")]
    CollectionNotFound(String),

    /// Vector dimension mismatch (KB-008).
    #[error("[KB-008] Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Vector backend connectivity or operation failure (KB-009).
    #[error("[KB-009] Backend error: {0}")]
    Backend(String),

    /// Operation attempted on an uninitialized or closed backend (KB-010).
    #[error("[KB-010] Backend not initialized: {0}")]
    NotInitialized(String),

    /// Embedding model inference failure (KB-011).
    #[error("[KB-011] Embedding error: {0}")]
    Embedding(String),

    /// Filesystem or snapshot failure (KB-012). Retryable where noted.
    #[error("[KB-012] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache file unreadable or not JSON (KB-013). Triggers a rebuild, never
    /// surfaced to query callers.
    #[error("[KB-013] Cache invalid: {0}")]
    CacheInvalid(String),

    /// Serialization error (KB-014).
    #[error("[KB-014] Serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal error (KB-015). Please report if encountered.
    #[error("[KB-015] Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code (e.g., "KB-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "KB-001",
            Self::Config { .. } => "KB-002",
            Self::ProjectNotFound(_) => "KB-003",
            Self::DocumentNotFound(_) => "KB-004",
            Self::DuplicateName(_) => "KB-005",
            Self::CollectionExists(_) => "KB-006",
            Self::CollectionNotFound(_) => "KB-007",
            Self::DimensionMismatch { .. } => "KB-008",
            Self::Backend(_) => "KB-009",
            Self::NotInitialized(_) => "KB-010",
            Self::Embedding(_) => "KB-011",
            Self::Io(_) => "KB-012",
            Self::CacheInvalid(_) => "KB-013",
            Self::Serialization(_) => "KB-014",
            Self::Internal(_) => "KB-015",
        }
    }

    /// Returns the stable machine-readable kind tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) | Self::DimensionMismatch { .. } => "invalid_input",
            Self::Config { .. } => "config",
            Self::ProjectNotFound(_) | Self::DocumentNotFound(_) | Self::CollectionNotFound(_) => {
                "not_found"
            }
            Self::DuplicateName(_) | Self::CollectionExists(_) => "duplicate_name",
            Self::Backend(_) | Self::NotInitialized(_) => "backend",
            Self::Embedding(_) => "embedding",
            Self::Io(_) => "io",
            Self::CacheInvalid(_) => "cache_invalid",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true if retrying the operation may succeed.
    ///
    /// Only I/O failures are retryable; invalid data embedded in a file
    /// (decode failures surface as `InvalidData`) is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() != std::io::ErrorKind::InvalidData,
            _ => false,
        }
    }

    /// Convenience constructor for configuration errors.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(format!("sqlite: {err}"))
    }
}
