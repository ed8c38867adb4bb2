//! Error handling types
//!
//! One variant per wire-visible error kind. The HTTP layer owns the
//! kind-to-status mapping; everything below the transport returns these
//! structured errors and lets `?` carry them up.

use thiserror::Error;

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the codebase-insight server
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration invalid: {message}")]
    Config { message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("illegal ADR transition: {from} -> {to}")]
    AdrTransition { from: String, to: String },

    #[error("task queue full")]
    QueueFull,

    #[error("vector index unavailable: {message}")]
    VectorUnavailable { message: String },

    #[error("vector collection schema mismatch: {message}")]
    VectorSchemaMismatch { message: String },

    #[error("embedding provider unavailable: {message}")]
    EmbedderUnavailable { message: String },

    #[error("indexing failed: {message}")]
    IndexFailed { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a vector index error
    pub fn vector_unavailable<S: Into<String>>(message: S) -> Self {
        Self::VectorUnavailable {
            message: message.into(),
        }
    }

    /// Create an embedding provider error
    pub fn embedder_unavailable<S: Into<String>>(message: S) -> Self {
        Self::EmbedderUnavailable {
            message: message.into(),
        }
    }

    /// Create an index-failed error
    pub fn index_failed<S: Into<String>>(message: S) -> Self {
        Self::IndexFailed {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wire-visible error kind, stable across refactors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config-invalid",
            Self::Validation { .. } => "validation-failed",
            Self::NotFound { .. } => "not-found",
            Self::AdrTransition { .. } => "adr-illegal-transition",
            Self::QueueFull => "queue-full",
            Self::VectorUnavailable { .. } => "vector-unavailable",
            Self::VectorSchemaMismatch { .. } => "vector-schema-mismatch",
            Self::EmbedderUnavailable { .. } => "embedder-unavailable",
            Self::IndexFailed { .. } => "index-failed",
            Self::Io { .. } | Self::Json { .. } | Self::Yaml { .. } | Self::Internal { .. } => {
                "internal-error"
            }
        }
    }

    /// Whether a background task failing with this error may be re-enqueued
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VectorUnavailable { .. } | Self::EmbedderUnavailable { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Internal {
            message: format!("HTTP client error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::config("x").kind(), "config-invalid");
        assert_eq!(Error::validation("x").kind(), "validation-failed");
        assert_eq!(Error::not_found("x").kind(), "not-found");
        assert_eq!(Error::QueueFull.kind(), "queue-full");
        assert_eq!(
            Error::vector_unavailable("down").kind(),
            "vector-unavailable"
        );
        assert_eq!(Error::internal("bug").kind(), "internal-error");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::vector_unavailable("down").is_retryable());
        assert!(Error::embedder_unavailable("down").is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::QueueFull.is_retryable());
    }
}
