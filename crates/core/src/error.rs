//! Error types for knowbase.
//!
//! One error enum covers configuration, I/O, model collaborators, vector
//! backends and knowledge-base lifecycle failures. Per-file ingestion errors
//! never surface here; they are recorded on the file record instead.

use thiserror::Error;

/// Unified error type for knowbase.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedding or rerank model errors
    #[error("Model error: {0}")]
    Model(String),

    /// Knowledge base lifecycle errors
    #[error("Knowledge error: {0}")]
    Knowledge(String),

    /// Unknown knowledge base, file or folder id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Vector engine unreachable or answering with a failure
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Document-to-text conversion failed
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Operation stopped by a cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Whether this error reports a missing knowledge base, file or folder.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /// HTTP status a web layer should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::NotFound(_) => 404,
            AppError::Config(_) => 400,
            AppError::Conversion(_) => 422,
            AppError::BackendUnavailable(_) | AppError::Model(_) => 503,
            AppError::Cancelled(_) => 499,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
