//! Error types for the valuation engine

use thiserror::Error;

/// Result type alias for valuation operations
pub type Result<T> = std::result::Result<T, ValuationError>;

#[derive(Error, Debug)]
pub enum ValuationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    /// Missing or malformed manual figures / missing file.
    /// The session stays in CollectingInput.
    #[error("Input validation error: {0}")]
    InputValidation(String),

    /// Remote analysis call failed after retries were exhausted.
    /// The message is the last backend error, passed through verbatim.
    #[error("Remote call error: {0}")]
    RemoteCall(String),

    /// finalize() was called while clarification questions remain unanswered.
    #[error("Clarification incomplete: {0}")]
    ClarificationIncomplete(String),

    /// Remote payload carried missing or non-numeric method fields.
    /// Fatal for the session; never defaulted to zero.
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
