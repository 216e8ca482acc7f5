/// Domain-specific error types for beansack
///
/// Enrichment failures are mostly absorbed as duds by the callers; these errors
/// surface from initialization, the store backends and the HTTP adapter.

#[derive(Debug, thiserror::Error)]
pub enum SackError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for SackError {
    fn from(e: sqlx::Error) -> Self {
        SackError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SackError {
    fn from(e: serde_json::Error) -> Self {
        SackError::Storage(format!("Document (de)serialization failed: {}", e))
    }
}

impl From<crate::embedding::EmbeddingError> for SackError {
    fn from(e: crate::embedding::EmbeddingError) -> Self {
        SackError::Embedding(e.to_string())
    }
}

impl From<crate::extraction::ExtractionError> for SackError {
    fn from(e: crate::extraction::ExtractionError) -> Self {
        SackError::Extraction(e.to_string())
    }
}

impl SackError {
    /// Helper to create validation errors with field names
    ///
    /// Example:
    /// ```
    /// use beansack::errors::SackError;
    /// let err = SackError::validation("topn", "topn must be an integer");
    /// ```
    pub fn validation(field: &str, message: &str) -> Self {
        SackError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }
}
