//! Error types for the finance assistant

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Error, Debug)]
pub enum AssistantError {

    // =============================
    // Core Errors
    // =============================

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{message}")]
    NotFound {
        message: String,
        suggestions: Vec<String>,
    },

    #[error("{message}")]
    Ambiguous {
        message: String,
        candidates: Vec<String>,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssistantError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn not_found_with(message: impl Into<String>, suggestions: Vec<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            suggestions,
        }
    }

    pub fn ambiguous(message: impl Into<String>, candidates: Vec<String>) -> Self {
        Self::Ambiguous {
            message: message.into(),
            candidates,
        }
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Http(_))
    }
}

impl From<sqlx::Error> for AssistantError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(AssistantError::Upstream("timeout".into()).is_retryable());
        assert!(!AssistantError::Validation("empty message".into()).is_retryable());
        assert!(!AssistantError::not_found("no such budget").is_retryable());
    }
}
