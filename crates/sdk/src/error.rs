//! Error types for the shoal SDK.

use serde::{Deserialize, Serialize};

/// Result type for SDK operations.
pub type ShoalResult<T> = Result<T, ShoalError>;

/// Error types that can occur when using the shoal SDK.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        details: Option<String>,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection timeout.
    #[error("Request timed out")]
    Timeout,

    /// Resource not found, e.g. an unknown dag.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The watched dag ended in failure.
    #[error("Sorry, task '{dag}' failed at stage '{node}'")]
    DagFailed {
        dag: String,
        node: String,
        task: Option<String>,
    },

    /// Gave up waiting for the agent to confirm a final state.
    #[error("Timed out waiting: {0}")]
    WaitTimeout(String),
}

impl ShoalError {
    /// Check if this error is a transient fetch failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Create an error from a status code and response body.
    pub fn from_response(status: u16, body: &str) -> Self {
        let (message, details) = match serde_json::from_str::<ErrorResponse>(body) {
            Ok(error_response) => (error_response.error, error_response.details),
            Err(_) => (body.to_string(), None),
        };

        if status == 404 {
            return Self::NotFound(message);
        }

        Self::Api {
            status,
            message,
            details,
        }
    }
}

/// Error response from the agent API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
