use thiserror::Error;

use crate::Capability;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Venue credentials are missing or malformed: {0}")]
    InvalidCredentials(String),

    #[error("The venue does not support {0}")]
    Unsupported(Capability),

    #[error("HTTP transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("The request to {0} timed out")]
    Timeout(String),

    #[error("The venue rejected the request: [{code}] {msg}")]
    Venue { code: String, msg: String },

    #[error("Failed to deserialize the API response: {0}")]
    Deserialization(String),

    #[error("Invalid data format from API: {0}")]
    InvalidData(String),
}

impl ApiError {
    /// Transport failures and timeouts are worth another attempt on the next
    /// cycle; everything else will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Timeout(_) => true,
            _ => false,
        }
    }
}

