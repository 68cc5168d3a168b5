use api_client::ApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The decision is missing a field its action needs, or refers to state
    /// that does not exist. Only this decision is aborted.
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("Rejected before reaching the venue: {0}")]
    Rejected(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Api(e) if e.is_retryable())
    }
}
