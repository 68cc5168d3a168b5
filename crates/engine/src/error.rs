use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API client error: {0}")]
    ApiClient(#[from] api_client::ApiError),

    #[error("Database error: {0}")]
    Database(#[from] database::DbError),

    #[error("Risk management error: {0}")]
    Risk(#[from] risk::RiskError),

    #[error("Execution error: {0}")]
    Executor(#[from] executor::ExecutorError),

    #[error("Event error: {0}")]
    Events(#[from] events::EventsError),

    #[error("Decision provider error: {0}")]
    DecisionProvider(String),

    #[error("Decision provider transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Strategy '{0}' is not registered with the engine.")]
    StrategyNotFound(String),

    #[error("Serialization/deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl EngineError {
    /// Failures the next natural cycle may clear on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ApiClient(e) => e.is_retryable(),
            EngineError::Executor(e) => e.is_retryable(),
            EngineError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
