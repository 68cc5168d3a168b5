use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RiskError {
    #[error("Risk parameters from configuration are invalid: {0}")]
    InvalidParameters(String),

    #[error("Decision {0} carries no position size")]
    MissingNotional(String),

    #[error("Leverage must be at least 1, got {0}")]
    InvalidLeverage(u32),

    #[error("The requested notional ({0}) is zero or negative.")]
    InvalidNotional(Decimal),
}
