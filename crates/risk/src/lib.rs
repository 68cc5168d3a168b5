//! Pre-trade margin checks.

pub mod error;
pub mod guard;

pub use error::RiskError;
pub use guard::RiskGuard;
