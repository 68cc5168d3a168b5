use crate::error::ConfigError;
use crate::settings::Config;

// Declare the modules that make up this crate.
pub mod error;
pub mod logging;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use logging::init_tracing;
pub use settings::{
    DecisionSettings, DrawdownSettings, EngineSettings, LoggingSettings, RiskSettings,
    ToleranceSettings, VenueSettings,
};

/// Prefix of environment variables that override file values,
/// e.g. `VIGIL__VENUE__API_SECRET`.
pub const ENV_PREFIX: &str = "VIGIL";

/// Loads the application configuration from `path` and the environment.
///
/// The file is optional; environment variables are layered on top so secrets
/// never have to live on disk. The result is validated before it is returned.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config = builder.try_deserialize::<Config>()?;
    config.validate()?;
    Ok(config)
}

/// Parses a TOML document without touching the environment.
pub fn load_config_from_str(toml: &str) -> Result<Config, ConfigError> {
    let config = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?
        .try_deserialize::<Config>()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::MarginMode;
    use rust_decimal_macros::dec;

    #[test]
    fn empty_document_yields_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.engine.reconcile_interval_secs, 20);
        assert_eq!(config.engine.decision_cooldown_secs, 120);
        assert_eq!(config.venue.cache_ttl_secs, 15);
        assert_eq!(config.tolerances.limit_price, dec!(0.001));
        assert_eq!(config.tolerances.market_fill, dec!(0.003));
        assert_eq!(config.tolerances.protective, dec!(0.01));
        assert_eq!(config.risk.taker_fee_pct, dec!(0.0004));
        assert!(!config.drawdown.enabled);
        assert!(config.decision.endpoint.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = load_config_from_str(
            r#"
            [engine]
            trader_id = "desk-7"
            margin_mode = "isolated"
            default_leverage = 20

            [tolerances]
            protective = 0.02

            [drawdown]
            enabled = true
            min_profit_pct = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.trader_id, "desk-7");
        assert_eq!(config.engine.margin_mode, MarginMode::Isolated);
        assert_eq!(config.engine.default_leverage, 20);
        assert_eq!(config.tolerances.protective, dec!(0.02));
        assert_eq!(config.tolerances.limit_price, dec!(0.001));
        assert!(config.drawdown.enabled);
        assert_eq!(config.drawdown.min_profit_pct, dec!(8));
    }

    #[test]
    fn duplicate_band_outside_range_is_rejected() {
        let err = load_config_from_str("[tolerances]\nduplicate_order = 0.05\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = load_config_from_str("[engine]\nreconcile_interval_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
