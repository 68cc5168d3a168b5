use core_types::MarginMode;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// The root configuration structure for the entire application.
///
/// Every section has defaults, so an empty `config.toml` plus credentials in
/// the environment is a valid setup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSettings,
    pub venue: VenueSettings,
    pub tolerances: ToleranceSettings,
    pub risk: RiskSettings,
    pub drawdown: DrawdownSettings,
    pub decision: DecisionSettings,
    pub logging: LoggingSettings,
}

/// Scheduling and identity of the reconciliation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// The account owner the engine acts for. Part of every persisted key.
    pub trader_id: String,
    /// Cadence of reconciliation passes.
    pub reconcile_interval_secs: u64,
    /// Minimum spacing between two decision-provider calls for one strategy.
    pub decision_cooldown_secs: u64,
    /// Cadence of the zombie-strategy audit.
    pub audit_interval_secs: u64,
    /// How far back order history is read when looking for fills.
    pub history_lookback_hours: i64,
    /// Used when a strategy does not recommend a leverage.
    pub default_leverage: u32,
    pub margin_mode: MarginMode,
    /// Optional JSON file with strategies to publish at startup.
    pub strategy_file: Option<PathBuf>,
    /// Starting balance for the simulated venue.
    pub paper_balance: Decimal,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            trader_id: "default".to_string(),
            reconcile_interval_secs: 20,
            decision_cooldown_secs: 120,
            audit_interval_secs: 1800,
            history_lookback_hours: 72,
            default_leverage: 5,
            margin_mode: MarginMode::Crossed,
            strategy_file: None,
            paper_balance: dec!(10000),
        }
    }
}

impl EngineSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn decision_cooldown(&self) -> Duration {
        Duration::from_secs(self.decision_cooldown_secs)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }
}

/// Connection details for the exchange account.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VenueSettings {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
    pub product_type: String,
    pub margin_coin: String,
    pub request_timeout_secs: u64,
    /// Maximum age of a cached balance/position read.
    pub cache_ttl_secs: u64,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            name: "bitget".to_string(),
            base_url: "https://api.bitget.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: String::new(),
            product_type: "USDT-FUTURES".to_string(),
            margin_coin: "USDT".to_string(),
            request_timeout_secs: 30,
            cache_ttl_secs: 15,
        }
    }
}

impl VenueSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Relative price tolerances, as fractions (0.001 = 0.1%).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToleranceSettings {
    /// Position entry price or a historical limit price against a ladder point.
    pub limit_price: Decimal,
    /// Average fill price of a market execution against a ladder point.
    pub market_fill: Decimal,
    /// Stop-loss and take-profit trigger prices.
    pub protective: Decimal,
    /// Band used by the duplicate-intent guard and the open-order de-duplication.
    pub duplicate_order: Decimal,
}

impl Default for ToleranceSettings {
    fn default() -> Self {
        Self {
            limit_price: dec!(0.001),
            market_fill: dec!(0.003),
            protective: dec!(0.01),
            duplicate_order: dec!(0.005),
        }
    }
}

/// Parameters of the pre-trade risk guard.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskSettings {
    /// The trading fees charged by the exchange for a "taker" order.
    /// 0.0004 corresponds to 0.04%.
    pub taker_fee_pct: Decimal,
    /// Fraction of `available * leverage` an oversized order is shrunk to.
    pub capacity_buffer: Decimal,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            taker_fee_pct: dec!(0.0004),
            capacity_buffer: dec!(0.95),
        }
    }
}

/// The emergency retracement rule. Off unless explicitly enabled.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrawdownSettings {
    pub enabled: bool,
    pub check_interval_secs: u64,
    /// Current PnL (% of margin) must exceed this before the rule can fire.
    pub min_profit_pct: Decimal,
    /// Fraction of the peak PnL given back that triggers the close.
    pub max_retracement: Decimal,
}

impl Default for DrawdownSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: 60,
            min_profit_pct: dec!(5),
            max_retracement: dec!(0.4),
        }
    }
}

impl DrawdownSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Where the decision provider lives and how it is prompted on retry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecisionSettings {
    /// HTTP endpoint of the provider. Without one, every consultation declines
    /// and the deterministic fallback governs.
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    /// Appended to the instructions when the first answer was only hold/wait.
    pub retry_directive: String,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
            retry_directive: "Divergence is confirmed by venue state. Holding is not acceptable: \
                              return the concrete orders that restore the declared strategy."
                .to_string(),
        }
    }
}

impl DecisionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// When set, logs are also written to a daily rolling file in this directory.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "vigil.log".to_string(),
        }
    }
}

impl Config {
    /// Checks every value that would make the engine unsafe or meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.engine.trader_id.trim().is_empty() {
            return fail("engine.trader_id must not be empty".to_string());
        }
        if self.engine.reconcile_interval_secs == 0 || self.engine.audit_interval_secs == 0 {
            return fail("engine intervals must be greater than 0".to_string());
        }
        if self.engine.history_lookback_hours <= 0 {
            return fail("engine.history_lookback_hours must be greater than 0".to_string());
        }
        if self.engine.default_leverage == 0 {
            return fail("engine.default_leverage must be at least 1".to_string());
        }
        if self.venue.request_timeout_secs == 0 {
            return fail("venue.request_timeout_secs must be greater than 0".to_string());
        }

        let t = &self.tolerances;
        for (name, value) in [
            ("limit_price", t.limit_price),
            ("market_fill", t.market_fill),
            ("protective", t.protective),
        ] {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                return fail(format!("tolerances.{} must be between 0 and 1", name));
            }
        }
        if t.duplicate_order < dec!(0.001) || t.duplicate_order > dec!(0.01) {
            return fail("tolerances.duplicate_order must be between 0.001 and 0.01".to_string());
        }

        if self.risk.taker_fee_pct.is_sign_negative() || self.risk.taker_fee_pct >= Decimal::ONE {
            return fail("risk.taker_fee_pct must be between 0 and 1".to_string());
        }
        if self.risk.capacity_buffer <= Decimal::ZERO || self.risk.capacity_buffer > Decimal::ONE {
            return fail("risk.capacity_buffer must be in (0, 1]".to_string());
        }

        let d = &self.drawdown;
        if d.enabled && d.check_interval_secs == 0 {
            return fail("drawdown.check_interval_secs must be greater than 0".to_string());
        }
        if d.max_retracement <= Decimal::ZERO || d.max_retracement > Decimal::ONE {
            return fail("drawdown.max_retracement must be in (0, 1]".to_string());
        }
        if d.min_profit_pct.is_sign_negative() {
            return fail("drawdown.min_profit_pct must not be negative".to_string());
        }
        Ok(())
    }
}
