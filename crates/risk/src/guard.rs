use crate::error::RiskError;
use configuration::RiskSettings;
use core_types::{Decision, RiskCheckResult};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

/// The pre-trade margin check applied to every margin-consuming decision.
///
/// The guard never talks to the venue. It sees the available balance the
/// caller observed and decides locally, so a rejection costs no request.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    params: RiskSettings,
}

impl RiskGuard {
    /// Creates a new `RiskGuard` with the given configuration parameters.
    pub fn new(params: RiskSettings) -> Result<Self, RiskError> {
        if params.taker_fee_pct < dec!(0) || params.taker_fee_pct >= dec!(1) {
            return Err(RiskError::InvalidParameters(
                "taker_fee_pct must be between 0 and 1".to_string(),
            ));
        }
        if params.capacity_buffer <= dec!(0) || params.capacity_buffer > dec!(1) {
            return Err(RiskError::InvalidParameters(
                "capacity_buffer must be in (0, 1]".to_string(),
            ));
        }
        Ok(Self { params })
    }

    /// Checks `decision` against `available` margin at `leverage`.
    ///
    /// Actions that lock no new margin pass untouched. For the others the
    /// target notional is first shrunk to `capacity_buffer * available *
    /// leverage` when its margin plus the estimated taker fee does not fit in
    /// `available`, then rejected if the shrunk order still does not fit.
    pub fn check(
        &self,
        decision: &Decision,
        available: Decimal,
        leverage: u32,
    ) -> Result<RiskCheckResult, RiskError> {
        if !decision.action.consumes_margin() {
            return Ok(RiskCheckResult {
                passed: true,
                reason: "no margin required".to_string(),
                notional: decision.position_size_usd.unwrap_or(Decimal::ZERO),
                required_margin: Decimal::ZERO,
                estimated_fee: Decimal::ZERO,
            });
        }

        // --- 1. Validation ---
        if leverage == 0 {
            return Err(RiskError::InvalidLeverage(leverage));
        }
        let requested = decision
            .position_size_usd
            .ok_or_else(|| RiskError::MissingNotional(decision.action.to_string()))?;
        if requested <= Decimal::ZERO {
            return Err(RiskError::InvalidNotional(requested));
        }
        let leverage = Decimal::from(leverage);

        if available <= Decimal::ZERO {
            return Ok(RiskCheckResult {
                passed: false,
                reason: format!("no available margin ({})", available),
                notional: requested,
                required_margin: requested / leverage,
                estimated_fee: requested * self.params.taker_fee_pct,
            });
        }

        // --- 2. Shrink to capacity ---
        let fee_pct = self.params.taker_fee_pct;
        let cost = |notional: Decimal| notional / leverage + notional * fee_pct;
        let capacity = available * leverage;
        let (notional, mut reason) = if cost(requested) > available {
            let shrunk = (capacity * self.params.capacity_buffer).round_dp(8).min(requested);
            (
                shrunk,
                format!("notional {} exceeds capacity {}, shrunk to {}", requested, capacity, shrunk),
            )
        } else {
            (requested, "within capacity".to_string())
        };

        // --- 3. Margin + fee check ---
        let required_margin = notional / leverage;
        let estimated_fee = notional * fee_pct;
        let passed = required_margin + estimated_fee <= available;
        if !passed {
            reason = format!(
                "required margin {} + fee {} exceeds available {}",
                required_margin.round_dp(8),
                estimated_fee.round_dp(8),
                available
            );
        }

        debug!(
            action = %decision.action,
            symbol = %decision.symbol,
            %requested,
            %notional,
            %available,
            passed,
            "risk check"
        );

        Ok(RiskCheckResult {
            passed,
            reason,
            notional,
            required_margin,
            estimated_fee,
        })
    }
}
