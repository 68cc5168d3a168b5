use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::enums::{
    DecisionAction, Direction, OrderCategory, OrderKind, OrderSide, Phase, PointKind, PositionSide,
};
use crate::error::CoreError;

/// Share of capital reserved for the entry point when the ladder has add points.
const ENTRY_SHARE_WITH_ADDS: Decimal = dec!(0.4);

/// One add rung as declared by the strategy author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddPoint {
    pub price: Decimal,
    /// Declared fraction of capital. Normalized by [`Strategy::expected_points`].
    #[serde(default)]
    pub percent: Decimal,
}

/// A declared trading intent. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    #[serde(default)]
    pub add_points: Vec<AddPoint>,
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profits: Vec<Decimal>,
    /// Recommended leverage. The engine default applies when absent.
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub rationale: String,
    /// Fills are only credited from this instant on.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl Strategy {
    /// Rejects strategies the engine cannot act on safely.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidInput("id".to_string(), "empty".to_string()));
        }
        if self.symbol.trim().is_empty() {
            return Err(CoreError::InvalidInput("symbol".to_string(), "empty".to_string()));
        }
        if self.entry_price <= Decimal::ZERO {
            return Err(CoreError::InvalidInput(
                "entry_price".to_string(),
                self.entry_price.to_string(),
            ));
        }
        if self.stop_loss <= Decimal::ZERO {
            return Err(CoreError::InvalidInput(
                "stop_loss".to_string(),
                self.stop_loss.to_string(),
            ));
        }
        if let Some(point) = self
            .add_points
            .iter()
            .find(|p| p.price <= Decimal::ZERO || p.percent.is_sign_negative())
        {
            return Err(CoreError::InvalidInput(
                "add_points".to_string(),
                format!("price {} percent {}", point.price, point.percent),
            ));
        }
        if let Some(tp) = self.take_profits.iter().find(|tp| **tp <= Decimal::ZERO) {
            return Err(CoreError::InvalidInput("take_profits".to_string(), tp.to_string()));
        }
        if self.leverage == Some(0) {
            return Err(CoreError::InvalidInput("leverage".to_string(), "0".to_string()));
        }
        Ok(())
    }

    /// Derives the price ladder. Percents always sum to exactly 1.
    ///
    /// The entry takes 40% when add points exist (100% otherwise). Add points
    /// share the remaining 60% in proportion to their declared percents, or
    /// equally when nothing was declared.
    pub fn expected_points(&self) -> Vec<ExpectedPricePoint> {
        let mut points = Vec::with_capacity(self.add_points.len() + 1);
        if self.add_points.is_empty() {
            points.push(ExpectedPricePoint {
                kind: PointKind::Entry,
                price: self.entry_price,
                percent: Decimal::ONE,
            });
            return points;
        }

        points.push(ExpectedPricePoint {
            kind: PointKind::Entry,
            price: self.entry_price,
            percent: ENTRY_SHARE_WITH_ADDS,
        });

        let add_share = Decimal::ONE - ENTRY_SHARE_WITH_ADDS;
        let declared: Decimal = self.add_points.iter().map(|p| p.percent).sum();
        let count = Decimal::from(self.add_points.len());
        let mut allotted = Decimal::ZERO;

        for (idx, add) in self.add_points.iter().enumerate() {
            let is_last = idx + 1 == self.add_points.len();
            let percent = if is_last {
                // The last rung absorbs rounding so the ladder sums to one.
                add_share - allotted
            } else if declared == add_share {
                add.percent
            } else if declared > Decimal::ZERO {
                add_share * add.percent / declared
            } else {
                add_share / count
            };
            allotted += percent;
            points.push(ExpectedPricePoint {
                kind: PointKind::Add(idx + 1),
                price: add.price,
                percent,
            });
        }
        points
    }
}

/// A rung of the ladder derived from a strategy. Regenerated every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedPricePoint {
    pub kind: PointKind,
    pub price: Decimal,
    pub percent: Decimal,
}

/// A live position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub liquidation_price: Decimal,
    /// Margin currently committed to the position.
    pub margin: Decimal,
}

impl Position {
    /// Unrealized PnL as a percentage of margin (5 means 5%).
    pub fn unrealized_pnl_pct(&self) -> Decimal {
        if self.margin <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.unrealized_pnl / self.margin * Decimal::ONE_HUNDRED
    }

    pub fn is_open(&self) -> bool {
        !self.quantity.is_zero()
    }
}

/// A resting order, normalized at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    /// Limit price for book orders, trigger price for plan orders.
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: String,
    pub category: OrderCategory,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrderType {
    Limit,
    Market,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Filled,
    PartiallyFilled,
    Cancelled,
    Live,
    Other,
}

/// A historical order. The only authority for "this point already executed",
/// since a filled order disappears from the open-order list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHistoryRecord {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: HistoryOrderType,
    /// Limit price. Market orders usually have none.
    pub price: Option<Decimal>,
    pub average_price: Option<Decimal>,
    pub status: HistoryStatus,
    pub timestamp: DateTime<Utc>,
}

impl OrderHistoryRecord {
    /// A record counts as a fill when the venue says so or when it carries an
    /// average fill price.
    pub fn is_fill(&self) -> bool {
        matches!(self.status, HistoryStatus::Filled | HistoryStatus::PartiallyFilled)
            || self.average_price.is_some_and(|p| p > Decimal::ZERO)
    }
}

/// The futures account balance in the margin coin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub margin_coin: String,
    pub equity: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
}

/// A resting limit order to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub client_order_id: String,
}

/// The tracked lifecycle of one strategy for one trader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyExecutionState {
    pub trader_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub phase: Phase,
    pub entry_price: Option<Decimal>,
    pub quantity: Decimal,
    pub realized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl StrategyExecutionState {
    pub fn new(trader_id: &str, strategy_id: &str, symbol: &str) -> Self {
        Self {
            trader_id: trader_id.to_string(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            phase: Phase::Waiting,
            entry_price: None,
            quantity: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }
}

/// One corrective action, proposed by the decision provider or the fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default)]
    pub symbol: String,
    /// Limit price, or reference price for market actions.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Target notional in the quote currency.
    #[serde(default)]
    pub position_size_usd: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// Side of the position a close/protective action refers to.
    #[serde(default)]
    pub position_side: Option<PositionSide>,
    /// Order side for limit orders. Derived from the strategy direction when absent.
    #[serde(default)]
    pub side: Option<OrderSide>,
    /// Target order for `cancel_order`.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Fraction of the position to close for `partial_close` (0, 1].
    #[serde(default)]
    pub close_ratio: Option<Decimal>,
    #[serde(default)]
    pub reasoning: String,
}

impl Decision {
    pub fn new(action: DecisionAction, symbol: &str) -> Self {
        Self {
            action,
            symbol: symbol.to_string(),
            price: None,
            position_size_usd: None,
            leverage: None,
            stop_loss: None,
            take_profit: None,
            position_side: None,
            side: None,
            order_id: None,
            close_ratio: None,
            reasoning: String::new(),
        }
    }

    pub fn hold(symbol: &str, reasoning: &str) -> Self {
        let mut decision = Self::new(DecisionAction::Hold, symbol);
        decision.reasoning = reasoning.to_string();
        decision
    }

    pub fn place_limit(
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        notional: Decimal,
        leverage: u32,
    ) -> Self {
        let mut decision = Self::new(DecisionAction::PlaceLimitOrder, symbol);
        decision.side = Some(side);
        decision.price = Some(price);
        decision.position_size_usd = Some(notional);
        decision.leverage = Some(leverage);
        decision
    }

    pub fn set_stop_loss(symbol: &str, position_side: PositionSide, trigger: Decimal) -> Self {
        let mut decision = Self::new(DecisionAction::SetStopLoss, symbol);
        decision.position_side = Some(position_side);
        decision.stop_loss = Some(trigger);
        decision
    }

    pub fn set_take_profit(symbol: &str, position_side: PositionSide, trigger: Decimal) -> Self {
        let mut decision = Self::new(DecisionAction::SetTakeProfit, symbol);
        decision.position_side = Some(position_side);
        decision.take_profit = Some(trigger);
        decision
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

/// Outcome of the risk guard for one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckResult {
    pub passed: bool,
    pub reason: String,
    /// The notional to use, possibly shrunk to fit available capacity.
    pub notional: Decimal,
    pub required_margin: Decimal,
    pub estimated_fee: Decimal,
}

/// Persisted outcome of one dispatched (or locally rejected) action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub trader_id: String,
    pub strategy_id: Option<String>,
    pub action: DecisionAction,
    pub symbol: String,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted record of one decision-provider consultation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub trader_id: String,
    pub strategy_id: String,
    pub report: String,
    pub decisions: Vec<Decision>,
    pub used_fallback: bool,
    pub provider_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An order placed on behalf of a strategy, kept for cross-restart idempotency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOrderRecord {
    pub trader_id: String,
    pub strategy_id: String,
    pub venue_order_id: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(adds: Vec<AddPoint>) -> Strategy {
        Strategy {
            id: "s-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(60000),
            add_points: adds,
            stop_loss: dec!(58000),
            take_profits: vec![dec!(65000)],
            leverage: Some(10),
            rationale: String::new(),
            received_at: Utc::now(),
        }
    }

    fn total(points: &[ExpectedPricePoint]) -> Decimal {
        points.iter().map(|p| p.percent).sum()
    }

    #[test]
    fn entry_only_takes_everything() {
        let points = strategy(vec![]).expected_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].kind, PointKind::Entry);
        assert_eq!(points[0].percent, Decimal::ONE);
    }

    #[test]
    fn declared_add_percents_are_kept_when_they_fill_the_remainder() {
        let points = strategy(vec![
            AddPoint { price: dec!(61000), percent: dec!(0.3) },
            AddPoint { price: dec!(62000), percent: dec!(0.3) },
        ])
        .expected_points();
        let shares: Vec<_> = points.iter().map(|p| (p.kind, p.price, p.percent)).collect();
        assert_eq!(
            shares,
            vec![
                (PointKind::Entry, dec!(60000), dec!(0.4)),
                (PointKind::Add(1), dec!(61000), dec!(0.3)),
                (PointKind::Add(2), dec!(62000), dec!(0.3)),
            ]
        );
    }

    #[test]
    fn odd_declarations_are_rescaled_to_sum_to_one() {
        let points = strategy(vec![
            AddPoint { price: dec!(61000), percent: dec!(1) },
            AddPoint { price: dec!(62000), percent: dec!(1) },
            AddPoint { price: dec!(63000), percent: dec!(1) },
            AddPoint { price: dec!(64000), percent: dec!(4) },
        ])
        .expected_points();
        assert_eq!(total(&points), Decimal::ONE);
        assert!(points[4].percent > points[1].percent);
    }

    #[test]
    fn undeclared_adds_split_evenly() {
        let points = strategy(vec![
            AddPoint { price: dec!(61000), percent: Decimal::ZERO },
            AddPoint { price: dec!(62000), percent: Decimal::ZERO },
            AddPoint { price: dec!(63000), percent: Decimal::ZERO },
        ])
        .expected_points();
        assert_eq!(points[1].percent, dec!(0.2));
        assert_eq!(total(&points), Decimal::ONE);
    }

    #[test]
    fn validation_rejects_non_positive_prices() {
        let mut s = strategy(vec![]);
        s.entry_price = Decimal::ZERO;
        assert!(s.validate().is_err());

        let mut s = strategy(vec![AddPoint { price: dec!(-1), percent: dec!(0.1) }]);
        assert!(s.validate().is_err());
        s.add_points.clear();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn history_fill_detection() {
        let mut record = OrderHistoryRecord {
            id: "1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: HistoryOrderType::Limit,
            price: Some(dec!(60000)),
            average_price: None,
            status: HistoryStatus::Cancelled,
            timestamp: Utc::now(),
        };
        assert!(!record.is_fill());
        record.average_price = Some(dec!(60010));
        assert!(record.is_fill());
        record.average_price = None;
        record.status = HistoryStatus::PartiallyFilled;
        assert!(record.is_fill());
    }

    #[test]
    fn decisions_deserialize_with_sparse_fields() {
        let raw = r#"{"action":"set_take_profit","take_profit":"65000","reasoning":"tp missing"}"#;
        let decision: Decision = serde_json::from_str(raw).unwrap();
        assert_eq!(decision.action, DecisionAction::SetTakeProfit);
        assert_eq!(decision.take_profit, Some(dec!(65000)));
        assert!(decision.symbol.is_empty());
    }

    #[test]
    fn pnl_pct_is_relative_to_margin() {
        let position = Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.1),
            entry_price: dec!(60000),
            mark_price: dec!(61200),
            unrealized_pnl: dec!(120),
            leverage: 10,
            liquidation_price: dec!(54000),
            margin: dec!(600),
        };
        assert_eq!(position.unrealized_pnl_pct(), dec!(20));
    }
}
