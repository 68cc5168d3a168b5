//! Bitget v2 mix wire records.
//!
//! Bitget encodes every number as a string and signals business failures in
//! an envelope rather than through the HTTP status. Everything in this module
//! is parsed exactly once and converted into the `core-types` vocabulary; no
//! raw JSON leaves the adapter.

use chrono::{DateTime, TimeZone, Utc};
use core_types::{
    Balance, HistoryOrderType, HistoryStatus, OpenOrder, OrderAck, OrderCategory,
    OrderHistoryRecord, OrderKind, OrderSide, Position, PositionSide,
};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::error::ApiError;

/// The `code` Bitget returns for a successful call.
pub const SUCCESS_CODE: &str = "00000";

/// Codes Bitget uses when the requested change is already in effect.
const BENIGN_CODES: &[&str] = &["22002", "40768", "43001", "43025", "45110"];

/// Message fragments with the same meaning, matched case-insensitively.
const BENIGN_MESSAGES: &[&str] = &[
    "no order to cancel",
    "order does not exist",
    "order not exist",
    "no position to close",
    "no position",
    "margin mode unchanged",
    "margin mode is the same",
    "leverage unchanged",
    "leverage is the same",
    "no need to change",
];

/// Whether a business error only says "nothing to do".
pub fn is_benign(code: &str, msg: &str) -> bool {
    if BENIGN_CODES.contains(&code) {
        return true;
    }
    let msg = msg.to_lowercase();
    BENIGN_MESSAGES.iter().any(|fragment| msg.contains(fragment))
}

/// The common response wrapper `{code, msg, requestTime, data}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(deserialize_with = "string_or_number")]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub request_time: Option<i64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A normalized envelope.
#[derive(Debug)]
pub enum Outcome {
    /// Success, with the raw `data` member (possibly `null`).
    Data(serde_json::Value),
    /// A business error that only means the change was already in effect.
    NoOp(String),
}

impl Envelope {
    pub fn into_outcome(self) -> Result<Outcome, ApiError> {
        if self.code == SUCCESS_CODE {
            return Ok(Outcome::Data(self.data));
        }
        if is_benign(&self.code, &self.msg) {
            return Ok(Outcome::NoOp(self.msg));
        }
        Err(ApiError::Venue {
            code: self.code,
            msg: self.msg,
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

// --- Field helpers ---

pub(crate) fn decimal(field: &str, raw: &str) -> Result<Decimal, ApiError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| ApiError::Deserialization(format!("{} = {:?}: {}", field, raw, e)))
}

/// Empty strings are how Bitget says "not applicable".
pub(crate) fn optional_decimal(field: &str, raw: &str) -> Result<Option<Decimal>, ApiError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    decimal(field, raw).map(Some)
}

fn decimal_or_zero(field: &str, raw: &str) -> Result<Decimal, ApiError> {
    Ok(optional_decimal(field, raw)?.unwrap_or(Decimal::ZERO))
}

fn millis(field: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let ms = raw
        .trim()
        .parse::<i64>()
        .map_err(|e| ApiError::Deserialization(format!("{} = {:?}: {}", field, raw, e)))?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ApiError::InvalidData(format!("Invalid {}: {}", field, ms)))
}

fn order_side(raw: &str) -> Result<OrderSide, ApiError> {
    match raw {
        "buy" => Ok(OrderSide::Buy),
        "sell" => Ok(OrderSide::Sell),
        other => Err(ApiError::InvalidData(format!("Unknown order side: {}", other))),
    }
}

fn position_side(raw: &str) -> Option<PositionSide> {
    match raw {
        "long" => Some(PositionSide::Long),
        "short" => Some(PositionSide::Short),
        _ => None,
    }
}

/// In hedge mode Bitget reports a close with the side of the position it
/// reduces (`buy` + `close` closes a long). Normalize to the direction the
/// order actually trades.
fn effective_side(side: &str, trade_side: &str) -> Result<OrderSide, ApiError> {
    let side = order_side(side)?;
    Ok(if trade_side == "close" { side.opposite() } else { side })
}

// --- Account ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub margin_coin: String,
    #[serde(default)]
    pub account_equity: String,
    #[serde(default)]
    pub available: String,
    #[serde(default)]
    pub locked: String,
}

impl TryFrom<AccountRecord> for Balance {
    type Error = ApiError;

    fn try_from(raw: AccountRecord) -> Result<Self, Self::Error> {
        Ok(Balance {
            equity: decimal_or_zero("accountEquity", &raw.account_equity)?,
            available: decimal_or_zero("available", &raw.available)?,
            locked: decimal_or_zero("locked", &raw.locked)?,
            margin_coin: raw.margin_coin,
        })
    }
}

// --- Positions ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub symbol: String,
    pub hold_side: String,
    pub total: String,
    #[serde(default)]
    pub open_price_avg: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default, rename = "unrealizedPL")]
    pub unrealized_pl: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub liquidation_price: String,
    #[serde(default)]
    pub margin_size: String,
}

impl TryFrom<PositionRecord> for Position {
    type Error = ApiError;

    fn try_from(raw: PositionRecord) -> Result<Self, Self::Error> {
        let side = position_side(&raw.hold_side)
            .ok_or_else(|| ApiError::InvalidData(format!("Unknown holdSide: {}", raw.hold_side)))?;
        let leverage = raw
            .leverage
            .trim()
            .parse::<Decimal>()
            .ok()
            .and_then(|l| l.trunc().to_u32())
            .unwrap_or(1);
        Ok(Position {
            side,
            quantity: decimal("total", &raw.total)?,
            entry_price: decimal_or_zero("openPriceAvg", &raw.open_price_avg)?,
            mark_price: decimal_or_zero("markPrice", &raw.mark_price)?,
            unrealized_pnl: decimal_or_zero("unrealizedPL", &raw.unrealized_pl)?,
            leverage,
            liquidation_price: decimal_or_zero("liquidationPrice", &raw.liquidation_price)?,
            margin: decimal_or_zero("marginSize", &raw.margin_size)?,
            symbol: raw.symbol,
        })
    }
}

// --- Orders ---

/// List endpoints wrap their rows as `{entrustedList: [...] | null, endId}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrustedList<T> {
    pub entrusted_list: Option<Vec<T>>,
}

impl<T> Default for EntrustedList<T> {
    fn default() -> Self {
        Self { entrusted_list: None }
    }
}

impl<T> EntrustedList<T> {
    pub fn into_rows(self) -> Vec<T> {
        self.entrusted_list.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrderRecord {
    pub symbol: String,
    pub order_id: String,
    #[serde(default)]
    pub price: String,
    pub size: String,
    pub side: String,
    #[serde(default)]
    pub trade_side: String,
    #[serde(default)]
    pub status: String,
    pub c_time: String,
}

impl TryFrom<PendingOrderRecord> for OpenOrder {
    type Error = ApiError;

    fn try_from(raw: PendingOrderRecord) -> Result<Self, Self::Error> {
        Ok(OpenOrder {
            kind: OrderKind::Limit,
            side: effective_side(&raw.side, &raw.trade_side)?,
            price: decimal_or_zero("price", &raw.price)?,
            quantity: decimal("size", &raw.size)?,
            category: OrderCategory::Normal,
            created_at: millis("cTime", &raw.c_time)?,
            id: raw.order_id,
            symbol: raw.symbol,
            status: raw.status,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOrderRecord {
    pub symbol: String,
    pub order_id: String,
    pub plan_type: String,
    pub trigger_price: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub plan_status: String,
    pub c_time: String,
}

/// Maps Bitget's plan types onto the protective kinds the engine reasons about.
pub fn plan_kind(plan_type: &str) -> Option<OrderKind> {
    match plan_type {
        "pos_loss" | "loss_plan" => Some(OrderKind::StopLoss),
        "pos_profit" | "profit_plan" => Some(OrderKind::TakeProfit),
        _ => None,
    }
}

impl PlanOrderRecord {
    /// `None` for trigger orders that are not stop-loss or take-profit.
    pub fn into_open_order(self) -> Result<Option<OpenOrder>, ApiError> {
        let Some(kind) = plan_kind(&self.plan_type) else {
            return Ok(None);
        };
        // A protective order always trades against the position it guards.
        let side = match position_side(&self.pos_side) {
            Some(pos) => pos.closing_side(),
            None => order_side(&self.side)?,
        };
        Ok(Some(OpenOrder {
            kind,
            side,
            price: decimal("triggerPrice", &self.trigger_price)?,
            quantity: decimal_or_zero("size", &self.size)?,
            category: OrderCategory::Plan,
            created_at: millis("cTime", &self.c_time)?,
            id: self.order_id,
            symbol: self.symbol,
            status: self.plan_status,
        }))
    }
}

// --- History ---

fn history_status(raw: &str) -> HistoryStatus {
    match raw {
        "filled" | "executed" => HistoryStatus::Filled,
        "partially_filled" | "partial-fill" => HistoryStatus::PartiallyFilled,
        "canceled" | "cancelled" => HistoryStatus::Cancelled,
        "live" | "new" | "init" | "not_trigger" => HistoryStatus::Live,
        _ => HistoryStatus::Other,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOrderRecord {
    pub symbol: String,
    pub order_id: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub price_avg: String,
    pub status: String,
    pub side: String,
    #[serde(default)]
    pub trade_side: String,
    pub order_type: String,
    pub c_time: String,
}

impl TryFrom<HistoryOrderRecord> for OrderHistoryRecord {
    type Error = ApiError;

    fn try_from(raw: HistoryOrderRecord) -> Result<Self, Self::Error> {
        let order_type = match raw.order_type.as_str() {
            "limit" => HistoryOrderType::Limit,
            "market" => HistoryOrderType::Market,
            other => {
                return Err(ApiError::InvalidData(format!("Unknown orderType: {}", other)));
            }
        };
        Ok(OrderHistoryRecord {
            side: effective_side(&raw.side, &raw.trade_side)?,
            order_type,
            price: optional_decimal("price", &raw.price)?.filter(|p| !p.is_zero()),
            average_price: optional_decimal("priceAvg", &raw.price_avg)?.filter(|p| !p.is_zero()),
            status: history_status(&raw.status),
            timestamp: millis("cTime", &raw.c_time)?,
            id: raw.order_id,
            symbol: raw.symbol,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanHistoryRecord {
    pub symbol: String,
    pub order_id: String,
    pub trigger_price: String,
    #[serde(default)]
    pub price_avg: String,
    pub plan_status: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub trade_side: String,
    pub c_time: String,
}

impl TryFrom<PlanHistoryRecord> for OrderHistoryRecord {
    type Error = ApiError;

    fn try_from(raw: PlanHistoryRecord) -> Result<Self, Self::Error> {
        Ok(OrderHistoryRecord {
            side: effective_side(&raw.side, &raw.trade_side)?,
            order_type: HistoryOrderType::Trigger,
            price: optional_decimal("triggerPrice", &raw.trigger_price)?,
            average_price: optional_decimal("priceAvg", &raw.price_avg)?.filter(|p| !p.is_zero()),
            status: history_status(&raw.plan_status),
            timestamp: millis("cTime", &raw.c_time)?,
            id: raw.order_id,
            symbol: raw.symbol,
        })
    }
}

// --- Orders placed ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAckRecord {
    pub order_id: String,
    #[serde(default)]
    pub client_oid: Option<String>,
}

impl From<OrderAckRecord> for OrderAck {
    fn from(raw: OrderAckRecord) -> Self {
        OrderAck {
            order_id: raw.order_id,
            client_order_id: raw.client_oid.filter(|c| !c.is_empty()),
        }
    }
}

/// Result of `close-positions`: Bitget reports per-order outcomes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionsData {
    #[serde(default)]
    pub success_list: Vec<OrderAckRecord>,
    #[serde(default)]
    pub failure_list: Vec<CloseFailure>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseFailure {
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_msg: String,
}

// --- Market ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRecord {
    pub symbol: String,
    pub min_trade_num: String,
    pub volume_place: String,
    #[serde(default)]
    pub size_multiplier: String,
}

/// The sizing rules of one contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractSpec {
    pub min_trade_num: Decimal,
    /// Number of decimals allowed in an order size.
    pub volume_place: u32,
    /// Sizes must be a multiple of this step.
    pub size_multiplier: Decimal,
}

impl TryFrom<ContractRecord> for ContractSpec {
    type Error = ApiError;

    fn try_from(raw: ContractRecord) -> Result<Self, Self::Error> {
        let volume_place = raw.volume_place.trim().parse::<u32>().map_err(|e| {
            ApiError::Deserialization(format!("volumePlace = {:?}: {}", raw.volume_place, e))
        })?;
        Ok(ContractSpec {
            min_trade_num: decimal("minTradeNum", &raw.min_trade_num)?,
            volume_place,
            size_multiplier: decimal_or_zero("sizeMultiplier", &raw.size_multiplier)?,
        })
    }
}

impl ContractSpec {
    /// Rounds `quantity` down to the contract's precision and step.
    pub fn round_down(&self, quantity: Decimal) -> Decimal {
        let mut rounded = quantity
            .round_dp_with_strategy(self.volume_place, rust_decimal::RoundingStrategy::ToZero);
        if self.size_multiplier > Decimal::ZERO {
            rounded = (rounded / self.size_multiplier).trunc() * self.size_multiplier;
        }
        rounded.normalize()
    }
}
