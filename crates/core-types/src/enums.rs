use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// The declared direction of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// The order side that opens (or adds to) a position in this direction.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    pub fn position_side(&self) -> PositionSide {
        match self {
            Direction::Long => PositionSide::Long,
            Direction::Short => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side of the order
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// The side of an open position. A venue in hedge mode may hold both at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The order side that reduces a position on this side.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// The normalized type of a live order, independent of the venue's own taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Limit,
    StopLoss,
    TakeProfit,
}

/// Venues split resting orders into regular book orders and trigger ("plan") orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderCategory {
    Normal,
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Crossed,
    Isolated,
}

/// The lifecycle phase of one strategy for one trader.
///
/// `Closed` is terminal. `Done` only ever moves to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Waiting,
    EntryPending,
    Entry,
    Done,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Waiting => "WAITING",
            Phase::EntryPending => "ENTRY_PENDING",
            Phase::Entry => "ENTRY",
            Phase::Done => "DONE",
            Phase::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed)
    }

    /// Whether a live position is expected to exist in this phase.
    pub fn holds_position(&self) -> bool {
        matches!(self, Phase::Entry | Phase::Done)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(Phase::Waiting),
            "ENTRY_PENDING" => Ok(Phase::EntryPending),
            "ENTRY" => Ok(Phase::Entry),
            "DONE" => Ok(Phase::Done),
            "CLOSED" => Ok(Phase::Closed),
            other => Err(CoreError::InvalidInput("phase".to_string(), other.to_string())),
        }
    }
}

/// Every action a `Decision` can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    PartialClose,
    PlaceLimitOrder,
    CancelOrder,
    UpdateStopLoss,
    UpdateTakeProfit,
    SetStopLoss,
    SetTakeProfit,
    Hold,
    Wait,
}

impl DecisionAction {
    /// Execution tier: lower runs first. Closes, then protective adjustments
    /// and cancels, then opens, then passive actions.
    pub fn priority(&self) -> u8 {
        match self {
            DecisionAction::CloseLong | DecisionAction::CloseShort | DecisionAction::PartialClose => 0,
            DecisionAction::UpdateStopLoss
            | DecisionAction::UpdateTakeProfit
            | DecisionAction::SetStopLoss
            | DecisionAction::SetTakeProfit
            | DecisionAction::CancelOrder => 1,
            DecisionAction::OpenLong | DecisionAction::OpenShort | DecisionAction::PlaceLimitOrder => 2,
            DecisionAction::Hold | DecisionAction::Wait => 3,
        }
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, DecisionAction::Hold | DecisionAction::Wait)
    }

    /// Actions that lock new margin and therefore go through the risk guard.
    pub fn consumes_margin(&self) -> bool {
        matches!(
            self,
            DecisionAction::OpenLong | DecisionAction::OpenShort | DecisionAction::PlaceLimitOrder
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::OpenLong => "open_long",
            DecisionAction::OpenShort => "open_short",
            DecisionAction::CloseLong => "close_long",
            DecisionAction::CloseShort => "close_short",
            DecisionAction::PartialClose => "partial_close",
            DecisionAction::PlaceLimitOrder => "place_limit_order",
            DecisionAction::CancelOrder => "cancel_order",
            DecisionAction::UpdateStopLoss => "update_stop_loss",
            DecisionAction::UpdateTakeProfit => "update_take_profit",
            DecisionAction::SetStopLoss => "set_stop_loss",
            DecisionAction::SetTakeProfit => "set_take_profit",
            DecisionAction::Hold => "hold",
            DecisionAction::Wait => "wait",
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one rung of a strategy's price ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    Entry,
    /// 1-based index into the strategy's add points.
    Add(usize),
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointKind::Entry => write!(f, "entry"),
            PointKind::Add(n) => write!(f, "add_{}", n),
        }
    }
}
