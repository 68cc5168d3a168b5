//! # Vigil Core Types
//!
//! The shared vocabulary of the engine: strategies and their derived price
//! ladder, venue observations (positions, open orders, order history,
//! balances), phases, decisions and the records the engine persists.
//!
//! This crate depends on nothing else in the workspace.

pub mod enums;
pub mod error;
pub mod price;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{
    DecisionAction, Direction, MarginMode, OrderCategory, OrderKind, OrderSide, Phase, PointKind,
    PositionSide,
};
pub use error::CoreError;
pub use price::{relative_diff, within_tolerance};
pub use structs::{
    AddPoint, Balance, Decision, DecisionRecord, ExecutionRecord, ExpectedPricePoint,
    HistoryOrderType, HistoryStatus, LimitOrderRequest, OpenOrder, OrderAck, OrderHistoryRecord,
    Position, RiskCheckResult, Strategy, StrategyExecutionState, StrategyOrderRecord,
};
