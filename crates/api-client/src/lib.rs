use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    Balance, LimitOrderRequest, MarginMode, OpenOrder, OrderAck, OrderHistoryRecord, Position,
    PositionSide,
};
use rust_decimal::Decimal;
use std::fmt;

mod auth;
pub mod bitget;
pub mod cache;
pub mod error;
pub mod responses;

// --- Public API ---
pub use bitget::BitgetClient;
pub use cache::{CacheKey, CacheScope, CachedVenue, TtlCache};
pub use error::ApiError;

/// Extended capabilities a venue may or may not offer on top of the base
/// contract. Query with [`VenueAdapter::supports`] before calling the
/// matching optional method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// History of triggered plan (stop/take-profit) orders.
    PlanOrderHistory,
    /// The minimum order size of a contract.
    MinTradeSize,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::PlanOrderHistory => write!(f, "plan order history"),
            Capability::MinTradeSize => write!(f, "min trade size"),
        }
    }
}

/// The generic, abstract interface for a derivatives venue.
///
/// This trait is the contract the engine uses, so the underlying
/// implementation (Bitget, the paper venue, a cache in front of either) can
/// be swapped freely. Business no-ops ("nothing to cancel", "margin mode
/// unchanged", ...) are reported as success.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Stable identifier, part of every cache key.
    fn venue_name(&self) -> &str;

    fn supports(&self, capability: Capability) -> bool {
        let _ = capability;
        false
    }

    async fn get_balance(&self) -> Result<Balance, ApiError>;

    /// All open positions of the account, across symbols.
    async fn get_positions(&self) -> Result<Vec<Position>, ApiError>;

    /// Book orders and protective plan orders resting for `symbol`.
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ApiError>;

    async fn get_order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderHistoryRecord>, ApiError>;

    async fn open_long(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError>;

    async fn open_short(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError>;

    /// Closes `quantity` of the long side, or all of it with `None`.
    /// Closing a flat side succeeds with `Ok(None)`.
    async fn close_long(
        &self,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError>;

    async fn close_short(
        &self,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError>;

    async fn place_limit_order(&self, request: &LimitOrderRequest) -> Result<OrderAck, ApiError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ApiError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError>;

    /// A whole-position stop-loss on `side`, triggered at `trigger_price`.
    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
    ) -> Result<OrderAck, ApiError>;

    /// A take-profit on `side`. `quantity` makes it partial; `None` covers the
    /// whole position.
    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<OrderAck, ApiError>;

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ApiError>;

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ApiError>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ApiError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ApiError>;

    /// Rounds `quantity` to what the venue accepts for `symbol`.
    async fn format_quantity(&self, symbol: &str, quantity: Decimal) -> Result<Decimal, ApiError>;

    async fn get_plan_order_history(
        &self,
        _symbol: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<OrderHistoryRecord>, ApiError> {
        Err(ApiError::Unsupported(Capability::PlanOrderHistory))
    }

    async fn min_trade_size(&self, _symbol: &str) -> Result<Decimal, ApiError> {
        Err(ApiError::Unsupported(Capability::MinTradeSize))
    }
}
