use api_client::{ApiError, Capability, VenueAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    Balance, HistoryOrderType, HistoryStatus, LimitOrderRequest, MarginMode, OpenOrder, OrderAck,
    OrderCategory, OrderHistoryRecord, OrderKind, OrderSide, Position, PositionSide,
};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct PaperPosition {
    quantity: Decimal,
    entry_price: Decimal,
    leverage: u32,
    margin: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    wallet: Decimal,
    /// Leverage of a symbol that never had one set.
    default_leverage: u32,
    marks: HashMap<String, Decimal>,
    leverage: HashMap<String, u32>,
    margin_modes: HashMap<String, MarginMode>,
    halted: HashSet<String>,
    positions: HashMap<(String, PositionSide), PaperPosition>,
    orders: Vec<OpenOrder>,
    history: Vec<OrderHistoryRecord>,
    next_id: u64,
}

impl PaperState {
    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    /// Position margin plus the margin held by resting limit orders.
    fn locked(&self) -> Decimal {
        let positions: Decimal = self.positions.values().map(|p| p.margin).sum();
        let resting: Decimal = self
            .orders
            .iter()
            .filter(|o| o.kind == OrderKind::Limit)
            .map(|o| self.order_margin(&o.symbol, o.quantity, o.price))
            .sum();
        positions + resting
    }

    fn order_margin(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Decimal {
        quantity * price / Decimal::from(self.leverage_for(symbol))
    }

    fn available(&self) -> Decimal {
        self.wallet - self.locked()
    }

    fn leverage_for(&self, symbol: &str) -> u32 {
        self.leverage
            .get(symbol)
            .copied()
            .unwrap_or(self.default_leverage)
            .max(1)
    }

    fn ensure_trading(&self, symbol: &str) -> Result<(), ApiError> {
        if self.halted.contains(symbol) {
            return Err(ApiError::Timeout(format!("paper order on {}", symbol)));
        }
        Ok(())
    }

    fn insufficient(&self, margin: Decimal) -> ApiError {
        ApiError::Venue {
            code: "40762".to_string(),
            msg: format!(
                "The order amount exceeds the balance: margin {} > available {}",
                margin,
                self.available()
            ),
        }
    }

    fn record(
        &mut self,
        id: String,
        symbol: &str,
        side: OrderSide,
        order_type: HistoryOrderType,
        price: Option<Decimal>,
        average_price: Option<Decimal>,
        status: HistoryStatus,
    ) {
        self.history.push(OrderHistoryRecord {
            id,
            symbol: symbol.to_string(),
            side,
            order_type,
            price,
            average_price,
            status,
            timestamp: Utc::now(),
        });
    }

    /// Adds `quantity` at `price` to the position, averaging the entry price.
    /// Fails without side effects when the margin does not fit.
    fn fill_open(
        &mut self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ApiError> {
        let leverage = self.leverage_for(symbol);
        let margin = self.order_margin(symbol, quantity, price);
        if margin > self.available() {
            return Err(self.insufficient(margin));
        }

        let position = self
            .positions
            .entry((symbol.to_string(), side))
            .or_insert_with(|| PaperPosition {
                quantity: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                leverage,
                margin: Decimal::ZERO,
            });
        let existing_value = position.entry_price * position.quantity;
        let total_quantity = position.quantity + quantity;
        position.entry_price = (existing_value + price * quantity) / total_quantity;
        position.quantity = total_quantity;
        position.margin += margin;
        position.leverage = leverage;
        Ok(())
    }

    /// Fills every resting limit order the mark has crossed.
    fn match_limits(&mut self, symbol: &str, mark: Decimal) {
        let crossed: Vec<OpenOrder> = self
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.kind == OrderKind::Limit)
            .filter(|o| match o.side {
                OrderSide::Buy => mark <= o.price,
                OrderSide::Sell => mark >= o.price,
            })
            .cloned()
            .collect();
        for order in crossed {
            self.fill_limit(&order);
        }
    }

    /// Releases the order's hold, then opens against the freed margin.
    fn fill_limit(&mut self, order: &OpenOrder) {
        self.orders.retain(|o| o.id != order.id);
        let side = match order.side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };
        let status = match self.fill_open(&order.symbol, side, order.quantity, order.price) {
            Ok(()) => HistoryStatus::Filled,
            Err(e) => {
                debug!(order_id = %order.id, error = %e, "paper limit order cancelled on fill");
                HistoryStatus::Cancelled
            }
        };
        let average = (status == HistoryStatus::Filled).then_some(order.price);
        self.record(
            order.id.clone(),
            &order.symbol,
            order.side,
            HistoryOrderType::Limit,
            Some(order.price),
            average,
            status,
        );
    }

    fn view(&self, symbol: &str, side: PositionSide, position: &PaperPosition) -> Position {
        let mark = self
            .marks
            .get(symbol)
            .copied()
            .unwrap_or(position.entry_price);
        let unrealized_pnl = match side {
            PositionSide::Long => (mark - position.entry_price) * position.quantity,
            PositionSide::Short => (position.entry_price - mark) * position.quantity,
        };
        let leverage = Decimal::from(position.leverage.max(1));
        let liquidation_price = match side {
            PositionSide::Long => position.entry_price * (Decimal::ONE - Decimal::ONE / leverage),
            PositionSide::Short => position.entry_price * (Decimal::ONE + Decimal::ONE / leverage),
        };
        Position {
            symbol: symbol.to_string(),
            side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            mark_price: mark,
            unrealized_pnl,
            leverage: position.leverage,
            liquidation_price,
            margin: position.margin,
        }
    }
}

/// An in-memory `VenueAdapter` for tests and dry runs.
///
/// Market orders fill at the mark price set with [`PaperVenue::set_mark_price`].
/// Limit orders hold their margin while resting and fill when the mark
/// crosses their price (or on [`PaperVenue::fill_order`]). Stop-loss and
/// take-profit orders are recorded but never trigger.
pub struct PaperVenue {
    name: String,
    volume_place: u32,
    min_trade: Decimal,
    offline: AtomicBool,
    state: Mutex<PaperState>,
}

impl PaperVenue {
    pub fn new(balance: Decimal) -> Self {
        Self {
            name: "paper".to_string(),
            volume_place: 3,
            min_trade: dec!(0.001),
            offline: AtomicBool::new(false),
            state: Mutex::new(PaperState {
                wallet: balance,
                default_leverage: 1,
                ..PaperState::default()
            }),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Sets the mark price of `symbol` and fills the limit orders it crosses.
    pub async fn set_mark_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().await;
        state.marks.insert(symbol.to_string(), price);
        state.match_limits(symbol, price);
    }

    /// Fills a resting limit order at its own price.
    pub async fn fill_order(&self, order_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .iter()
            .find(|o| o.id == order_id && o.kind == OrderKind::Limit)
            .cloned()
            .ok_or_else(|| ApiError::InvalidData(format!("no resting limit order {}", order_id)))?;
        state.fill_limit(&order);
        Ok(())
    }

    /// While offline every call fails with a retryable timeout.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While a symbol is halted, orders on it time out. Reads still work.
    pub async fn halt_symbol(&self, symbol: &str, halted: bool) {
        let mut state = self.state.lock().await;
        if halted {
            state.halted.insert(symbol.to_string());
        } else {
            state.halted.remove(symbol);
        }
    }

    pub async fn margin_mode(&self, symbol: &str) -> Option<MarginMode> {
        self.state.lock().await.margin_modes.get(symbol).copied()
    }

    fn ensure_online(&self, call: &str) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Timeout(format!("paper {}", call)));
        }
        Ok(())
    }

    async fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<OrderAck, ApiError> {
        self.ensure_online("open")?;
        if quantity <= Decimal::ZERO {
            return Err(ApiError::InvalidData(format!("invalid quantity {}", quantity)));
        }
        let mut state = self.state.lock().await;
        state.ensure_trading(symbol)?;
        let mark = state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ApiError::InvalidData(format!("no mark price for {}", symbol)))?;
        state.fill_open(symbol, side, quantity, mark)?;
        let id = state.next_order_id();
        let order_side = match side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        };
        state.record(
            id.clone(),
            symbol,
            order_side,
            HistoryOrderType::Market,
            None,
            Some(mark),
            HistoryStatus::Filled,
        );
        Ok(OrderAck {
            order_id: id,
            client_order_id: None,
        })
    }

    async fn close(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError> {
        self.ensure_online("close")?;
        let mut state = self.state.lock().await;
        state.ensure_trading(symbol)?;
        let key = (symbol.to_string(), side);
        let Some(position) = state.positions.get(&key).cloned() else {
            return Ok(None);
        };
        let exit = state
            .marks
            .get(symbol)
            .copied()
            .unwrap_or(position.entry_price);
        let quantity = quantity.unwrap_or(position.quantity).min(position.quantity);
        let pnl = match side {
            PositionSide::Long => (exit - position.entry_price) * quantity,
            PositionSide::Short => (position.entry_price - exit) * quantity,
        };
        let released = position.margin * quantity / position.quantity;
        state.wallet += pnl;

        let remaining = position.quantity - quantity;
        if remaining.is_zero() {
            state.positions.remove(&key);
            // Position-bound protective orders die with the position.
            let closing = side.closing_side();
            state
                .orders
                .retain(|o| !(o.symbol == symbol && o.category == OrderCategory::Plan && o.side == closing));
        } else if let Some(p) = state.positions.get_mut(&key) {
            p.quantity = remaining;
            p.margin -= released;
        }

        let id = state.next_order_id();
        state.record(
            id.clone(),
            symbol,
            side.closing_side(),
            HistoryOrderType::Market,
            None,
            Some(exit),
            HistoryStatus::Filled,
        );
        Ok(Some(OrderAck {
            order_id: id,
            client_order_id: None,
        }))
    }

    async fn place_plan(
        &self,
        symbol: &str,
        side: PositionSide,
        kind: OrderKind,
        trigger_price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<OrderAck, ApiError> {
        self.ensure_online("place plan")?;
        if trigger_price <= Decimal::ZERO {
            return Err(ApiError::InvalidData(format!("invalid trigger {}", trigger_price)));
        }
        let mut state = self.state.lock().await;
        let Some(position) = state.positions.get(&(symbol.to_string(), side)).cloned() else {
            return Err(ApiError::Venue {
                code: "43020".to_string(),
                msg: format!("Position does not exist for {} {}", symbol, side),
            });
        };
        let closing = side.closing_side();
        // A whole-position plan replaces the previous one of its kind.
        if quantity.is_none() {
            state.orders.retain(|o| {
                !(o.symbol == symbol
                    && o.kind == kind
                    && o.side == closing
                    && o.quantity == position.quantity)
            });
        }
        let id = state.next_order_id();
        state.orders.push(OpenOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            kind,
            side: closing,
            price: trigger_price,
            quantity: quantity.unwrap_or(position.quantity),
            status: "live".to_string(),
            category: OrderCategory::Plan,
            created_at: Utc::now(),
        });
        Ok(OrderAck {
            order_id: id,
            client_order_id: None,
        })
    }

    async fn cancel_kind(&self, symbol: &str, kind: OrderKind) -> Result<(), ApiError> {
        self.ensure_online("cancel plan")?;
        let mut state = self.state.lock().await;
        state.orders.retain(|o| !(o.symbol == symbol && o.kind == kind));
        Ok(())
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn venue_name(&self) -> &str {
        &self.name
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::MinTradeSize)
    }

    async fn get_balance(&self) -> Result<Balance, ApiError> {
        self.ensure_online("balance")?;
        let state = self.state.lock().await;
        let unrealized: Decimal = state
            .positions
            .iter()
            .map(|((symbol, side), p)| state.view(symbol, *side, p).unrealized_pnl)
            .sum();
        Ok(Balance {
            margin_coin: "USDT".to_string(),
            equity: state.wallet + unrealized,
            available: state.available(),
            locked: state.locked(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ApiError> {
        self.ensure_online("positions")?;
        let state = self.state.lock().await;
        Ok(state
            .positions
            .iter()
            .map(|((symbol, side), p)| state.view(symbol, *side, p))
            .collect())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ApiError> {
        self.ensure_online("open orders")?;
        let state = self.state.lock().await;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn get_order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderHistoryRecord>, ApiError> {
        self.ensure_online("history")?;
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|r| r.symbol == symbol && r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn open_long(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError> {
        self.open(symbol, PositionSide::Long, quantity).await
    }

    async fn open_short(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError> {
        self.open(symbol, PositionSide::Short, quantity).await
    }

    async fn close_long(
        &self,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError> {
        self.close(symbol, PositionSide::Long, quantity).await
    }

    async fn close_short(
        &self,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError> {
        self.close(symbol, PositionSide::Short, quantity).await
    }

    async fn place_limit_order(&self, request: &LimitOrderRequest) -> Result<OrderAck, ApiError> {
        self.ensure_online("place limit")?;
        if request.price <= Decimal::ZERO || request.quantity < self.min_trade {
            return Err(ApiError::InvalidData(format!(
                "invalid limit order {} @ {}",
                request.quantity, request.price
            )));
        }
        let mut state = self.state.lock().await;
        state.ensure_trading(&request.symbol)?;
        let margin = state.order_margin(&request.symbol, request.quantity, request.price);
        if margin > state.available() {
            return Err(state.insufficient(margin));
        }
        let id = state.next_order_id();
        state.orders.push(OpenOrder {
            id: id.clone(),
            symbol: request.symbol.clone(),
            kind: OrderKind::Limit,
            side: request.side,
            price: request.price,
            quantity: request.quantity,
            status: "live".to_string(),
            category: OrderCategory::Normal,
            created_at: Utc::now(),
        });
        if let Some(mark) = state.marks.get(&request.symbol).copied() {
            state.match_limits(&request.symbol, mark);
        }
        Ok(OrderAck {
            order_id: id,
            client_order_id: Some(request.client_order_id.clone()),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ApiError> {
        self.ensure_online("cancel")?;
        let mut state = self.state.lock().await;
        let Some(index) = state
            .orders
            .iter()
            .position(|o| o.id == order_id && o.symbol == symbol)
        else {
            // Nothing to cancel is not an error.
            return Ok(());
        };
        let order = state.orders.remove(index);
        if order.kind == OrderKind::Limit {
            state.record(
                order.id,
                symbol,
                order.side,
                HistoryOrderType::Limit,
                Some(order.price),
                None,
                HistoryStatus::Cancelled,
            );
        }
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.ensure_online("cancel all")?;
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .orders
                .iter()
                .filter(|o| o.symbol == symbol && o.kind == OrderKind::Limit)
                .map(|o| o.id.clone())
                .collect()
        };
        for id in ids {
            self.cancel_order(symbol, &id).await?;
        }
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
    ) -> Result<OrderAck, ApiError> {
        self.place_plan(symbol, side, OrderKind::StopLoss, trigger_price, None)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<OrderAck, ApiError> {
        self.place_plan(symbol, side, OrderKind::TakeProfit, trigger_price, quantity)
            .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.cancel_kind(symbol, OrderKind::StopLoss).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.cancel_kind(symbol, OrderKind::TakeProfit).await
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ApiError> {
        self.ensure_online("margin mode")?;
        self.state
            .lock()
            .await
            .margin_modes
            .insert(symbol.to_string(), mode);
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ApiError> {
        self.ensure_online("leverage")?;
        if leverage == 0 {
            return Err(ApiError::Venue {
                code: "40797".to_string(),
                msg: "Leverage must be at least 1".to_string(),
            });
        }
        self.state
            .lock()
            .await
            .leverage
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn format_quantity(&self, symbol: &str, quantity: Decimal) -> Result<Decimal, ApiError> {
        let rounded = quantity
            .round_dp_with_strategy(self.volume_place, RoundingStrategy::ToZero)
            .normalize();
        if rounded < self.min_trade {
            return Err(ApiError::InvalidData(format!(
                "{} {} is below the minimum trade size {}",
                symbol, quantity, self.min_trade
            )));
        }
        Ok(rounded)
    }

    async fn min_trade_size(&self, _symbol: &str) -> Result<Decimal, ApiError> {
        Ok(self.min_trade)
    }
}
