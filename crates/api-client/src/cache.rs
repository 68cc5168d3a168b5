use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    Balance, LimitOrderRequest, MarginMode, OpenOrder, OrderAck, OrderHistoryRecord, Position,
    PositionSide,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ApiError;
use crate::{Capability, VenueAdapter};

/// What a cache entry holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Balance,
    Positions,
    /// Live orders of one symbol.
    OpenOrders(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub venue: String,
    pub scope: CacheScope,
}

impl CacheKey {
    pub fn balance(venue: &str) -> Self {
        Self {
            venue: venue.to_string(),
            scope: CacheScope::Balance,
        }
    }

    pub fn positions(venue: &str) -> Self {
        Self {
            venue: venue.to_string(),
            scope: CacheScope::Positions,
        }
    }

    pub fn open_orders(venue: &str, symbol: &str) -> Self {
        Self {
            venue: venue.to_string(),
            scope: CacheScope::OpenOrders(symbol.to_string()),
        }
    }

    /// Whether a mutation on `symbol` makes this entry stale. Account-wide
    /// entries always are.
    fn affected_by(&self, symbol: &str) -> bool {
        match &self.scope {
            CacheScope::OpenOrders(cached) => cached == symbol,
            CacheScope::Balance | CacheScope::Positions => true,
        }
    }
}

/// A read cache whose entries expire `ttl` after they were written.
///
/// Readers share the lock; refreshes and invalidations take it exclusively.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The cached value if it is younger than the TTL.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        entries.insert(key, (Instant::now(), value));
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drops every entry whose key matches.
    pub async fn invalidate_where(&self, predicate: impl Fn(&K) -> bool) {
        self.entries.write().await.retain(|key, _| !predicate(key));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// A `VenueAdapter` decorator that serves balance, position and open-order
/// reads from a [`TtlCache`]. A mutation on a symbol invalidates the account
/// entries and that symbol's orders.
///
/// Invalidation happens even when the mutation fails: a failed call may
/// still have reached the venue.
pub struct CachedVenue {
    inner: Arc<dyn VenueAdapter>,
    venue: String,
    balances: TtlCache<CacheKey, Balance>,
    positions: TtlCache<CacheKey, Vec<Position>>,
    orders: TtlCache<CacheKey, Vec<OpenOrder>>,
}

impl CachedVenue {
    pub fn new(inner: Arc<dyn VenueAdapter>, ttl: Duration) -> Self {
        let venue = inner.venue_name().to_string();
        Self {
            inner,
            venue,
            balances: TtlCache::new(ttl),
            positions: TtlCache::new(ttl),
            orders: TtlCache::new(ttl),
        }
    }

    async fn invalidate(&self, symbol: &str) {
        let venue = self.venue.as_str();
        let stale = |k: &CacheKey| k.venue == venue && k.affected_by(symbol);
        self.balances.invalidate_where(stale).await;
        self.positions.invalidate_where(stale).await;
        self.orders.invalidate_where(stale).await;
        debug!(venue, symbol, "venue state cache invalidated");
    }

    /// Hands back a mutation's result once the entries it touched are gone.
    async fn mutate<T>(&self, symbol: &str, result: Result<T, ApiError>) -> Result<T, ApiError> {
        self.invalidate(symbol).await;
        result
    }
}

#[async_trait]
impl VenueAdapter for CachedVenue {
    fn venue_name(&self) -> &str {
        &self.venue
    }

    fn supports(&self, capability: Capability) -> bool {
        self.inner.supports(capability)
    }

    async fn get_balance(&self) -> Result<Balance, ApiError> {
        let key = CacheKey::balance(&self.venue);
        if let Some(balance) = self.balances.get(&key).await {
            return Ok(balance);
        }
        let balance = self.inner.get_balance().await?;
        self.balances.insert(key, balance.clone()).await;
        Ok(balance)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ApiError> {
        let key = CacheKey::positions(&self.venue);
        if let Some(positions) = self.positions.get(&key).await {
            return Ok(positions);
        }
        let positions = self.inner.get_positions().await?;
        self.positions.insert(key, positions.clone()).await;
        Ok(positions)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ApiError> {
        let key = CacheKey::open_orders(&self.venue, symbol);
        if let Some(orders) = self.orders.get(&key).await {
            return Ok(orders);
        }
        let orders = self.inner.get_open_orders(symbol).await?;
        self.orders.insert(key, orders.clone()).await;
        Ok(orders)
    }

    async fn get_order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderHistoryRecord>, ApiError> {
        self.inner.get_order_history(symbol, from, to).await
    }

    async fn open_long(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError> {
        self.mutate(symbol, self.inner.open_long(symbol, quantity).await)
            .await
    }

    async fn open_short(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError> {
        self.mutate(symbol, self.inner.open_short(symbol, quantity).await)
            .await
    }

    async fn close_long(
        &self,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError> {
        self.mutate(symbol, self.inner.close_long(symbol, quantity).await)
            .await
    }

    async fn close_short(
        &self,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError> {
        self.mutate(symbol, self.inner.close_short(symbol, quantity).await)
            .await
    }

    async fn place_limit_order(&self, request: &LimitOrderRequest) -> Result<OrderAck, ApiError> {
        self.mutate(&request.symbol, self.inner.place_limit_order(request).await)
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ApiError> {
        self.mutate(symbol, self.inner.cancel_order(symbol, order_id).await)
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.mutate(symbol, self.inner.cancel_all_orders(symbol).await)
            .await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
    ) -> Result<OrderAck, ApiError> {
        self.mutate(symbol, self.inner.set_stop_loss(symbol, side, trigger_price).await)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<OrderAck, ApiError> {
        self.mutate(
            symbol,
            self.inner
                .set_take_profit(symbol, side, trigger_price, quantity)
                .await,
        )
        .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.mutate(symbol, self.inner.cancel_stop_loss_orders(symbol).await)
            .await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.mutate(symbol, self.inner.cancel_take_profit_orders(symbol).await)
            .await
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ApiError> {
        self.mutate(symbol, self.inner.set_margin_mode(symbol, mode).await)
            .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ApiError> {
        self.mutate(symbol, self.inner.set_leverage(symbol, leverage).await)
            .await
    }

    async fn format_quantity(&self, symbol: &str, quantity: Decimal) -> Result<Decimal, ApiError> {
        self.inner.format_quantity(symbol, quantity).await
    }

    async fn get_plan_order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderHistoryRecord>, ApiError> {
        self.inner.get_plan_order_history(symbol, from, to).await
    }

    async fn min_trade_size(&self, symbol: &str) -> Result<Decimal, ApiError> {
        self.inner.min_trade_size(symbol).await
    }
}
