use async_trait::async_trait;
use chrono::{DateTime, Utc};
use configuration::VenueSettings;
use core_types::{
    Balance, LimitOrderRequest, MarginMode, OpenOrder, OrderAck, OrderHistoryRecord, OrderKind,
    OrderSide, Position, PositionSide,
};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::sign_request;
use crate::error::ApiError;
use crate::responses::{
    AccountRecord, ClosePositionsData, ContractRecord, ContractSpec, EntrustedList, Envelope,
    HistoryOrderRecord, OrderAckRecord, Outcome, PendingOrderRecord, PlanHistoryRecord,
    PlanOrderRecord, PositionRecord, is_benign,
};
use crate::{Capability, VenueAdapter};

const ACCOUNTS: &str = "/api/v2/mix/account/accounts";
const SET_MARGIN_MODE: &str = "/api/v2/mix/account/set-margin-mode";
const SET_LEVERAGE: &str = "/api/v2/mix/account/set-leverage";
const ALL_POSITIONS: &str = "/api/v2/mix/position/all-position";
const PLACE_ORDER: &str = "/api/v2/mix/order/place-order";
const CANCEL_ORDER: &str = "/api/v2/mix/order/cancel-order";
const BATCH_CANCEL: &str = "/api/v2/mix/order/batch-cancel-orders";
const CLOSE_POSITIONS: &str = "/api/v2/mix/order/close-positions";
const PENDING_ORDERS: &str = "/api/v2/mix/order/orders-pending";
const ORDER_HISTORY: &str = "/api/v2/mix/order/orders-history";
const PLACE_TPSL: &str = "/api/v2/mix/order/place-tpsl-order";
const PENDING_PLANS: &str = "/api/v2/mix/order/orders-plan-pending";
const PLAN_HISTORY: &str = "/api/v2/mix/order/orders-plan-history";
const CANCEL_PLAN: &str = "/api/v2/mix/order/cancel-plan-order";
const CONTRACTS: &str = "/api/v2/mix/market/contracts";

/// Page size for history queries.
const HISTORY_LIMIT: &str = "100";

/// A concrete implementation of the `VenueAdapter` for Bitget USDT-margined
/// perpetual futures (v2 "mix" API, hedge mode).
pub struct BitgetClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    product_type: String,
    margin_coin: String,
    /// Last margin mode applied per symbol; `place-order` must repeat it.
    margin_modes: RwLock<HashMap<String, MarginMode>>,
    /// Contract rules never change while the process runs.
    contracts: RwLock<HashMap<String, ContractSpec>>,
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn margin_mode_str(mode: MarginMode) -> &'static str {
    match mode {
        MarginMode::Crossed => "crossed",
        MarginMode::Isolated => "isolated",
    }
}

/// In hedge mode a close is sent with the side of the position it reduces.
fn hedge_side(position: PositionSide) -> OrderSide {
    match position {
        PositionSide::Long => OrderSide::Buy,
        PositionSide::Short => OrderSide::Sell,
    }
}

fn parse_ack(path: &str, data: serde_json::Value) -> Result<OrderAck, ApiError> {
    serde_json::from_value::<OrderAckRecord>(data)
        .map(OrderAck::from)
        .map_err(|e| ApiError::Deserialization(format!("{}: {}", path, e)))
}

fn new_client_oid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl BitgetClient {
    /// Builds the client. Missing credentials are fatal: nothing useful can be
    /// done against a private API without them.
    pub fn new(settings: &VenueSettings) -> Result<Self, ApiError> {
        for (name, value) in [
            ("api_key", &settings.api_key),
            ("api_secret", &settings.api_secret),
            ("passphrase", &settings.passphrase),
        ] {
            if value.trim().is_empty() {
                return Err(ApiError::InvalidCredentials(format!("venue.{} is empty", name)));
            }
        }

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            passphrase: settings.passphrase.clone(),
            product_type: settings.product_type.clone(),
            margin_coin: settings.margin_coin.clone(),
            margin_modes: RwLock::new(HashMap::new()),
            contracts: RwLock::new(HashMap::new()),
        })
    }

    /// Signs and sends one request, returning the normalized envelope.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &BTreeMap<&str, String>,
        body: Option<serde_json::Value>,
    ) -> Result<Outcome, ApiError> {
        let query_string = if query.is_empty() {
            String::new()
        } else {
            serde_qs::to_string(query).map_err(|e| ApiError::InvalidData(e.to_string()))?
        };
        let request_path = if query_string.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query_string)
        };
        let body = body.map(|b| b.to_string()).unwrap_or_default();

        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature =
            sign_request(&self.api_secret, &timestamp, method.as_str(), &request_path, &body);

        debug!(method = %method, path = %request_path, "bitget request");
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, request_path))
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(path.to_string())
            } else {
                ApiError::Transport(e)
            }
        })?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => envelope.into_outcome(),
            Err(_) if !status.is_success() => Err(ApiError::Venue {
                code: status.as_u16().to_string(),
                msg: text,
            }),
            Err(e) => Err(ApiError::Deserialization(format!(
                "{}: {}. Original text: {}",
                path, e, text
            ))),
        }
    }

    /// GET returning typed `data`. `null` data and no-ops read as empty.
    async fn get<T: DeserializeOwned + Default>(
        &self,
        path: &str,
        query: &BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        match self.send(Method::GET, path, query, None).await? {
            Outcome::Data(serde_json::Value::Null) | Outcome::NoOp(_) => Ok(T::default()),
            Outcome::Data(data) => serde_json::from_value(data)
                .map_err(|e| ApiError::Deserialization(format!("{}: {}", path, e))),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<Outcome, ApiError> {
        self.send(Method::POST, path, &BTreeMap::new(), Some(body))
            .await
    }

    /// POST that must yield an order id.
    async fn post_for_ack(&self, path: &str, body: serde_json::Value) -> Result<OrderAck, ApiError> {
        match self.post(path, body).await? {
            Outcome::Data(data) => parse_ack(path, data),
            Outcome::NoOp(msg) => Err(ApiError::InvalidData(format!(
                "{} returned no order: {}",
                path, msg
            ))),
        }
    }

    fn base_query(&self) -> BTreeMap<&'static str, String> {
        let mut query = BTreeMap::new();
        query.insert("productType", self.product_type.clone());
        query
    }

    fn window_query(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BTreeMap<&'static str, String> {
        let mut query = self.base_query();
        query.insert("symbol", symbol.to_string());
        query.insert("startTime", from.timestamp_millis().to_string());
        query.insert("endTime", to.timestamp_millis().to_string());
        query.insert("limit", HISTORY_LIMIT.to_string());
        query
    }

    async fn margin_mode_for(&self, symbol: &str) -> MarginMode {
        self.margin_modes
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(MarginMode::Crossed)
    }

    async fn order_body(
        &self,
        symbol: &str,
        side: OrderSide,
        trade_side: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        client_oid: String,
    ) -> serde_json::Value {
        let mode = self.margin_mode_for(symbol).await;
        let mut body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginMode": margin_mode_str(mode),
            "marginCoin": self.margin_coin,
            "size": quantity.normalize().to_string(),
            "side": side_str(side),
            "tradeSide": trade_side,
            "orderType": if price.is_some() { "limit" } else { "market" },
            "clientOid": client_oid,
        });
        if let Some(price) = price {
            body["price"] = json!(price.normalize().to_string());
            body["force"] = json!("gtc");
        }
        body
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        trade_side: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        client_oid: String,
    ) -> Result<OrderAck, ApiError> {
        let body = self
            .order_body(symbol, side, trade_side, quantity, price, client_oid)
            .await;
        self.post_for_ack(PLACE_ORDER, body).await
    }

    async fn close(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<Decimal>,
    ) -> Result<Option<OrderAck>, ApiError> {
        if let Some(quantity) = quantity {
            let body = self
                .order_body(symbol, hedge_side(side), "close", quantity, None, new_client_oid())
                .await;
            return match self.post(PLACE_ORDER, body).await? {
                Outcome::Data(data) => parse_ack(PLACE_ORDER, data).map(Some),
                Outcome::NoOp(msg) => {
                    debug!(symbol, side = %side, msg = %msg, "nothing to close");
                    Ok(None)
                }
            };
        }

        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "holdSide": side.to_string(),
        });
        match self.post(CLOSE_POSITIONS, body).await? {
            Outcome::NoOp(msg) => {
                debug!(symbol, side = %side, msg = %msg, "nothing to close");
                Ok(None)
            }
            Outcome::Data(serde_json::Value::Null) => Ok(None),
            Outcome::Data(data) => {
                let data: ClosePositionsData = serde_json::from_value(data)
                    .map_err(|e| ApiError::Deserialization(format!("{}: {}", CLOSE_POSITIONS, e)))?;
                if let Some(failure) = data
                    .failure_list
                    .iter()
                    .find(|f| !is_benign(&f.error_code, &f.error_msg))
                {
                    return Err(ApiError::Venue {
                        code: failure.error_code.clone(),
                        msg: failure.error_msg.clone(),
                    });
                }
                Ok(data.success_list.into_iter().next().map(OrderAck::from))
            }
        }
    }

    async fn pending_plans(&self, symbol: &str) -> Result<Vec<OpenOrder>, ApiError> {
        let mut query = self.base_query();
        query.insert("symbol", symbol.to_string());
        query.insert("planType", "profit_loss".to_string());
        let rows: EntrustedList<PlanOrderRecord> = self.get(PENDING_PLANS, &query).await?;
        let mut orders = Vec::new();
        for row in rows.into_rows() {
            if let Some(order) = row.into_open_order()? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    async fn cancel_plans_of_kind(&self, symbol: &str, kind: OrderKind) -> Result<(), ApiError> {
        let ids: Vec<serde_json::Value> = self
            .pending_plans(symbol)
            .await?
            .into_iter()
            .filter(|o| o.kind == kind)
            .map(|o| json!({ "orderId": o.id }))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "orderIdList": ids,
        });
        self.post(CANCEL_PLAN, body).await?;
        Ok(())
    }

    async fn contract(&self, symbol: &str) -> Result<ContractSpec, ApiError> {
        if let Some(spec) = self.contracts.read().await.get(symbol) {
            return Ok(spec.clone());
        }
        let mut query = self.base_query();
        query.insert("symbol", symbol.to_string());
        let rows: Vec<ContractRecord> = self.get(CONTRACTS, &query).await?;
        let raw = rows
            .into_iter()
            .find(|c| c.symbol == symbol)
            .ok_or_else(|| ApiError::InvalidData(format!("Unknown contract: {}", symbol)))?;
        let spec = ContractSpec::try_from(raw)?;
        self.contracts
            .write()
            .await
            .insert(symbol.to_string(), spec.clone());
        Ok(spec)
    }
}

#[async_trait]
impl VenueAdapter for BitgetClient {
    fn venue_name(&self) -> &str {
        "bitget"
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::PlanOrderHistory | Capability::MinTradeSize)
    }

    async fn get_balance(&self) -> Result<Balance, ApiError> {
        let rows: Vec<AccountRecord> = self.get(ACCOUNTS, &self.base_query()).await?;
        let raw = rows
            .into_iter()
            .find(|a| a.margin_coin.eq_ignore_ascii_case(&self.margin_coin))
            .ok_or_else(|| {
                ApiError::InvalidData(format!("No {} futures account", self.margin_coin))
            })?;
        Balance::try_from(raw)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ApiError> {
        let mut query = self.base_query();
        query.insert("marginCoin", self.margin_coin.clone());
        let rows: Vec<PositionRecord> = self.get(ALL_POSITIONS, &query).await?;
        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let position = Position::try_from(row)?;
            if position.is_open() {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ApiError> {
        let mut query = self.base_query();
        query.insert("symbol", symbol.to_string());
        let rows: EntrustedList<PendingOrderRecord> = self.get(PENDING_ORDERS, &query).await?;
        let mut orders = rows
            .into_rows()
            .into_iter()
            .map(OpenOrder::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        orders.extend(self.pending_plans(symbol).await?);
        Ok(orders)
    }

    async fn get_order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderHistoryRecord>, ApiError> {
        let query = self.window_query(symbol, from, to);
        let rows: EntrustedList<HistoryOrderRecord> = self.get(ORDER_HISTORY, &query).await?;
        let mut records = Vec::new();
        for row in rows.into_rows() {
            match OrderHistoryRecord::try_from(row) {
                Ok(record) => records.push(record),
                // One odd row must not hide every other fill.
                Err(e) => warn!(symbol, error = %e, "skipping unparseable history row"),
            }
        }
        Ok(records)
    }

    async fn open_long(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError> {
        self.place_order(symbol, OrderSide::Buy, "open", quantity, None, new_client_oid())
            .await
    }

    async fn open_short(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck, ApiError> {
        self.place_order(symbol, OrderSide::Sell, "open", quantity, None, new_client_oid())
            .await
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
        let client_oid = if request.client_order_id.is_empty() {
            new_client_oid()
        } else {
            request.client_order_id.clone()
        };
        self.place_order(
            &request.symbol,
            request.side,
            "open",
            request.quantity,
            Some(request.price),
            client_oid,
        )
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ApiError> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "orderId": order_id,
        });
        self.post(CANCEL_ORDER, body).await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
        });
        self.post(BATCH_CANCEL, body).await?;
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
    ) -> Result<OrderAck, ApiError> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "planType": "pos_loss",
            "triggerPrice": trigger_price.normalize().to_string(),
            "triggerType": "mark_price",
            "executePrice": "0",
            "holdSide": side.to_string(),
            "clientOid": new_client_oid(),
        });
        self.post_for_ack(PLACE_TPSL, body).await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        trigger_price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<OrderAck, ApiError> {
        let mut body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "planType": if quantity.is_some() { "profit_plan" } else { "pos_profit" },
            "triggerPrice": trigger_price.normalize().to_string(),
            "triggerType": "mark_price",
            "executePrice": "0",
            "holdSide": side.to_string(),
            "clientOid": new_client_oid(),
        });
        if let Some(quantity) = quantity {
            body["size"] = json!(quantity.normalize().to_string());
        }
        self.post_for_ack(PLACE_TPSL, body).await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.cancel_plans_of_kind(symbol, OrderKind::StopLoss).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.cancel_plans_of_kind(symbol, OrderKind::TakeProfit)
            .await
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ApiError> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "marginMode": margin_mode_str(mode),
        });
        self.post(SET_MARGIN_MODE, body).await?;
        self.margin_modes
            .write()
            .await
            .insert(symbol.to_string(), mode);
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ApiError> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "leverage": leverage.to_string(),
        });
        self.post(SET_LEVERAGE, body).await?;
        Ok(())
    }

    async fn format_quantity(&self, symbol: &str, quantity: Decimal) -> Result<Decimal, ApiError> {
        let spec = self.contract(symbol).await?;
        let rounded = spec.round_down(quantity);
        if rounded < spec.min_trade_num {
            return Err(ApiError::InvalidData(format!(
                "{} {} is below the minimum trade size {}",
                symbol, quantity, spec.min_trade_num
            )));
        }
        Ok(rounded)
    }

    async fn get_plan_order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderHistoryRecord>, ApiError> {
        let mut query = self.window_query(symbol, from, to);
        query.insert("planType", "profit_loss".to_string());
        let rows: EntrustedList<PlanHistoryRecord> = self.get(PLAN_HISTORY, &query).await?;
        rows.into_rows()
            .into_iter()
            .map(OrderHistoryRecord::try_from)
            .collect()
    }

    async fn min_trade_size(&self, symbol: &str) -> Result<Decimal, ApiError> {
        Ok(self.contract(symbol).await?.min_trade_num)
    }
}
