use crate::reconciler::DivergenceReport;
use chrono::Utc;
use configuration::ToleranceSettings;
use core_types::{
    Decision, DecisionAction, ExecutionRecord, MarginMode, OpenOrder, OrderCategory, OrderKind,
    Phase, Strategy, StrategyOrderRecord, within_tolerance,
};
use database::StateStore;
use executor::{DispatchReport, Dispatcher, ExecutorError};
use risk::RiskGuard;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Whether `action` may run while the strategy is in `phase`.
///
/// Before a position exists only entries, cancels and passive actions pass.
/// While protection is incomplete only protective adjustments, cancels and
/// passive actions pass. A fully protected or closed strategy only holds.
pub fn phase_allows(phase: Phase, action: DecisionAction) -> bool {
    use DecisionAction::*;
    match phase {
        Phase::Waiting | Phase::EntryPending => matches!(
            action,
            PlaceLimitOrder | OpenLong | OpenShort | CancelOrder | Hold | Wait
        ),
        Phase::Entry => matches!(
            action,
            SetStopLoss
                | UpdateStopLoss
                | SetTakeProfit
                | UpdateTakeProfit
                | CancelOrder
                | Hold
                | Wait
        ),
        Phase::Done | Phase::Closed => action.is_passive(),
    }
}

/// Orders decisions by execution tier. Stable within a tier.
pub fn prioritize(mut decisions: Vec<Decision>) -> Vec<Decision> {
    decisions.sort_by_key(|d| d.action.priority());
    decisions
}

/// The deterministic repair for a divergence the provider would not act on.
///
/// Each missing ladder point becomes a limit order sized at
/// `percent * capital * leverage`. Missing protection is set (or replaced
/// when an order at the wrong price exists). Several take-profits form a
/// ladder, each rung closing an equal share of the position.
pub fn fallback_decisions(
    strategy: &Strategy,
    report: &DivergenceReport,
    capital: Decimal,
    default_leverage: u32,
) -> Vec<Decision> {
    let leverage = strategy.leverage.unwrap_or(default_leverage);
    let position_side = strategy.direction.position_side();
    let mut decisions = Vec::new();

    for point in &report.missing_points {
        let notional = point.percent * capital * Decimal::from(leverage);
        decisions.push(
            Decision::place_limit(
                &strategy.symbol,
                strategy.direction.entry_side(),
                point.price,
                notional,
                leverage,
            )
            .with_reasoning(format!("fallback: {} point missing", point.kind)),
        );
    }

    if report.position.is_some() && report.missing_stop_loss {
        let mut decision =
            Decision::set_stop_loss(&strategy.symbol, position_side, strategy.stop_loss);
        if report.stop_loss_orders > 0 {
            decision.action = DecisionAction::UpdateStopLoss;
        }
        decisions.push(decision.with_reasoning("fallback: stop-loss missing"));
    }

    if report.position.is_some() {
        let ladder = strategy.take_profits.len() > 1;
        for price in &report.missing_take_profits {
            let mut decision = Decision::set_take_profit(&strategy.symbol, position_side, *price);
            if ladder {
                decision.close_ratio =
                    Some(Decimal::ONE / Decimal::from(strategy.take_profits.len()));
            } else if report.take_profit_orders > 0 {
                decision.action = DecisionAction::UpdateTakeProfit;
            }
            decisions.push(decision.with_reasoning("fallback: take-profit missing"));
        }
    }

    decisions
}

/// What the pipeline knows about the strategy at the start of the batch.
#[derive(Debug, Clone)]
pub struct PassContext<'a> {
    pub strategy: &'a Strategy,
    pub phase: Phase,
    /// Available balance observed at the start of the pass.
    pub available: Decimal,
    /// Live orders for the strategy's symbol, duplicates already removed.
    pub open_orders: &'a [OpenOrder],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Executed(DispatchReport),
    /// Passive, gated by phase, or already in place. Never recorded.
    Skipped(String),
    /// Refused by the risk guard. No venue call was made.
    Rejected(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub decision: Decision,
    pub outcome: Outcome,
    /// The persisted record, for rejected, failed and executed actions.
    pub record: Option<ExecutionRecord>,
}

impl ActionOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self.outcome, Outcome::Executed(_))
    }
}

/// Phase gate, risk guard, duplicate-intent guard, dispatch and bookkeeping
/// for one strategy's batch of decisions.
pub struct Pipeline {
    trader_id: String,
    dispatcher: Dispatcher,
    guard: RiskGuard,
    store: Arc<dyn StateStore>,
    tolerances: ToleranceSettings,
    default_leverage: u32,
    margin_mode: MarginMode,
    /// Leverage last applied per symbol.
    prepared: Mutex<HashMap<String, u32>>,
}

impl Pipeline {
    pub fn new(
        trader_id: &str,
        dispatcher: Dispatcher,
        guard: RiskGuard,
        store: Arc<dyn StateStore>,
        tolerances: ToleranceSettings,
        default_leverage: u32,
        margin_mode: MarginMode,
    ) -> Self {
        Self {
            trader_id: trader_id.to_string(),
            dispatcher,
            guard,
            store,
            tolerances,
            default_leverage,
            margin_mode,
            prepared: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_leverage(&self) -> u32 {
        self.default_leverage
    }

    /// Runs `decisions` for one strategy in priority order.
    ///
    /// Margin committed by each dispatched order is taken off the balance the
    /// next decision is checked against.
    pub async fn execute(&self, ctx: &PassContext<'_>, decisions: Vec<Decision>) -> Vec<ActionOutcome> {
        let strategy = ctx.strategy;
        let mut known_orders = ctx.open_orders.to_vec();
        let mut remaining = ctx.available;
        let mut outcomes = Vec::with_capacity(decisions.len());

        for mut decision in prioritize(decisions) {
            self.normalize(strategy, &mut decision);
            let action = decision.action;

            if action.is_passive() {
                debug!(strategy_id = %strategy.id, %action, reasoning = %decision.reasoning, "passive decision");
                outcomes.push(skipped(decision, "passive"));
                continue;
            }
            if !phase_allows(ctx.phase, action) {
                warn!(
                    strategy_id = %strategy.id,
                    phase = %ctx.phase,
                    %action,
                    "decision not permitted in this phase"
                );
                let reason = format!("{} not permitted in {}", action, ctx.phase);
                outcomes.push(skipped(decision, &reason));
                continue;
            }

            let mut committed = Decimal::ZERO;
            if action.consumes_margin() {
                let leverage = decision.leverage.unwrap_or(self.default_leverage);
                match self.guard.check(&decision, remaining, leverage) {
                    Ok(check) if check.passed => {
                        if Some(check.notional) != decision.position_size_usd {
                            info!(strategy_id = %strategy.id, %action, reason = %check.reason, "order resized by risk guard");
                        }
                        decision.position_size_usd = Some(check.notional);
                        committed = check.required_margin + check.estimated_fee;
                    }
                    Ok(check) => {
                        warn!(strategy_id = %strategy.id, %action, reason = %check.reason, "risk guard rejected decision");
                        let reason = format!("risk rejected: {}", check.reason);
                        outcomes.push(self.reject(strategy, decision, reason).await);
                        continue;
                    }
                    Err(e) => {
                        let reason = format!("risk check failed: {}", e);
                        outcomes.push(self.reject(strategy, decision, reason).await);
                        continue;
                    }
                }
            }

            if let Some(existing) = self.duplicate_of(&decision, &known_orders) {
                info!(
                    strategy_id = %strategy.id,
                    %action,
                    existing_order = %existing.id,
                    "equivalent order already live, skipping"
                );
                let reason = format!("already satisfied by order {}", existing.id);
                outcomes.push(skipped(decision, &reason));
                continue;
            }

            if action.consumes_margin() {
                let leverage = decision.leverage.unwrap_or(self.default_leverage);
                if let Err(e) = self.prepare(&strategy.symbol, leverage).await {
                    outcomes.push(self.fail(strategy, decision, e).await);
                    continue;
                }
            }

            match self.dispatcher.dispatch(&decision).await {
                Ok(report) => {
                    remaining -= committed;
                    self.track(&decision, &report, &mut known_orders);
                    self.record_order(strategy, &decision, &report).await;
                    let record = self
                        .record(
                            strategy,
                            &decision,
                            report.price.or(decision.price),
                            report.quantity,
                            None,
                        )
                        .await;
                    outcomes.push(ActionOutcome {
                        decision,
                        outcome: Outcome::Executed(report),
                        record: Some(record),
                    });
                }
                Err(e) => outcomes.push(self.fail(strategy, decision, e).await),
            }
        }
        outcomes
    }

    /// Cancels redundant copies of the same order. Runs in every phase, ahead
    /// of any decision. Returns how many were cancelled.
    pub async fn cancel_duplicates(&self, strategy: &Strategy, duplicates: &[OpenOrder]) -> usize {
        let mut cancelled = 0;
        for order in duplicates {
            let mut decision = Decision::new(DecisionAction::CancelOrder, &strategy.symbol)
                .with_reasoning(format!("duplicate of a live {:?} order at {}", order.kind, order.price));
            decision.order_id = Some(order.id.clone());
            match self.dispatcher.dispatch(&decision).await {
                Ok(_) => {
                    info!(strategy_id = %strategy.id, order_id = %order.id, price = %order.price, "duplicate order cancelled");
                    self.record(strategy, &decision, Some(order.price), Some(order.quantity), None)
                        .await;
                    cancelled += 1;
                }
                Err(e) => {
                    self.fail(strategy, decision, e).await;
                }
            }
        }
        cancelled
    }

    /// Pins the decision to the strategy and fills fields it implies.
    fn normalize(&self, strategy: &Strategy, decision: &mut Decision) {
        decision.symbol = strategy.symbol.clone();
        match decision.action {
            DecisionAction::PlaceLimitOrder => {
                decision.side.get_or_insert(strategy.direction.entry_side());
            }
            DecisionAction::SetStopLoss
            | DecisionAction::UpdateStopLoss
            | DecisionAction::SetTakeProfit
            | DecisionAction::UpdateTakeProfit
            | DecisionAction::PartialClose => {
                decision
                    .position_side
                    .get_or_insert(strategy.direction.position_side());
            }
            _ => {}
        }
        if decision.action.consumes_margin() {
            let leverage = decision
                .leverage
                .or(strategy.leverage)
                .unwrap_or(self.default_leverage)
                .max(1);
            decision.leverage = Some(leverage);
        }
    }

    fn duplicate_of<'a>(&self, decision: &Decision, orders: &'a [OpenOrder]) -> Option<&'a OpenOrder> {
        let protective = |kind: OrderKind, trigger: Option<Decimal>| {
            let closing = decision.position_side?.closing_side();
            let trigger = trigger?;
            orders.iter().find(|o| {
                o.kind == kind
                    && o.side == closing
                    && within_tolerance(o.price, trigger, self.tolerances.protective)
            })
        };
        match decision.action {
            DecisionAction::PlaceLimitOrder => {
                let side = decision.side?;
                let price = decision.price?;
                orders.iter().find(|o| {
                    o.kind == OrderKind::Limit
                        && o.side == side
                        && within_tolerance(o.price, price, self.tolerances.duplicate_order)
                })
            }
            DecisionAction::SetStopLoss => protective(OrderKind::StopLoss, decision.stop_loss),
            DecisionAction::SetTakeProfit => protective(OrderKind::TakeProfit, decision.take_profit),
            _ => None,
        }
    }

    /// Applies margin mode and leverage before the first order at a new leverage.
    async fn prepare(&self, symbol: &str, leverage: u32) -> Result<(), ExecutorError> {
        let mut prepared = self.prepared.lock().await;
        if prepared.get(symbol) == Some(&leverage) {
            return Ok(());
        }
        let venue = self.dispatcher.venue();
        venue.set_margin_mode(symbol, self.margin_mode).await?;
        venue.set_leverage(symbol, leverage).await?;
        info!(symbol, leverage, margin_mode = ?self.margin_mode, "margin mode and leverage applied");
        prepared.insert(symbol.to_string(), leverage);
        Ok(())
    }

    /// Keeps the batch's view of live orders current so later decisions see earlier ones.
    fn track(&self, decision: &Decision, report: &DispatchReport, orders: &mut Vec<OpenOrder>) {
        let Some(order_id) = report.order_id.clone() else {
            return;
        };
        let (kind, side, category) = match decision.action {
            DecisionAction::CancelOrder => {
                orders.retain(|o| o.id != order_id);
                return;
            }
            DecisionAction::PlaceLimitOrder => match decision.side {
                Some(side) => (OrderKind::Limit, side, OrderCategory::Normal),
                None => return,
            },
            DecisionAction::SetStopLoss | DecisionAction::UpdateStopLoss => {
                match decision.position_side {
                    Some(side) => (OrderKind::StopLoss, side.closing_side(), OrderCategory::Plan),
                    None => return,
                }
            }
            DecisionAction::SetTakeProfit | DecisionAction::UpdateTakeProfit => {
                match decision.position_side {
                    Some(side) => (OrderKind::TakeProfit, side.closing_side(), OrderCategory::Plan),
                    None => return,
                }
            }
            _ => return,
        };
        if matches!(
            decision.action,
            DecisionAction::UpdateStopLoss | DecisionAction::UpdateTakeProfit
        ) {
            orders.retain(|o| !(o.kind == kind && o.side == side));
        }
        orders.push(OpenOrder {
            id: order_id,
            symbol: decision.symbol.clone(),
            kind,
            side,
            price: report.price.unwrap_or_default(),
            quantity: report.quantity.unwrap_or_default(),
            status: "live".to_string(),
            category,
            created_at: Utc::now(),
        });
    }

    async fn record_order(&self, strategy: &Strategy, decision: &Decision, report: &DispatchReport) {
        let kind = match decision.action {
            DecisionAction::PlaceLimitOrder => OrderKind::Limit,
            DecisionAction::SetStopLoss | DecisionAction::UpdateStopLoss => OrderKind::StopLoss,
            DecisionAction::SetTakeProfit | DecisionAction::UpdateTakeProfit => OrderKind::TakeProfit,
            _ => return,
        };
        let (Some(order_id), Some(price)) = (report.order_id.clone(), report.price) else {
            return;
        };
        let side = match kind {
            OrderKind::Limit => decision.side,
            _ => decision.position_side.map(|s| s.closing_side()),
        };
        let Some(side) = side else {
            return;
        };
        let record = StrategyOrderRecord {
            trader_id: self.trader_id.clone(),
            strategy_id: strategy.id.clone(),
            venue_order_id: order_id,
            kind,
            side,
            price,
            // Zero marks a whole-position protective order.
            quantity: report.quantity.unwrap_or_default(),
            leverage: decision.leverage.or(strategy.leverage).unwrap_or(self.default_leverage),
            status: "live".to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_strategy_order(&record).await {
            error!(strategy_id = %strategy.id, error = %e, "failed to persist strategy order");
        }
    }

    async fn record(
        &self,
        strategy: &Strategy,
        decision: &Decision,
        price: Option<Decimal>,
        quantity: Option<Decimal>,
        error: Option<String>,
    ) -> ExecutionRecord {
        let record = ExecutionRecord {
            trader_id: self.trader_id.clone(),
            strategy_id: Some(strategy.id.clone()),
            action: decision.action,
            symbol: decision.symbol.clone(),
            price,
            quantity,
            success: error.is_none(),
            error,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_execution(&record).await {
            error!(strategy_id = %strategy.id, error = %e, "failed to persist execution record");
        }
        record
    }

    async fn reject(&self, strategy: &Strategy, decision: Decision, reason: String) -> ActionOutcome {
        let record = self
            .record(strategy, &decision, decision.price, None, Some(reason.clone()))
            .await;
        ActionOutcome {
            decision,
            outcome: Outcome::Rejected(reason),
            record: Some(record),
        }
    }

    async fn fail(&self, strategy: &Strategy, decision: Decision, e: ExecutorError) -> ActionOutcome {
        if e.is_retryable() {
            warn!(strategy_id = %strategy.id, action = %decision.action, error = %e, "venue call failed, next cycle will retry");
        } else {
            error!(strategy_id = %strategy.id, action = %decision.action, error = %e, "decision failed");
        }
        let reason = e.to_string();
        let record = self
            .record(strategy, &decision, decision.price, None, Some(reason.clone()))
            .await;
        ActionOutcome {
            decision,
            outcome: Outcome::Failed(reason),
            record: Some(record),
        }
    }
}

fn skipped(decision: Decision, reason: &str) -> ActionOutcome {
    ActionOutcome {
        decision,
        outcome: Outcome::Skipped(reason.to_string()),
        record: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{Reconciler, VenueSnapshot};
    use api_client::VenueAdapter;
    use configuration::RiskSettings;
    use core_types::{AddPoint, Direction, OrderSide, PositionSide};
    use database::MemoryStore;
    use executor::PaperVenue;
    use rust_decimal_macros::dec;

    fn strategy() -> Strategy {
        Strategy {
            id: "s-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(60000),
            add_points: vec![
                AddPoint { price: dec!(61000), percent: dec!(0.3) },
                AddPoint { price: dec!(62000), percent: dec!(0.3) },
            ],
            stop_loss: dec!(58000),
            take_profits: vec![dec!(65000)],
            leverage: Some(10),
            rationale: String::new(),
            received_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<PaperVenue>, Arc<MemoryStore>, Pipeline) {
        let venue = Arc::new(PaperVenue::new(dec!(10000)));
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            "t-1",
            Dispatcher::new(venue.clone()),
            RiskGuard::new(RiskSettings::default()).unwrap(),
            store.clone(),
            ToleranceSettings::default(),
            5,
            MarginMode::Isolated,
        );
        (venue, store, pipeline)
    }

    #[test]
    fn phase_gate_table() {
        use DecisionAction::*;
        assert!(phase_allows(Phase::Waiting, PlaceLimitOrder));
        assert!(phase_allows(Phase::EntryPending, CancelOrder));
        assert!(!phase_allows(Phase::EntryPending, SetStopLoss));
        assert!(phase_allows(Phase::Entry, SetTakeProfit));
        assert!(!phase_allows(Phase::Entry, PlaceLimitOrder));
        assert!(!phase_allows(Phase::Entry, CloseLong));
        assert!(!phase_allows(Phase::Done, UpdateStopLoss));
        assert!(phase_allows(Phase::Done, Hold));
        assert!(!phase_allows(Phase::Closed, CancelOrder));
    }

    #[test]
    fn closes_run_before_adjustments_before_opens() {
        let ordered = prioritize(vec![
            Decision::hold("BTCUSDT", ""),
            Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(60000), dec!(100), 5),
            Decision::new(DecisionAction::CancelOrder, "BTCUSDT"),
            Decision::new(DecisionAction::CloseLong, "BTCUSDT"),
            Decision::set_stop_loss("BTCUSDT", PositionSide::Long, dec!(58000)),
        ]);
        let actions: Vec<_> = ordered.iter().map(|d| d.action).collect();
        assert_eq!(
            actions,
            vec![
                DecisionAction::CloseLong,
                DecisionAction::CancelOrder,
                DecisionAction::SetStopLoss,
                DecisionAction::PlaceLimitOrder,
                DecisionAction::Hold,
            ]
        );
    }

    #[test]
    fn fallback_sizes_missing_points_from_capital() {
        let s = strategy();
        let report = Reconciler::new(ToleranceSettings::default()).reconcile(
            &s,
            None,
            &VenueSnapshot::default(),
        );
        let decisions = fallback_decisions(&s, &report, dec!(10000), 5);
        let sized: Vec<_> = decisions
            .iter()
            .map(|d| (d.action, d.price, d.position_size_usd, d.side))
            .collect();
        assert_eq!(
            sized,
            vec![
                (DecisionAction::PlaceLimitOrder, Some(dec!(60000)), Some(dec!(40000)), Some(OrderSide::Buy)),
                (DecisionAction::PlaceLimitOrder, Some(dec!(61000)), Some(dec!(30000)), Some(OrderSide::Buy)),
                (DecisionAction::PlaceLimitOrder, Some(dec!(62000)), Some(dec!(30000)), Some(OrderSide::Buy)),
            ]
        );
    }

    #[tokio::test]
    async fn fallback_builds_a_take_profit_ladder() {
        let mut s = strategy();
        s.add_points.clear();
        s.take_profits = vec![dec!(65000), dec!(70000)];
        let venue = PaperVenue::new(dec!(10000));
        venue.set_mark_price("BTCUSDT", dec!(60000)).await;
        venue.open_long("BTCUSDT", dec!(0.1)).await.unwrap();
        venue.set_stop_loss("BTCUSDT", PositionSide::Long, dec!(58000)).await.unwrap();
        let snapshot = VenueSnapshot {
            positions: venue.get_positions().await.unwrap(),
            open_orders: venue.get_open_orders("BTCUSDT").await.unwrap(),
            history: vec![],
        };
        let report = Reconciler::new(ToleranceSettings::default()).reconcile(&s, None, &snapshot);

        let decisions = fallback_decisions(&s, &report, dec!(10000), 5);
        assert_eq!(decisions.len(), 2);
        assert!(decisions
            .iter()
            .all(|d| d.action == DecisionAction::SetTakeProfit && d.close_ratio == Some(dec!(0.5))));
    }

    #[tokio::test]
    async fn phase_gate_blocks_without_a_venue_call() {
        let (venue, store, pipeline) = setup();
        let s = strategy();
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Done,
            available: dec!(10000),
            open_orders: &[],
        };
        let decision = Decision::place_limit("ETHUSDT", OrderSide::Buy, dec!(60000), dec!(1000), 5);
        let outcomes = pipeline.execute(&ctx, vec![decision]).await;

        assert!(matches!(outcomes[0].outcome, Outcome::Skipped(_)));
        assert_eq!(outcomes[0].decision.symbol, "BTCUSDT", "symbol is re-stamped");
        assert!(venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());
        assert!(store.execution_records("t-1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn risk_rejection_is_recorded_and_never_dispatched() {
        let (venue, store, pipeline) = setup();
        let s = strategy();
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Waiting,
            available: Decimal::ZERO,
            open_orders: &[],
        };
        let decision = Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(60000), dec!(1000), 10);
        let outcomes = pipeline.execute(&ctx, vec![decision]).await;

        assert!(matches!(outcomes[0].outcome, Outcome::Rejected(_)));
        assert!(venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());
        let records = store.execution_records("t-1", Some("s-1")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].error.as_deref().unwrap().contains("risk rejected"));
    }

    #[tokio::test]
    async fn margin_committed_in_a_batch_is_not_spent_twice() {
        let venue = Arc::new(PaperVenue::new(dec!(1000)));
        venue.set_mark_price("BTCUSDT", dec!(60000)).await;
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            "t-1",
            Dispatcher::new(venue.clone()),
            RiskGuard::new(RiskSettings::default()).unwrap(),
            store.clone(),
            ToleranceSettings::default(),
            5,
            MarginMode::Isolated,
        );
        let s = strategy();
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Waiting,
            available: dec!(1000),
            open_orders: &[],
        };
        let open = || {
            let mut d = Decision::new(DecisionAction::OpenLong, "BTCUSDT");
            d.price = Some(dec!(60000));
            d.position_size_usd = Some(dec!(9000));
            d.leverage = Some(10);
            d
        };
        let outcomes = pipeline.execute(&ctx, vec![open(), open()]).await;

        assert!(outcomes.iter().all(|o| o.is_executed()), "{:?}", outcomes);
        assert_eq!(outcomes[0].decision.position_size_usd, Some(dec!(9000)));
        // 1000 - (900 + 3.6) is left for the second order.
        assert_eq!(outcomes[1].decision.position_size_usd, Some(dec!(915.8)));
        let committed: Decimal = outcomes
            .iter()
            .filter_map(|o| o.decision.position_size_usd)
            .map(|n| n / dec!(10) + n * dec!(0.0004))
            .sum();
        assert!(committed <= dec!(1000));
    }

    #[tokio::test]
    async fn exhausted_batch_budget_is_rejected_locally() {
        let venue = Arc::new(PaperVenue::new(dec!(1000)));
        venue.set_mark_price("BTCUSDT", dec!(60000)).await;
        let store = Arc::new(MemoryStore::new());
        // Without a buffer a shrunk order plus its fee never fits.
        let risk = RiskSettings {
            capacity_buffer: dec!(1),
            ..RiskSettings::default()
        };
        let pipeline = Pipeline::new(
            "t-1",
            Dispatcher::new(venue.clone()),
            RiskGuard::new(risk).unwrap(),
            store.clone(),
            ToleranceSettings::default(),
            5,
            MarginMode::Isolated,
        );
        let s = strategy();
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Waiting,
            available: dec!(1000),
            open_orders: &[],
        };
        let first = Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(59000), dec!(9000), 10);
        let second = Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(58000), dec!(9000), 10);
        let outcomes = pipeline.execute(&ctx, vec![first, second]).await;

        assert!(outcomes[0].is_executed());
        assert!(matches!(outcomes[1].outcome, Outcome::Rejected(_)));
        assert_eq!(venue.get_open_orders("BTCUSDT").await.unwrap().len(), 1);
        let records = store.execution_records("t-1", Some("s-1")).await.unwrap();
        assert_eq!(records.iter().filter(|r| !r.success).count(), 1);
    }

    #[tokio::test]
    async fn duplicate_that_fails_the_risk_check_is_recorded() {
        let (venue, store, pipeline) = setup();
        let s = strategy();
        let live = OpenOrder {
            id: "live-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            kind: OrderKind::Limit,
            side: OrderSide::Buy,
            price: dec!(60000),
            quantity: dec!(0.1),
            status: "live".to_string(),
            category: OrderCategory::Normal,
            created_at: Utc::now(),
        };
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Waiting,
            available: Decimal::ZERO,
            open_orders: std::slice::from_ref(&live),
        };
        let decision = Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(60000), dec!(6000), 10);
        let outcomes = pipeline.execute(&ctx, vec![decision]).await;

        assert!(matches!(outcomes[0].outcome, Outcome::Rejected(_)));
        assert!(venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());
        assert_eq!(store.execution_records("t-1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_intent_is_skipped_silently() {
        let (venue, _, pipeline) = setup();
        let s = strategy();
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Waiting,
            available: dec!(10000),
            open_orders: &[],
        };
        let first = Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(60000), dec!(6000), 10);
        // 0.2% away from the first one, inside the 0.5% band.
        let second = Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(60120), dec!(6000), 10);
        let outcomes = pipeline.execute(&ctx, vec![first, second]).await;

        assert!(outcomes[0].is_executed());
        assert!(matches!(&outcomes[1].outcome, Outcome::Skipped(r) if r.contains("already satisfied")));
        assert_eq!(venue.get_open_orders("BTCUSDT").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_order_applies_margin_mode_and_leverage() {
        let (venue, store, pipeline) = setup();
        let s = strategy();
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Waiting,
            available: dec!(10000),
            open_orders: &[],
        };
        let mut decision = Decision::place_limit("BTCUSDT", OrderSide::Buy, dec!(60000), dec!(6000), 10);
        decision.leverage = None;
        let outcomes = pipeline.execute(&ctx, vec![decision]).await;

        assert!(outcomes[0].is_executed());
        assert_eq!(outcomes[0].decision.leverage, Some(10), "strategy leverage applies");
        assert_eq!(venue.margin_mode("BTCUSDT").await, Some(MarginMode::Isolated));
        let orders = store.strategy_orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::Limit);
        assert_eq!(orders[0].quantity, dec!(0.1));
        assert!(store.has_strategy_orders("t-1", "s-1").await.unwrap());
    }

    #[tokio::test]
    async fn data_inconsistency_aborts_only_that_decision() {
        let (venue, store, pipeline) = setup();
        venue.set_mark_price("BTCUSDT", dec!(60000)).await;
        venue.open_long("BTCUSDT", dec!(0.1)).await.unwrap();
        let s = strategy();
        let orders = venue.get_open_orders("BTCUSDT").await.unwrap();
        let ctx = PassContext {
            strategy: &s,
            phase: Phase::Entry,
            available: dec!(9400),
            open_orders: &orders,
        };
        let mut broken = Decision::set_stop_loss("BTCUSDT", PositionSide::Long, dec!(58000));
        broken.stop_loss = None;
        let good = Decision::set_take_profit("BTCUSDT", PositionSide::Long, dec!(65000));
        let outcomes = pipeline.execute(&ctx, vec![broken, good]).await;

        assert!(matches!(outcomes[0].outcome, Outcome::Failed(_)));
        assert!(outcomes[1].is_executed());
        let records = store.execution_records("t-1", Some("s-1")).await.unwrap();
        assert_eq!(records.iter().filter(|r| r.success).count(), 1);
        assert_eq!(records.iter().filter(|r| !r.success).count(), 1);
    }
}
