//! # Vigil Engine
//!
//! The reconciliation engine: it compares each declared strategy with what
//! the venue actually shows, asks a decision provider how to close the gap,
//! falls back to a deterministic repair when the provider will not act, and
//! pushes the resulting decisions through the phase gate, risk guard and
//! duplicate guard to the venue.

use crate::cooldown::CooldownTable;
use crate::decision::{BASE_INSTRUCTIONS, DecisionContext, DecisionProvider, is_decline};
use crate::drawdown::DrawdownMonitor;
use crate::pipeline::{ActionOutcome, PassContext, Pipeline, fallback_decisions};
use crate::reconciler::{DivergenceReport, Reconciler, VenueSnapshot};
use crate::tracker::{StateTracker, Transition};
use api_client::{Capability, VenueAdapter};
use chrono::{Duration as ChronoDuration, Utc};
use configuration::settings::Config;
use core_types::{Decision, DecisionRecord, Phase, Strategy};
use database::StateStore;
use events::{EngineEvent, PhaseChange, StrategyBus, StrategyMessage};
use executor::Dispatcher;
use futures::future::join_all;
use risk::RiskGuard;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod cooldown;
pub mod decision;
pub mod drawdown;
pub mod error;
pub mod pipeline;
pub mod reconciler;
pub mod tracker;

pub use decision::{DeclineProvider, HttpDecisionProvider, provider_from_settings};
pub use error::EngineError;
pub use pipeline::Outcome;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub strategy_id: String,
    /// Set when the pass did not run at all (closed, already in flight).
    pub skipped: Option<String>,
    pub transition: Option<Transition>,
    pub report: Option<DivergenceReport>,
    pub cancelled_duplicates: usize,
    /// The provider was asked for decisions.
    pub consulted: bool,
    pub used_fallback: bool,
    pub outcomes: Vec<ActionOutcome>,
}

impl PassSummary {
    fn skipped(strategy_id: &str, reason: &str) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            skipped: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn executed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_executed()).count()
    }
}

/// Releases an in-flight claim however the pass ends, cancellation included.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<String>>,
    strategy_id: String,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a StdMutex<HashSet<String>>, strategy_id: &str) -> Option<Self> {
        let mut claimed = set.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(strategy_id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            strategy_id: strategy_id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut claimed = self.set.lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&self.strategy_id);
    }
}

/// The central coordinator for one trader.
pub struct Engine {
    config: Config,
    trader_id: String,

    // --- Shared, Thread-Safe Components ---
    venue: Arc<dyn VenueAdapter>,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn DecisionProvider>,
    reconciler: Reconciler,
    tracker: StateTracker,
    cooldown: CooldownTable,
    pipeline: Pipeline,
    drawdown: Arc<DrawdownMonitor>,

    // --- Strategy Management ---
    bus: StrategyBus,
    /// Subscribed at construction so nothing published before `run` is lost.
    bus_rx: Mutex<Option<broadcast::Receiver<StrategyMessage>>>,
    strategies: RwLock<HashMap<String, Arc<Strategy>>>,
    in_flight: StdMutex<HashSet<String>>,

    event_tx: broadcast::Sender<EngineEvent>,
}

impl Engine {
    pub fn new(
        config: Config,
        venue: Arc<dyn VenueAdapter>,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn DecisionProvider>,
    ) -> Result<Self, EngineError> {
        let trader_id = config.engine.trader_id.clone();
        if trader_id.trim().is_empty() {
            return Err(EngineError::Configuration(
                "engine.trader_id must not be empty".to_string(),
            ));
        }
        let (event_tx, _) = broadcast::channel(256);
        let guard = RiskGuard::new(config.risk.clone())?;
        let pipeline = Pipeline::new(
            &trader_id,
            Dispatcher::new(venue.clone()),
            guard,
            store.clone(),
            config.tolerances.clone(),
            config.engine.default_leverage,
            config.engine.margin_mode,
        );
        let drawdown = Arc::new(DrawdownMonitor::new(
            config.drawdown.clone(),
            &trader_id,
            venue.clone(),
            store.clone(),
            event_tx.clone(),
        ));
        let bus = StrategyBus::default();
        let bus_rx = Mutex::new(Some(bus.subscribe()));

        Ok(Self {
            trader_id,
            venue,
            provider,
            reconciler: Reconciler::new(config.tolerances.clone()),
            tracker: StateTracker::new(store.clone()),
            store,
            cooldown: CooldownTable::new(config.engine.decision_cooldown()),
            pipeline,
            drawdown,
            bus,
            bus_rx,
            strategies: RwLock::new(HashMap::new()),
            in_flight: StdMutex::new(HashSet::new()),
            event_tx,
            config,
        })
    }

    pub fn trader_id(&self) -> &str {
        &self.trader_id
    }

    /// The bus strategies are published on. Cloning it is cheap.
    pub fn bus(&self) -> &StrategyBus {
        &self.bus
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn drawdown(&self) -> &Arc<DrawdownMonitor> {
        &self.drawdown
    }

    /// Loads persisted phases and the closed set for this trader.
    pub async fn rehydrate(&self) -> Result<usize, EngineError> {
        self.tracker.rehydrate(&self.trader_id).await
    }

    /// Adds a strategy to the set reconciled on every tick.
    pub async fn register(&self, strategy: Arc<Strategy>) -> Result<(), EngineError> {
        strategy
            .validate()
            .map_err(|e| EngineError::Configuration(format!("strategy {}: {}", strategy.id, e)))?;
        if self.tracker.is_closed(&self.trader_id, &strategy.id).await {
            info!(strategy_id = %strategy.id, "strategy already closed, not registering");
            return Ok(());
        }
        info!(
            strategy_id = %strategy.id,
            symbol = %strategy.symbol,
            direction = ?strategy.direction,
            "strategy registered"
        );
        let _ = self.event_tx.send(EngineEvent::StrategyRegistered {
            strategy_id: strategy.id.clone(),
            symbol: strategy.symbol.clone(),
        });
        self.strategies
            .write()
            .await
            .insert(strategy.id.clone(), strategy);
        Ok(())
    }

    pub async fn strategy_ids(&self) -> Vec<String> {
        self.strategies.read().await.keys().cloned().collect()
    }

    /// Runs one reconciliation pass for `strategy_id`.
    ///
    /// A pass already in flight for the same strategy makes this one a no-op.
    pub async fn run_pass(&self, strategy_id: &str) -> Result<PassSummary, EngineError> {
        let strategy = self
            .strategies
            .read()
            .await
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| EngineError::StrategyNotFound(strategy_id.to_string()))?;

        let Some(_claim) = InFlight::claim(&self.in_flight, strategy_id) else {
            debug!(strategy_id, "pass already in flight, skipping");
            return Ok(PassSummary::skipped(strategy_id, "in flight"));
        };
        self.reconcile_strategy(&strategy).await
    }

    async fn snapshot(&self, strategy: &Strategy) -> Result<(core_types::Balance, VenueSnapshot), EngineError> {
        let now = Utc::now();
        let from = now - ChronoDuration::hours(self.config.engine.history_lookback_hours);
        let (balance, positions, open_orders, mut history) = tokio::try_join!(
            self.venue.get_balance(),
            self.venue.get_positions(),
            self.venue.get_open_orders(&strategy.symbol),
            self.venue.get_order_history(&strategy.symbol, from, now),
        )?;
        if self.venue.supports(Capability::PlanOrderHistory) {
            match self.venue.get_plan_order_history(&strategy.symbol, from, now).await {
                Ok(plans) => history.extend(plans),
                Err(e) => warn!(strategy_id = %strategy.id, error = %e, "plan order history unavailable"),
            }
        }
        Ok((
            balance,
            VenueSnapshot {
                positions,
                open_orders,
                history,
            },
        ))
    }

    async fn reconcile_strategy(&self, strategy: &Strategy) -> Result<PassSummary, EngineError> {
        let trader_id = self.trader_id.as_str();
        if self.tracker.is_closed(trader_id, &strategy.id).await {
            self.strategies.write().await.remove(&strategy.id);
            return Ok(PassSummary::skipped(&strategy.id, "closed"));
        }
        let mut summary = PassSummary {
            strategy_id: strategy.id.clone(),
            ..PassSummary::default()
        };

        // --- 1. Observe ---
        let state = self.tracker.ensure(trader_id, strategy).await?;
        let (balance, snapshot) = self.snapshot(strategy).await?;
        let report = self.reconciler.reconcile(strategy, Some(&state), &snapshot);
        summary.cancelled_duplicates = self
            .pipeline
            .cancel_duplicates(strategy, &report.duplicates)
            .await;

        let transition = self
            .tracker
            .observe(trader_id, strategy, report.observed_phase, report.position.as_ref())
            .await?;
        summary.transition = Some(transition);
        if transition.changed() {
            let _ = self.event_tx.send(EngineEvent::PhaseChanged(PhaseChange {
                trader_id: trader_id.to_string(),
                strategy_id: strategy.id.clone(),
                symbol: strategy.symbol.clone(),
                from: transition.from,
                to: transition.to,
                timestamp: Utc::now(),
            }));
        }
        if transition.to == Phase::Closed {
            self.cooldown.evict(&strategy.id).await;
            self.strategies.write().await.remove(&strategy.id);
            summary.report = Some(report);
            return Ok(summary);
        }
        if !report.has_divergence() {
            debug!(strategy_id = %strategy.id, phase = %transition.to, "strategy in sync");
            summary.report = Some(report);
            return Ok(summary);
        }

        // --- 2. Decide ---
        if !self.cooldown.try_mark(&strategy.id).await {
            debug!(strategy_id = %strategy.id, "divergence found, decision cooldown active");
            summary.report = Some(report);
            return Ok(summary);
        }
        let rendered = report.render();
        info!(strategy_id = %strategy.id, phase = %transition.to, "divergence found\n{}", rendered);

        let live_orders: Vec<_> = snapshot
            .open_orders
            .iter()
            .filter(|o| o.symbol == strategy.symbol)
            .filter(|o| !report.duplicates.iter().any(|d| d.id == o.id))
            .cloned()
            .collect();
        let context = DecisionContext {
            trader_id: trader_id.to_string(),
            strategy: strategy.clone(),
            phase: transition.to,
            balance: balance.clone(),
            positions: snapshot.positions.clone(),
            open_orders: live_orders.clone(),
            history: snapshot.history.clone(),
            report: rendered.clone(),
        };
        let (decisions, used_fallback, provider_error) =
            self.consult(strategy, &report, &context).await;
        summary.consulted = true;
        summary.used_fallback = used_fallback;

        let record = DecisionRecord {
            trader_id: trader_id.to_string(),
            strategy_id: strategy.id.clone(),
            report: rendered,
            decisions: decisions.clone(),
            used_fallback,
            provider_error,
            created_at: Utc::now(),
        };
        self.persist_decision(&record).await;

        // --- 3. Act ---
        let ctx = PassContext {
            strategy,
            phase: transition.to,
            available: balance.available,
            open_orders: &live_orders,
        };
        summary.outcomes = self.pipeline.execute(&ctx, decisions).await;
        for outcome in &summary.outcomes {
            if let Some(record) = &outcome.record {
                let _ = self.event_tx.send(EngineEvent::ActionExecuted(record.clone()));
            }
        }
        summary.report = Some(report);
        Ok(summary)
    }

    /// Asks the provider, once more with the retry directive on a decline,
    /// and falls back to the deterministic repair if it still will not act.
    async fn consult(
        &self,
        strategy: &Strategy,
        report: &DivergenceReport,
        context: &DecisionContext,
    ) -> (Vec<Decision>, bool, Option<String>) {
        let retry_instructions = format!(
            "{}\n{}",
            BASE_INSTRUCTIONS, self.config.decision.retry_directive
        );
        let mut last_error = None;
        for (attempt, instructions) in [BASE_INSTRUCTIONS, retry_instructions.as_str()]
            .into_iter()
            .enumerate()
        {
            match self.provider.decide(context, instructions).await {
                Ok(decisions) if !is_decline(&decisions) => {
                    info!(
                        strategy_id = %strategy.id,
                        provider = self.provider.name(),
                        attempt = attempt + 1,
                        decisions = decisions.len(),
                        "decision provider answered"
                    );
                    return (decisions, false, last_error);
                }
                Ok(_) => {
                    debug!(strategy_id = %strategy.id, attempt = attempt + 1, "decision provider declined");
                }
                Err(e) => {
                    warn!(strategy_id = %strategy.id, attempt = attempt + 1, error = %e, "decision provider failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        let decisions = fallback_decisions(
            strategy,
            report,
            context.balance.available,
            self.pipeline.default_leverage(),
        );
        info!(
            strategy_id = %strategy.id,
            decisions = decisions.len(),
            "provider would not act on a confirmed divergence, applying fallback"
        );
        (decisions, true, last_error)
    }

    async fn persist_decision(&self, record: &DecisionRecord) {
        if let Err(e) = self.store.record_decision(record).await {
            error!(strategy_id = %record.strategy_id, error = %e, "failed to persist decision record");
        }
    }

    /// Closes tracked strategies whose position is gone.
    pub async fn audit(&self) -> Result<Vec<String>, EngineError> {
        let positions = self.venue.get_positions().await?;
        let closed = self.tracker.audit(&self.trader_id, &positions).await?;
        let mut ids = Vec::with_capacity(closed.len());
        for (strategy_id, transition) in closed {
            self.cooldown.evict(&strategy_id).await;
            let symbol = self
                .strategies
                .write()
                .await
                .remove(&strategy_id)
                .map(|s| s.symbol.clone())
                .unwrap_or_default();
            let _ = self.event_tx.send(EngineEvent::PhaseChanged(PhaseChange {
                trader_id: self.trader_id.clone(),
                strategy_id: strategy_id.clone(),
                symbol,
                from: transition.from,
                to: transition.to,
                timestamp: Utc::now(),
            }));
            ids.push(strategy_id);
        }
        Ok(ids)
    }

    async fn run_audit(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.engine.audit_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.audit().await {
                        Ok(closed) if !closed.is_empty() => {
                            warn!(count = closed.len(), strategies = ?closed, "audit closed strategies without a position");
                        }
                        Ok(_) => debug!("audit found nothing to close"),
                        Err(e) => error!(error = %e, "audit failed"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn spawn_pass(self: &Arc<Self>, passes: &mut JoinSet<()>, strategy_id: String) {
        let engine = Arc::clone(self);
        passes.spawn(async move {
            engine.log_pass(&strategy_id, engine.run_pass(&strategy_id).await);
        });
    }

    fn log_pass(&self, strategy_id: &str, result: Result<PassSummary, EngineError>) {
        match result {
            Ok(summary) if summary.executed() > 0 || summary.cancelled_duplicates > 0 => {
                info!(
                    strategy_id,
                    executed = summary.executed(),
                    cancelled_duplicates = summary.cancelled_duplicates,
                    fallback = summary.used_fallback,
                    "pass complete"
                );
            }
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!(strategy_id, error = %e, "pass failed, retrying next cycle");
            }
            Err(e) => error!(strategy_id, error = %e, "pass failed"),
        }
    }

    /// The main loop: periodic passes over every registered strategy, an
    /// immediate pass for each newly published one, and the audit and
    /// drawdown tasks alongside. Returns once `stop` turns true, after the
    /// immediate passes still running have been aborted.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<(), EngineError> {
        self.rehydrate().await?;
        if *stop.borrow() {
            return Ok(());
        }
        let mut bus_rx = match self.bus_rx.lock().await.take() {
            Some(rx) => rx,
            None => self.bus.subscribe(),
        };

        let audit = tokio::spawn(Arc::clone(&self).run_audit(stop.clone()));
        let drawdown = tokio::spawn(Arc::clone(&self.drawdown).run(stop.clone()));

        info!(
            trader_id = %self.trader_id,
            interval_secs = self.config.engine.reconcile_interval_secs,
            provider = self.provider.name(),
            "engine is running"
        );
        let mut ticker = tokio::time::interval(self.config.engine.reconcile_interval());
        let mut immediate = JoinSet::new();
        loop {
            tokio::select! {
                Some(_) = immediate.join_next(), if !immediate.is_empty() => {}
                _ = ticker.tick() => {
                    let ids = self.strategy_ids().await;
                    let engine = &self;
                    let passes = join_all(ids.iter().map(|id| async move {
                        (id, engine.run_pass(id).await)
                    }));
                    tokio::select! {
                        results = passes => {
                            for (id, result) in results {
                                self.log_pass(id, result);
                            }
                        }
                        _ = stop.changed() => {
                            info!("stop requested mid-cycle, abandoning passes");
                            break;
                        }
                    }
                }
                message = bus_rx.recv() => match message {
                    Ok(message) if message.is_for(&self.trader_id) => {
                        let strategy_id = message.strategy.id.clone();
                        match self.register(message.strategy).await {
                            Ok(()) => {
                                self.spawn_pass(&mut immediate, strategy_id);
                            }
                            Err(e) => error!(strategy_id = %strategy_id, error = %e, "rejected published strategy"),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "strategy bus lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => {
                        warn!("strategy bus closed");
                        break;
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        if !immediate.is_empty() {
            info!(passes = immediate.len(), "aborting immediate passes");
        }
        immediate.shutdown().await;
        let _ = tokio::join!(audit, drawdown);
        info!(trader_id = %self.trader_id, "engine stopped");
        Ok(())
    }
}
