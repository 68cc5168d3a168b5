use crate::error::EngineError;
use chrono::Utc;
use core_types::{Phase, Position, Strategy, StrategyExecutionState};
use database::StateStore;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type StateKey = (String, String);

fn key(trader_id: &str, strategy_id: &str) -> StateKey {
    (trader_id.to_string(), strategy_id.to_string())
}

/// A phase change applied by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// The phase a strategy moves to given what the venue shows.
///
/// `Closed` is absorbing. A strategy that held a position and lost it is
/// closed. `Done` never regresses while its position stays open. Earlier
/// phases follow the observation.
pub fn next_phase(current: Phase, observed: Phase, has_position: bool) -> Phase {
    match current {
        Phase::Closed => Phase::Closed,
        Phase::Entry | Phase::Done if !has_position => Phase::Closed,
        Phase::Done => Phase::Done,
        Phase::Entry => match observed {
            Phase::Done => Phase::Done,
            _ => Phase::Entry,
        },
        Phase::Waiting | Phase::EntryPending => observed,
    }
}

/// Per (trader, strategy) phase records, cached in memory and written
/// through to the `StateStore`.
pub struct StateTracker {
    store: Arc<dyn StateStore>,
    states: RwLock<HashMap<StateKey, StrategyExecutionState>>,
    closed: RwLock<HashSet<StateKey>>,
    /// Unrealized PnL of each held position at its last observation. Booked
    /// as realized when the strategy closes.
    open_pnl: RwLock<HashMap<StateKey, Decimal>>,
}

impl StateTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            states: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashSet::new()),
            open_pnl: RwLock::new(HashMap::new()),
        }
    }

    /// Moves the last observed PnL of the position into `realized_pnl`.
    async fn book_pnl(&self, key: &StateKey, state: &mut StrategyExecutionState) {
        if let Some(pnl) = self.open_pnl.write().await.remove(key) {
            state.realized_pnl += pnl;
        }
    }

    /// Loads every persisted state of `trader_id`. Returns how many were loaded.
    pub async fn rehydrate(&self, trader_id: &str) -> Result<usize, EngineError> {
        let loaded = self.store.load_states(trader_id).await?;
        let closed_ids = self.store.load_closed_strategy_ids(trader_id).await?;

        let count = loaded.len();
        let mut states = self.states.write().await;
        for state in loaded {
            states.insert(key(&state.trader_id, &state.strategy_id), state);
        }
        let mut closed = self.closed.write().await;
        closed.extend(closed_ids.iter().map(|id| key(trader_id, id)));

        info!(trader_id, states = count, closed = closed_ids.len(), "strategy states rehydrated");
        Ok(count)
    }

    pub async fn is_closed(&self, trader_id: &str, strategy_id: &str) -> bool {
        self.closed.read().await.contains(&key(trader_id, strategy_id))
    }

    pub async fn state(&self, trader_id: &str, strategy_id: &str) -> Option<StrategyExecutionState> {
        self.states.read().await.get(&key(trader_id, strategy_id)).cloned()
    }

    /// Returns the tracked state, creating it on first sight.
    ///
    /// A strategy the store already placed orders for starts in
    /// `EntryPending`, so a restart does not treat it as untouched.
    pub async fn ensure(
        &self,
        trader_id: &str,
        strategy: &Strategy,
    ) -> Result<StrategyExecutionState, EngineError> {
        if let Some(state) = self.state(trader_id, &strategy.id).await {
            return Ok(state);
        }

        let mut state = StrategyExecutionState::new(trader_id, &strategy.id, &strategy.symbol);
        if self.store.has_strategy_orders(trader_id, &strategy.id).await? {
            state.phase = Phase::EntryPending;
        }
        self.store.upsert_state(&state).await?;
        debug!(strategy_id = %strategy.id, phase = %state.phase, "tracking new strategy");

        let mut states = self.states.write().await;
        Ok(states
            .entry(key(trader_id, &strategy.id))
            .or_insert(state)
            .clone())
    }

    /// Applies one observation and persists the result.
    pub async fn observe(
        &self,
        trader_id: &str,
        strategy: &Strategy,
        observed: Phase,
        position: Option<&Position>,
    ) -> Result<Transition, EngineError> {
        let current = self.ensure(trader_id, strategy).await?;
        if current.phase.is_terminal() {
            return Ok(Transition {
                from: Phase::Closed,
                to: Phase::Closed,
            });
        }
        let to = next_phase(current.phase, observed, position.is_some());
        let transition = Transition {
            from: current.phase,
            to,
        };

        let state_key = key(trader_id, &strategy.id);
        let mut next = current.clone();
        next.phase = to;
        if let Some(p) = position {
            next.entry_price = Some(p.entry_price);
            next.quantity = p.quantity;
            self.open_pnl
                .write()
                .await
                .insert(state_key.clone(), p.unrealized_pnl);
        } else if to == Phase::Closed {
            next.quantity = Decimal::ZERO;
            self.book_pnl(&state_key, &mut next).await;
        }

        if next.phase == current.phase
            && next.entry_price == current.entry_price
            && next.quantity == current.quantity
        {
            return Ok(transition);
        }
        next.updated_at = Utc::now();
        self.store.upsert_state(&next).await?;

        if transition.changed() {
            info!(
                strategy_id = %strategy.id,
                symbol = %strategy.symbol,
                from = %transition.from,
                to = %transition.to,
                "strategy phase changed"
            );
        }
        if to == Phase::Closed {
            info!(strategy_id = %strategy.id, realized_pnl = %next.realized_pnl, "strategy closed");
            self.closed.write().await.insert(state_key.clone());
        }
        self.states.write().await.insert(state_key, next);
        Ok(transition)
    }

    /// Forces a strategy into `Closed`. `None` if it was never tracked.
    pub async fn close(
        &self,
        trader_id: &str,
        strategy_id: &str,
        reason: &str,
    ) -> Result<Option<Transition>, EngineError> {
        let Some(current) = self.state(trader_id, strategy_id).await else {
            return Ok(None);
        };
        let transition = Transition {
            from: current.phase,
            to: Phase::Closed,
        };
        if current.phase != Phase::Closed {
            let mut next = current;
            next.phase = Phase::Closed;
            next.quantity = Decimal::ZERO;
            self.book_pnl(&key(trader_id, strategy_id), &mut next).await;
            next.updated_at = Utc::now();
            self.store.upsert_state(&next).await?;
            warn!(strategy_id, from = %transition.from, realized_pnl = %next.realized_pnl, reason, "strategy closed");
            self.states
                .write()
                .await
                .insert(key(trader_id, strategy_id), next);
        }
        self.closed.write().await.insert(key(trader_id, strategy_id));
        Ok(Some(transition))
    }

    /// Closes every `Entry`/`Done` strategy whose symbol has no live position.
    /// Returns the ids it closed.
    pub async fn audit(
        &self,
        trader_id: &str,
        positions: &[Position],
    ) -> Result<Vec<(String, Transition)>, EngineError> {
        let zombies: Vec<String> = self
            .states
            .read()
            .await
            .values()
            .filter(|s| s.trader_id == trader_id && s.phase.holds_position())
            .filter(|s| !positions.iter().any(|p| p.symbol == s.symbol && p.is_open()))
            .map(|s| s.strategy_id.clone())
            .collect();

        let mut closed = Vec::with_capacity(zombies.len());
        for strategy_id in zombies {
            if let Some(transition) = self
                .close(trader_id, &strategy_id, "audit found no live position")
                .await?
            {
                closed.push((strategy_id, transition));
            }
        }
        Ok(closed)
    }
}
