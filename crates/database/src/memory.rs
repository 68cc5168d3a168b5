use crate::error::DbError;
use crate::store::StateStore;
use async_trait::async_trait;
use core_types::{
    DecisionRecord, ExecutionRecord, Phase, StrategyExecutionState, StrategyOrderRecord,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    states: HashMap<(String, String), StrategyExecutionState>,
    executions: Vec<ExecutionRecord>,
    decisions: Vec<DecisionRecord>,
    orders: Vec<StrategyOrderRecord>,
}

/// A `StateStore` that lives only as long as the process.
///
/// Used for paper runs without a `DATABASE_URL` and throughout the tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All strategy orders recorded so far, in insertion order.
    pub async fn strategy_orders(&self) -> Vec<StrategyOrderRecord> {
        self.tables.read().await.orders.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_states(&self, trader_id: &str) -> Result<Vec<StrategyExecutionState>, DbError> {
        let tables = self.tables.read().await;
        let mut states: Vec<_> = tables
            .states
            .values()
            .filter(|s| s.trader_id == trader_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        Ok(states)
    }

    async fn upsert_state(&self, state: &StrategyExecutionState) -> Result<(), DbError> {
        let key = (state.trader_id.clone(), state.strategy_id.clone());
        self.tables.write().await.states.insert(key, state.clone());
        Ok(())
    }

    async fn load_closed_strategy_ids(&self, trader_id: &str) -> Result<HashSet<String>, DbError> {
        let tables = self.tables.read().await;
        Ok(tables
            .states
            .values()
            .filter(|s| s.trader_id == trader_id && s.phase == Phase::Closed)
            .map(|s| s.strategy_id.clone())
            .collect())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        self.tables.write().await.executions.push(record.clone());
        Ok(())
    }

    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DbError> {
        self.tables.write().await.decisions.push(record.clone());
        Ok(())
    }

    async fn record_strategy_order(&self, record: &StrategyOrderRecord) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        // Same semantics as the unique (trader_id, venue_order_id) constraint.
        match tables.orders.iter_mut().find(|o| {
            o.trader_id == record.trader_id && o.venue_order_id == record.venue_order_id
        }) {
            Some(existing) => *existing = record.clone(),
            None => tables.orders.push(record.clone()),
        }
        Ok(())
    }

    async fn has_strategy_orders(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<bool, DbError> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .iter()
            .any(|o| o.trader_id == trader_id && o.strategy_id == strategy_id))
    }

    async fn execution_records(
        &self,
        trader_id: &str,
        strategy_id: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .iter()
            .filter(|r| r.trader_id == trader_id)
            .filter(|r| strategy_id.is_none() || r.strategy_id.as_deref() == strategy_id)
            .cloned()
            .collect())
    }

    async fn decision_records(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<Vec<DecisionRecord>, DbError> {
        let tables = self.tables.read().await;
        Ok(tables
            .decisions
            .iter()
            .filter(|r| r.trader_id == trader_id && r.strategy_id == strategy_id)
            .cloned()
            .collect())
    }
}
