use crate::error::DbError;
use async_trait::async_trait;
use core_types::{DecisionRecord, ExecutionRecord, StrategyExecutionState, StrategyOrderRecord};
use std::collections::HashSet;

/// Durable storage for everything the engine must remember across restarts.
///
/// States are keyed by `(trader_id, strategy_id)`. Records are append-only.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// All non-terminal and terminal states of one trader.
    async fn load_states(&self, trader_id: &str) -> Result<Vec<StrategyExecutionState>, DbError>;

    /// Inserts or replaces the state for `(state.trader_id, state.strategy_id)`.
    async fn upsert_state(&self, state: &StrategyExecutionState) -> Result<(), DbError>;

    /// Strategy ids whose state is `CLOSED` for this trader.
    async fn load_closed_strategy_ids(&self, trader_id: &str) -> Result<HashSet<String>, DbError>;

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), DbError>;

    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DbError>;

    async fn record_strategy_order(&self, record: &StrategyOrderRecord) -> Result<(), DbError>;

    /// Whether any order was ever placed on behalf of this strategy.
    async fn has_strategy_orders(&self, trader_id: &str, strategy_id: &str)
    -> Result<bool, DbError>;

    /// Execution records of a trader, oldest first, optionally for one strategy.
    async fn execution_records(
        &self,
        trader_id: &str,
        strategy_id: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, DbError>;

    /// Decision records of one strategy, oldest first.
    async fn decision_records(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<Vec<DecisionRecord>, DbError>;
}
