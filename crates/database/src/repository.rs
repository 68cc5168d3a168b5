use crate::DbError;
use crate::store::StateStore;
use async_trait::async_trait;
use core_types::{
    DecisionRecord, ExecutionRecord, Phase, StrategyExecutionState, StrategyOrderRecord,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, warn};

/// The `DbRepository` is the PostgreSQL-backed `StateStore`. It encapsulates
/// all SQL queries and data access logic.
#[derive(Debug, Clone)]
pub struct DbRepository {
    pool: PgPool,
}

/// Stores a unit-like enum as its serde string form.
fn enum_text<T: Serialize>(value: &T) -> Result<String, DbError> {
    match serde_json::to_value(value)? {
        JsonValue::String(text) => Ok(text),
        other => Err(DbError::InvalidRow(format!("expected a string enum, got {}", other))),
    }
}

fn enum_from_text<T: DeserializeOwned>(text: String) -> Result<T, DbError> {
    Ok(serde_json::from_value(JsonValue::String(text))?)
}

fn state_from_row(row: &PgRow) -> Result<StrategyExecutionState, DbError> {
    let phase: String = row.get("phase");
    Ok(StrategyExecutionState {
        trader_id: row.get("trader_id"),
        strategy_id: row.get("strategy_id"),
        symbol: row.get("symbol"),
        phase: Phase::from_str(&phase).map_err(|e| DbError::InvalidRow(e.to_string()))?,
        entry_price: row.get("entry_price"),
        quantity: row.get("quantity"),
        realized_pnl: row.get("realized_pnl"),
        updated_at: row.get("updated_at"),
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord, DbError> {
    Ok(ExecutionRecord {
        trader_id: row.get("trader_id"),
        strategy_id: row.get("strategy_id"),
        action: enum_from_text(row.get("action"))?,
        symbol: row.get("symbol"),
        price: row.get("price"),
        quantity: row.get("quantity"),
        success: row.get("success"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

impl DbRepository {
    /// Creates a new repository with a shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for DbRepository {
    async fn load_states(&self, trader_id: &str) -> Result<Vec<StrategyExecutionState>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT trader_id, strategy_id, symbol, phase, entry_price, quantity, realized_pnl, updated_at
            FROM strategy_execution_states
            WHERE trader_id = $1
            ORDER BY strategy_id
            "#,
        )
        .bind(trader_id)
        .fetch_all(&self.pool)
        .await?;

        debug!(trader_id, states = rows.len(), "loaded strategy states");
        rows.iter().map(state_from_row).collect()
    }

    async fn upsert_state(&self, state: &StrategyExecutionState) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO strategy_execution_states
                (trader_id, strategy_id, symbol, phase, entry_price, quantity, realized_pnl, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (trader_id, strategy_id) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                phase = EXCLUDED.phase,
                entry_price = EXCLUDED.entry_price,
                quantity = EXCLUDED.quantity,
                realized_pnl = EXCLUDED.realized_pnl,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.trader_id)
        .bind(&state.strategy_id)
        .bind(&state.symbol)
        .bind(state.phase.as_str())
        .bind(state.entry_price)
        .bind(state.quantity)
        .bind(state.realized_pnl)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .inspect_err(|e| warn!(strategy_id = %state.strategy_id, error = %e, "strategy state upsert failed"))?;

        Ok(())
    }

    async fn load_closed_strategy_ids(&self, trader_id: &str) -> Result<HashSet<String>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_id FROM strategy_execution_states
            WHERE trader_id = $1 AND phase = $2
            "#,
        )
        .bind(trader_id)
        .bind(Phase::Closed.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("strategy_id")).collect())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO execution_records
                (trader_id, strategy_id, action, symbol, price, quantity, success, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.trader_id)
        .bind(&record.strategy_id)
        .bind(record.action.as_str())
        .bind(&record.symbol)
        .bind(record.price)
        .bind(record.quantity)
        .bind(record.success)
        .bind(&record.error)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DbError> {
        let decisions_json = serde_json::to_value(&record.decisions)?;

        sqlx::query(
            r#"
            INSERT INTO decision_records
                (trader_id, strategy_id, report, decisions, used_fallback, provider_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.trader_id)
        .bind(&record.strategy_id)
        .bind(&record.report)
        .bind(decisions_json)
        .bind(record.used_fallback)
        .bind(&record.provider_error)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_strategy_order(&self, record: &StrategyOrderRecord) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO strategy_orders
                (trader_id, strategy_id, venue_order_id, kind, side, price, quantity, leverage, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (trader_id, venue_order_id) DO UPDATE SET
                status = EXCLUDED.status,
                quantity = EXCLUDED.quantity
            "#,
        )
        .bind(&record.trader_id)
        .bind(&record.strategy_id)
        .bind(&record.venue_order_id)
        .bind(enum_text(&record.kind)?)
        .bind(enum_text(&record.side)?)
        .bind(record.price)
        .bind(record.quantity)
        .bind(record.leverage as i32)
        .bind(&record.status)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn has_strategy_orders(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<bool, DbError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM strategy_orders WHERE trader_id = $1 AND strategy_id = $2
            ) AS present
            "#,
        )
        .bind(trader_id)
        .bind(strategy_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("present"))
    }

    async fn execution_records(
        &self,
        trader_id: &str,
        strategy_id: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT trader_id, strategy_id, action, symbol, price, quantity, success, error, created_at
            FROM execution_records
            WHERE trader_id = $1 AND ($2::TEXT IS NULL OR strategy_id = $2)
            ORDER BY created_at, id
            "#,
        )
        .bind(trader_id)
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn decision_records(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<Vec<DecisionRecord>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT trader_id, strategy_id, report, decisions, used_fallback, provider_error, created_at
            FROM decision_records
            WHERE trader_id = $1 AND strategy_id = $2
            ORDER BY created_at, id
            "#,
        )
        .bind(trader_id)
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DecisionRecord, DbError> {
                let decisions: JsonValue = row.get("decisions");
                Ok(DecisionRecord {
                    trader_id: row.get("trader_id"),
                    strategy_id: row.get("strategy_id"),
                    report: row.get("report"),
                    decisions: serde_json::from_value(decisions)?,
                    used_fallback: row.get("used_fallback"),
                    provider_error: row.get("provider_error"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{DecisionAction, OrderKind, OrderSide};

    #[test]
    fn enums_round_trip_through_their_column_text() {
        assert_eq!(enum_text(&OrderKind::TakeProfit).unwrap(), "take_profit");
        assert_eq!(enum_text(&OrderSide::Sell).unwrap(), "sell");
        let action: DecisionAction = enum_from_text("place_limit_order".to_string()).unwrap();
        assert_eq!(action, DecisionAction::PlaceLimitOrder);
        assert!(enum_from_text::<DecisionAction>("teleport".to_string()).is_err());
    }
}
