use chrono::{DateTime, Utc};
use core_types::{ExecutionRecord, Phase, PositionSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A strategy moved from one phase to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub trader_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub from: Phase,
    pub to: Phase,
    pub timestamp: DateTime<Utc>,
}

/// The drawdown monitor closed a position outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyClose {
    pub trader_id: String,
    pub symbol: String,
    pub side: PositionSide,
    /// Peak unrealized PnL, in percent of margin.
    pub peak_pnl_pct: Decimal,
    pub current_pnl_pct: Decimal,
    /// `None` when the position was already flat by the time the close landed.
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the engine broadcasts to its observers.
///
/// Serialized as `{"type": ..., "payload": ...}` so a log sink or UI can
/// dispatch on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    /// A strategy was accepted from the bus and will be reconciled.
    StrategyRegistered { strategy_id: String, symbol: String },
    PhaseChanged(PhaseChange),
    EmergencyClose(EmergencyClose),
    /// A non-passive action reached the venue (or was rejected before it).
    ActionExecuted(ExecutionRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_with_their_type() {
        let event = EngineEvent::StrategyRegistered {
            strategy_id: "s-1".to_string(),
            symbol: "BTCUSDT".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StrategyRegistered");
        assert_eq!(json["payload"]["symbol"], "BTCUSDT");
    }

    #[test]
    fn phase_changes_use_persisted_phase_names() {
        let event = EngineEvent::PhaseChanged(PhaseChange {
            trader_id: "t-1".to_string(),
            strategy_id: "s-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            from: Phase::EntryPending,
            to: Phase::Entry,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["from"], "ENTRY_PENDING");
        assert_eq!(json["payload"]["to"], "ENTRY");
    }
}
