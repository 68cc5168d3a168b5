use crate::error::EngineError;
use api_client::VenueAdapter;
use chrono::Utc;
use configuration::DrawdownSettings;
use core_types::{DecisionAction, ExecutionRecord, Position, PositionSide};
use database::StateStore;
use events::{EmergencyClose, EngineEvent};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, error, info, warn};

/// The hard profit-retracement rule.
///
/// Returns true when the position is still clearly in profit but has given
/// back at least `max_retracement` of its best unrealized PnL.
pub fn evaluate(peak: Decimal, current: Decimal, settings: &DrawdownSettings) -> bool {
    if current <= settings.min_profit_pct || peak <= Decimal::ZERO {
        return false;
    }
    (peak - current) / peak >= settings.max_retracement
}

/// An emergency close the venue refused. The position keeps its peak and is
/// tried again on the next sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseFailure {
    pub symbol: String,
    pub side: PositionSide,
    pub error: String,
}

/// What one sweep did.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    pub closes: Vec<EmergencyClose>,
    pub failures: Vec<CloseFailure>,
}

/// Watches every open position and closes the ones that hand back too much
/// of their peak profit.
///
/// The rule bypasses the risk guard and the decision provider. It acts on the
/// venue's positions directly, whatever the owning strategy's protective
/// orders look like.
pub struct DrawdownMonitor {
    settings: DrawdownSettings,
    trader_id: String,
    venue: Arc<dyn VenueAdapter>,
    store: Arc<dyn StateStore>,
    event_tx: broadcast::Sender<EngineEvent>,
    /// Best PnL% seen per (symbol, side) while the position is open.
    peaks: RwLock<HashMap<(String, PositionSide), Decimal>>,
}

impl DrawdownMonitor {
    pub fn new(
        settings: DrawdownSettings,
        trader_id: &str,
        venue: Arc<dyn VenueAdapter>,
        store: Arc<dyn StateStore>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            settings,
            trader_id: trader_id.to_string(),
            venue,
            store,
            event_tx,
            peaks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn peak(&self, symbol: &str, side: PositionSide) -> Option<Decimal> {
        self.peaks
            .read()
            .await
            .get(&(symbol.to_string(), side))
            .copied()
    }

    /// One sweep over the account's positions.
    ///
    /// Only reading the positions can fail the sweep. A refused close is
    /// reported in [`Sweep::failures`] and the remaining positions are still
    /// handled.
    pub async fn check(&self) -> Result<Sweep, EngineError> {
        let positions: Vec<Position> = self
            .venue
            .get_positions()
            .await?
            .into_iter()
            .filter(|p| p.is_open())
            .collect();

        let mut triggered = Vec::new();
        {
            let mut peaks = self.peaks.write().await;
            peaks.retain(|(symbol, side), _| {
                positions.iter().any(|p| &p.symbol == symbol && p.side == *side)
            });

            for position in &positions {
                let current = position.unrealized_pnl_pct();
                let peak = peaks
                    .entry((position.symbol.clone(), position.side))
                    .or_insert(current);
                if current > *peak {
                    *peak = current;
                }
                if evaluate(*peak, current, &self.settings) {
                    triggered.push((position.clone(), *peak, current));
                }
            }
        }

        let mut sweep = Sweep::default();
        for (position, peak, current) in triggered {
            match self.emergency_close(&position, peak, current).await {
                Ok(close) => sweep.closes.push(close),
                Err(e) => {
                    error!(
                        symbol = %position.symbol,
                        side = %position.side,
                        error = %e,
                        "emergency close failed"
                    );
                    sweep.failures.push(CloseFailure {
                        symbol: position.symbol.clone(),
                        side: position.side,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(sweep)
    }

    async fn emergency_close(
        &self,
        position: &Position,
        peak: Decimal,
        current: Decimal,
    ) -> Result<EmergencyClose, EngineError> {
        warn!(
            symbol = %position.symbol,
            side = %position.side,
            peak_pnl_pct = %peak,
            current_pnl_pct = %current,
            "profit retracement limit hit, closing position"
        );
        let (action, result) = match position.side {
            PositionSide::Long => (
                DecisionAction::CloseLong,
                self.venue.close_long(&position.symbol, None).await,
            ),
            PositionSide::Short => (
                DecisionAction::CloseShort,
                self.venue.close_short(&position.symbol, None).await,
            ),
        };

        let record = ExecutionRecord {
            trader_id: self.trader_id.clone(),
            strategy_id: None,
            action,
            symbol: position.symbol.clone(),
            price: Some(position.mark_price),
            quantity: Some(position.quantity),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_execution(&record).await {
            error!(symbol = %position.symbol, error = %e, "failed to persist emergency close");
        }
        let ack = result?;

        self.peaks
            .write()
            .await
            .remove(&(position.symbol.clone(), position.side));

        let event = EmergencyClose {
            trader_id: self.trader_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            peak_pnl_pct: peak,
            current_pnl_pct: current,
            order_id: ack.map(|a| a.order_id),
            timestamp: Utc::now(),
        };
        let _ = self.event_tx.send(EngineEvent::EmergencyClose(event.clone()));
        Ok(event)
    }

    /// Runs sweeps every `check_interval` until `stop` flips to true.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        if !self.settings.enabled {
            debug!("drawdown monitor disabled");
            return;
        }
        info!(
            interval_secs = self.settings.check_interval_secs,
            min_profit_pct = %self.settings.min_profit_pct,
            max_retracement = %self.settings.max_retracement,
            "drawdown monitor started"
        );
        let mut ticker = tokio::time::interval(self.settings.check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        error!(error = %e, "drawdown sweep failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("drawdown monitor stopped");
    }
}
