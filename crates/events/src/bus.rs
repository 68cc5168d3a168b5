use crate::error::EventsError;
use core_types::Strategy;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// One published strategy. `trader_id: None` addresses every trader.
#[derive(Debug, Clone)]
pub struct StrategyMessage {
    pub trader_id: Option<String>,
    pub strategy: Arc<Strategy>,
}

impl StrategyMessage {
    /// Whether an engine running for `trader_id` should pick this message up.
    pub fn is_for(&self, trader_id: &str) -> bool {
        self.trader_id.as_deref().is_none_or(|t| t == trader_id)
    }
}

/// Publish/subscribe channel for strategies.
///
/// Strategies travel as immutable `Arc` snapshots; subscribers never share
/// mutable state with the publisher.
#[derive(Debug, Clone)]
pub struct StrategyBus {
    tx: broadcast::Sender<StrategyMessage>,
}

impl StrategyBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StrategyMessage> {
        self.tx.subscribe()
    }

    /// Validates and publishes `strategy`. Returns how many subscribers received it.
    pub fn publish(
        &self,
        trader_id: Option<&str>,
        strategy: Strategy,
    ) -> Result<usize, EventsError> {
        strategy
            .validate()
            .map_err(|e| EventsError::InvalidStrategy(strategy.id.clone(), e))?;

        let strategy_id = strategy.id.clone();
        let message = StrategyMessage {
            trader_id: trader_id.map(str::to_string),
            strategy: Arc::new(strategy),
        };
        match self.tx.send(message) {
            Ok(receivers) => {
                info!(strategy_id = %strategy_id, receivers, "strategy published");
                Ok(receivers)
            }
            Err(_) => {
                debug!(strategy_id = %strategy_id, "strategy published with no subscribers");
                Ok(0)
            }
        }
    }
}

impl Default for StrategyBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_types::Direction;
    use rust_decimal_macros::dec;

    fn strategy(id: &str) -> Strategy {
        Strategy {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(60000),
            add_points: vec![],
            stop_loss: dec!(58000),
            take_profits: vec![dec!(65000)],
            leverage: None,
            rationale: String::new(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_shared_snapshots() {
        let bus = StrategyBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(Some("t-1"), strategy("s-1")).unwrap(), 2);

        let first = a.recv().await.unwrap();
        let second = b.recv().await.unwrap();
        assert!(Arc::ptr_eq(&first.strategy, &second.strategy));
        assert!(first.is_for("t-1"));
        assert!(!first.is_for("t-2"));
    }

    #[tokio::test]
    async fn invalid_strategies_are_not_published() {
        let bus = StrategyBus::default();
        let mut rx = bus.subscribe();
        let mut bad = strategy("s-2");
        bad.entry_price = dec!(0);

        assert!(matches!(
            bus.publish(None, bad),
            Err(EventsError::InvalidStrategy(id, _)) if id == "s-2"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let bus = StrategyBus::default();
        assert_eq!(bus.publish(None, strategy("s-3")).unwrap(), 0);
    }
}
