mod common;

use api_client::VenueAdapter;
use async_trait::async_trait;
use common::*;
use core_types::Decision;
use engine::EngineError;
use engine::decision::{DecisionContext, DecisionProvider};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn published_strategy_is_reconciled_and_stop_ends_the_loop() {
    let h = harness();
    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::clone(&h.engine).run(stop_rx));

    h.engine.bus().publish(Some(TRADER), entry_only()).unwrap();

    let placed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !h.venue.get_open_orders("BTCUSDT").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(placed.is_ok(), "published strategy was never reconciled");
    assert_eq!(h.engine.strategy_ids().await, vec!["s-1".to_string()]);

    stop_tx.send(true).unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(5), running).await;
    assert!(matches!(finished, Ok(Ok(Ok(())))));
}

#[tokio::test]
async fn strategies_for_other_traders_are_ignored() {
    let h = harness();
    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::clone(&h.engine).run(stop_rx));

    h.engine.bus().publish(Some("someone-else"), entry_only()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.engine.strategy_ids().await.is_empty());
    assert!(h.venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());

    stop_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn invalid_strategies_never_reach_the_bus() {
    let h = harness();
    let mut broken = entry_only();
    broken.stop_loss = dec!(0);
    assert!(h.engine.bus().publish(Some(TRADER), broken).is_err());
}

/// Never answers. Flags `dropped` once the pending call is abandoned.
struct HangingProvider {
    entered: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DecisionProvider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn decide(&self, _: &DecisionContext, _: &str) -> Result<Vec<Decision>, EngineError> {
        let _guard = SetOnDrop(self.dropped.clone());
        self.entered.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(vec![])
    }
}

#[tokio::test]
async fn stop_aborts_passes_started_by_a_publish() {
    let entered = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicBool::new(false));
    let provider = Arc::new(HangingProvider {
        entered: entered.clone(),
        dropped: dropped.clone(),
    });
    let h = harness_with(config(), dec!(10000), provider);
    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::clone(&h.engine).run(stop_rx));

    h.engine.bus().publish(Some(TRADER), entry_only()).unwrap();
    let consulted = tokio::time::timeout(Duration::from_secs(5), async {
        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(consulted.is_ok(), "the immediate pass never reached the provider");

    stop_tx.send(true).unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(5), running).await;
    assert!(matches!(finished, Ok(Ok(Ok(())))));
    assert!(dropped.load(Ordering::SeqCst), "the pass outlived the engine");
}
