mod common;

use api_client::VenueAdapter;
use common::*;
use core_types::{
    Decision, DecisionAction, LimitOrderRequest, OrderKind, OrderSide, Phase, PositionSide,
};
use database::StateStore;
use engine::{EngineError, Outcome};
use events::EngineEvent;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

async fn limit_orders(h: &Harness) -> Vec<(Decimal, OrderSide)> {
    h.venue
        .get_open_orders("BTCUSDT")
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.kind == OrderKind::Limit)
        .map(|o| (o.price, o.side))
        .collect()
}

#[tokio::test]
async fn empty_venue_gets_the_whole_ladder() {
    let h = harness();
    h.engine.register(Arc::new(ladder())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert!(summary.consulted);
    assert!(summary.used_fallback);

    let placed: Vec<_> = summary
        .outcomes
        .iter()
        .map(|o| (o.decision.price, o.decision.position_size_usd, o.is_executed()))
        .collect();
    // The first two rungs commit 4016 and 3012 of the 10000. The last one is
    // shrunk to 95% of the 2972 left.
    assert_eq!(
        placed,
        vec![
            (Some(dec!(60000)), Some(dec!(40000)), true),
            (Some(dec!(61000)), Some(dec!(30000)), true),
            (Some(dec!(62000)), Some(dec!(28234)), true),
        ]
    );
    let balance = h.venue.get_balance().await.unwrap();
    assert!(balance.available >= Decimal::ZERO);
    assert_eq!(
        limit_orders(&h).await,
        vec![
            (dec!(60000), OrderSide::Buy),
            (dec!(61000), OrderSide::Buy),
            (dec!(62000), OrderSide::Buy),
        ]
    );

    let decisions = h.store.decision_records(TRADER, "s-1").await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].used_fallback);
    assert_eq!(h.store.strategy_orders().await.len(), 3);
}

#[tokio::test]
async fn open_position_without_take_profit_gets_exactly_one() {
    let h = harness();
    h.venue.set_leverage("BTCUSDT", 10).await.unwrap();
    h.venue.set_mark_price("BTCUSDT", dec!(60050)).await;
    h.venue.open_long("BTCUSDT", dec!(0.5)).await.unwrap();
    h.venue
        .set_stop_loss("BTCUSDT", PositionSide::Long, dec!(58000))
        .await
        .unwrap();
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    let report = summary.report.as_ref().unwrap();
    assert!(report.missing_points.is_empty());
    assert!(!report.missing_stop_loss);
    assert_eq!(report.missing_take_profits, vec![dec!(65000)]);

    assert_eq!(summary.outcomes.len(), 1);
    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.decision.action, DecisionAction::SetTakeProfit);
    assert_eq!(outcome.decision.take_profit, Some(dec!(65000)));
    assert!(outcome.is_executed());
    assert_eq!(summary.transition.unwrap().to, Phase::Entry);

    let orders = h.venue.get_open_orders("BTCUSDT").await.unwrap();
    assert!(
        orders
            .iter()
            .any(|o| o.kind == OrderKind::TakeProfit && o.price == dec!(65000))
    );
}

#[tokio::test]
async fn identical_orders_are_collapsed_to_the_first() {
    let h = harness();
    let mut ids = Vec::new();
    for n in 0..2 {
        let ack = h
            .venue
            .place_limit_order(&LimitOrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                price: dec!(60000),
                quantity: dec!(0.01),
                client_order_id: format!("manual-{}", n),
            })
            .await
            .unwrap();
        ids.push(ack.order_id);
    }
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert_eq!(summary.cancelled_duplicates, 1);
    assert!(!summary.consulted, "the surviving order already covers the entry");

    let orders = h.venue.get_open_orders("BTCUSDT").await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, ids[0]);

    let records = h.store.execution_records(TRADER, Some("s-1")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, DecisionAction::CancelOrder);
}

#[tokio::test]
async fn repeated_passes_converge_on_one_entry_order() {
    let mut config = config();
    config.engine.decision_cooldown_secs = 0;
    let h = harness_with(config, dec!(10000), Arc::new(engine::DeclineProvider));
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    for cycle in 0..5 {
        let summary = h.engine.run_pass("s-1").await.unwrap();
        assert_eq!(summary.consulted, cycle == 0, "cycle {}", cycle);
        assert_eq!(limit_orders(&h).await, vec![(dec!(60000), OrderSide::Buy)]);
    }
    let state = h.engine.tracker().state(TRADER, "s-1").await.unwrap();
    assert_eq!(state.phase, Phase::EntryPending);
}

#[tokio::test]
async fn unchanged_venue_yields_no_new_actions() {
    let mut config = config();
    config.engine.decision_cooldown_secs = 0;
    let h = harness_with(config, dec!(10000), Arc::new(engine::DeclineProvider));
    h.engine.register(Arc::new(ladder())).await.unwrap();

    h.engine.run_pass("s-1").await.unwrap();
    let before = h.store.execution_records(TRADER, None).await.unwrap().len();
    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert!(summary.outcomes.is_empty());
    assert_eq!(h.store.execution_records(TRADER, None).await.unwrap().len(), before);
}

#[tokio::test]
async fn oversized_batch_never_commits_more_than_the_balance() {
    let oversized = |price| Decision::place_limit("BTCUSDT", OrderSide::Buy, price, dec!(1000000), 10);
    let provider = ScriptedProvider::new(vec![Ok(vec![
        oversized(dec!(60000)),
        oversized(dec!(61000)),
        oversized(dec!(62000)),
    ])]);
    let h = harness_with(config(), dec!(10000), provider);
    h.engine.register(Arc::new(ladder())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert!(!summary.used_fallback);
    assert_eq!(summary.executed(), 3);
    let notionals: Vec<_> = summary
        .outcomes
        .iter()
        .map(|o| o.decision.position_size_usd.unwrap())
        .collect();
    assert_eq!(notionals[0], dec!(95000));
    assert!(notionals[1] < notionals[0] && notionals[2] < notionals[1]);

    let committed: Decimal = notionals
        .iter()
        .map(|n| n / dec!(10) + n * dec!(0.0004))
        .sum();
    assert!(committed <= dec!(10000), "{} committed", committed);
    assert_eq!(limit_orders(&h).await.len(), 3);
}

#[tokio::test]
async fn empty_account_is_rejected_locally() {
    let h = harness_with(config(), Decimal::ZERO, Arc::new(engine::DeclineProvider));
    h.engine.register(Arc::new(ladder())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert_eq!(summary.outcomes.len(), 3);
    assert!(
        summary
            .outcomes
            .iter()
            .all(|o| matches!(o.outcome, Outcome::Rejected(_)))
    );
    assert!(limit_orders(&h).await.is_empty());

    let records = h.store.execution_records(TRADER, Some("s-1")).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.success));
}

#[tokio::test]
async fn declining_provider_is_retried_with_the_directive() {
    let provider = ScriptedProvider::new(vec![
        Ok(vec![Decision::hold("BTCUSDT", "looks fine")]),
        Ok(vec![Decision::place_limit(
            "BTCUSDT",
            OrderSide::Buy,
            dec!(60000),
            dec!(50000),
            10,
        )]),
    ]);
    let h = harness_with(config(), dec!(10000), provider.clone());
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert!(!summary.used_fallback);
    assert_eq!(summary.executed(), 1);

    let instructions = provider.instructions.lock().unwrap().clone();
    assert_eq!(instructions.len(), 2);
    assert!(!instructions[0].contains("Holding is not acceptable"));
    assert!(instructions[1].contains("Holding is not acceptable"));
}

#[tokio::test]
async fn failing_provider_falls_back_and_records_the_error() {
    let provider = ScriptedProvider::new(vec![
        Err("upstream timeout".to_string()),
        Ok(vec![]),
    ]);
    let h = harness_with(config(), dec!(10000), provider.clone());
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert_eq!(provider.calls(), 2);
    assert!(summary.used_fallback);
    assert_eq!(limit_orders(&h).await, vec![(dec!(60000), OrderSide::Buy)]);

    let records = h.store.decision_records(TRADER, "s-1").await.unwrap();
    assert_eq!(records[0].provider_error.as_deref(), Some("Decision provider error: upstream timeout"));
}

#[tokio::test(start_paused = true)]
async fn provider_is_consulted_once_per_cooldown_window() {
    let provider = ScriptedProvider::new(vec![]);
    let h = harness_with(config(), dec!(10000), provider.clone());
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    h.engine.run_pass("s-1").await.unwrap();
    assert_eq!(provider.calls(), 2);

    // Knock the entry order out so the divergence persists.
    let order_id = h.venue.get_open_orders("BTCUSDT").await.unwrap()[0].id.clone();
    h.venue.cancel_order("BTCUSDT", &order_id).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert!(!summary.consulted);
    assert!(limit_orders(&h).await.is_empty());

    tokio::time::advance(Duration::from_secs(121)).await;
    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert!(summary.consulted);
    assert_eq!(limit_orders(&h).await.len(), 1);
}

#[tokio::test]
async fn wrong_phase_actions_never_reach_the_venue() {
    let provider = ScriptedProvider::new(vec![Ok(vec![
        Decision::set_stop_loss("BTCUSDT", PositionSide::Long, dec!(58000)),
        Decision::new(DecisionAction::CloseLong, "BTCUSDT"),
    ])]);
    let h = harness_with(config(), dec!(10000), provider);
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    let summary = h.engine.run_pass("s-1").await.unwrap();
    assert!(
        summary
            .outcomes
            .iter()
            .all(|o| matches!(o.outcome, Outcome::Skipped(_)))
    );
    assert!(h.venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());
    assert!(h.store.execution_records(TRADER, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn lost_position_closes_the_strategy_for_good() {
    let h = harness();
    let mut events = h.engine.subscribe_events();
    h.venue.set_leverage("BTCUSDT", 10).await.unwrap();
    h.venue.set_mark_price("BTCUSDT", dec!(60000)).await;
    h.venue.open_long("BTCUSDT", dec!(0.5)).await.unwrap();
    h.engine.register(Arc::new(entry_only())).await.unwrap();

    let first = h.engine.run_pass("s-1").await.unwrap();
    assert_eq!(first.transition.unwrap().to, Phase::Entry);
    assert_eq!(first.executed(), 2, "stop-loss and take-profit");

    h.venue.close_long("BTCUSDT", None).await.unwrap();
    let second = h.engine.run_pass("s-1").await.unwrap();
    assert_eq!(second.transition.unwrap().to, Phase::Closed);
    assert!(h.engine.tracker().is_closed(TRADER, "s-1").await);

    assert!(matches!(
        h.engine.run_pass("s-1").await,
        Err(EngineError::StrategyNotFound(_))
    ));
    h.engine.register(Arc::new(entry_only())).await.unwrap();
    assert!(h.engine.strategy_ids().await.is_empty());

    let mut saw_close = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::PhaseChanged(change) = event {
            saw_close |= change.to == Phase::Closed;
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn audit_closes_protected_strategies_without_a_position() {
    let h = harness();
    h.venue.set_leverage("BTCUSDT", 10).await.unwrap();
    h.venue.set_mark_price("BTCUSDT", dec!(60000)).await;
    h.venue.open_long("BTCUSDT", dec!(0.5)).await.unwrap();
    h.engine.register(Arc::new(entry_only())).await.unwrap();
    h.engine.run_pass("s-1").await.unwrap();

    h.venue.close_long("BTCUSDT", None).await.unwrap();
    assert_eq!(h.engine.audit().await.unwrap(), vec!["s-1".to_string()]);
    assert!(h.engine.strategy_ids().await.is_empty());
}

#[tokio::test]
async fn restart_resumes_from_persisted_orders() {
    let h = harness();
    h.engine.register(Arc::new(entry_only())).await.unwrap();
    h.engine.run_pass("s-1").await.unwrap();

    // A second engine over the same store and venue, as after a restart.
    let restarted = engine::Engine::new(
        config(),
        h.venue.clone(),
        h.store.clone(),
        Arc::new(engine::DeclineProvider),
    )
    .unwrap();
    restarted.rehydrate().await.unwrap();
    restarted.register(Arc::new(entry_only())).await.unwrap();

    let summary = restarted.run_pass("s-1").await.unwrap();
    assert!(!summary.consulted);
    assert_eq!(summary.transition.unwrap().to, Phase::EntryPending);
    assert_eq!(limit_orders(&h).await.len(), 1);
}
