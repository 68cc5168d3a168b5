use configuration::ToleranceSettings;
use core_types::{
    ExpectedPricePoint, OpenOrder, OrderHistoryRecord, OrderKind, Phase, Position, Strategy,
    StrategyExecutionState, within_tolerance,
};
use rust_decimal::Decimal;
use std::fmt::Write;

/// Venue state for one strategy's symbol, as observed at the start of a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VenueSnapshot {
    pub positions: Vec<Position>,
    pub open_orders: Vec<OpenOrder>,
    pub history: Vec<OrderHistoryRecord>,
}

/// Why a ladder point is (or is not) considered in place.
#[derive(Debug, Clone, PartialEq)]
pub enum PointStatus {
    /// The open position's entry price matches the point.
    Position,
    /// A past fill matches the point.
    Filled { order_id: String },
    /// A live limit order already waits at the point.
    Pending { order_id: String },
    /// Unsatisfied, but a position is open and the ladder is frozen.
    Deferred,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointReport {
    pub point: ExpectedPricePoint,
    pub status: PointStatus,
}

/// The outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceReport {
    pub strategy_id: String,
    pub symbol: String,
    pub points: Vec<PointReport>,
    /// The open position on the strategy's side, if any.
    pub position: Option<Position>,
    pub missing_points: Vec<ExpectedPricePoint>,
    pub missing_stop_loss: bool,
    /// Take-profit prices with no covering order.
    pub missing_take_profits: Vec<Decimal>,
    /// Live stop-loss orders on the strategy's side, at any price.
    pub stop_loss_orders: usize,
    /// Live take-profit orders on the strategy's side, at any price.
    pub take_profit_orders: usize,
    /// Later copies of an already-live order. Reconciled as if already gone.
    pub duplicates: Vec<OpenOrder>,
    /// The phase the venue state corresponds to.
    pub observed_phase: Phase,
}

impl DivergenceReport {
    pub fn has_divergence(&self) -> bool {
        !self.missing_points.is_empty() || self.missing_stop_loss || self.missing_take_profit()
    }

    pub fn missing_take_profit(&self) -> bool {
        !self.missing_take_profits.is_empty()
    }

    /// A deterministic, line-oriented summary handed to the decision provider.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "strategy {} on {}: observed phase {}",
            self.strategy_id, self.symbol, self.observed_phase
        );
        match &self.position {
            Some(p) => {
                let _ = writeln!(
                    out,
                    "position: {} {} @ {} (pnl {}% of margin)",
                    p.side,
                    p.quantity,
                    p.entry_price,
                    p.unrealized_pnl_pct().round_dp(2)
                );
            }
            None => out.push_str("position: none\n"),
        }
        for report in &self.points {
            let status = match &report.status {
                PointStatus::Position => "satisfied by position".to_string(),
                PointStatus::Filled { order_id } => format!("filled by {}", order_id),
                PointStatus::Pending { order_id } => format!("pending as {}", order_id),
                PointStatus::Deferred => "deferred while position is open".to_string(),
                PointStatus::Missing => "MISSING".to_string(),
            };
            let _ = writeln!(
                out,
                "point {} @ {} ({}): {}",
                report.point.kind, report.point.price, report.point.percent, status
            );
        }
        if self.position.is_some() {
            let _ = writeln!(
                out,
                "stop-loss: {}",
                if self.missing_stop_loss { "MISSING" } else { "present" }
            );
            if self.missing_take_profits.is_empty() {
                out.push_str("take-profit: present\n");
            }
            for price in &self.missing_take_profits {
                let _ = writeln!(out, "take-profit @ {}: MISSING", price);
            }
        }
        for order in &self.duplicates {
            let _ = writeln!(
                out,
                "duplicate {:?} {:?} order {} @ {}",
                order.kind, order.side, order.id, order.price
            );
        }
        out
    }
}

/// Returns the later copies among orders that share symbol, kind and side
/// and sit within `tolerance` of each other. The earliest of each group survives.
pub fn find_duplicates(orders: &[OpenOrder], tolerance: Decimal) -> Vec<OpenOrder> {
    let mut ordered: Vec<&OpenOrder> = orders.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut kept: Vec<&OpenOrder> = Vec::new();
    let mut duplicates = Vec::new();
    for order in ordered {
        let is_copy = kept.iter().any(|k| {
            k.symbol == order.symbol
                && k.kind == order.kind
                && k.side == order.side
                && within_tolerance(order.price, k.price, tolerance)
        });
        if is_copy {
            duplicates.push(order.clone());
        } else {
            kept.push(order);
        }
    }
    duplicates
}

/// Compares a strategy's declared intent with what the venue shows.
///
/// `reconcile` is a pure function of its inputs: two calls over the same
/// snapshot always produce the same report.
#[derive(Debug, Clone)]
pub struct Reconciler {
    tolerances: ToleranceSettings,
}

impl Reconciler {
    pub fn new(tolerances: ToleranceSettings) -> Self {
        Self { tolerances }
    }

    pub fn tolerances(&self) -> &ToleranceSettings {
        &self.tolerances
    }

    pub fn reconcile(
        &self,
        strategy: &Strategy,
        state: Option<&StrategyExecutionState>,
        snapshot: &VenueSnapshot,
    ) -> DivergenceReport {
        let entry_side = strategy.direction.entry_side();
        let position_side = strategy.direction.position_side();
        let closing_side = position_side.closing_side();

        // --- 1. De-duplicate ---
        let relevant: Vec<OpenOrder> = snapshot
            .open_orders
            .iter()
            .filter(|o| o.symbol == strategy.symbol)
            .cloned()
            .collect();
        let duplicates = find_duplicates(&relevant, self.tolerances.duplicate_order);
        let live: Vec<&OpenOrder> = relevant
            .iter()
            .filter(|o| !duplicates.iter().any(|d| d.id == o.id))
            .collect();

        let position = snapshot
            .positions
            .iter()
            .find(|p| p.symbol == strategy.symbol && p.side == position_side && p.is_open())
            .cloned();

        let mut report = DivergenceReport {
            strategy_id: strategy.id.clone(),
            symbol: strategy.symbol.clone(),
            points: Vec::new(),
            position: position.clone(),
            missing_points: Vec::new(),
            missing_stop_loss: false,
            missing_take_profits: Vec::new(),
            stop_loss_orders: 0,
            take_profit_orders: 0,
            duplicates,
            observed_phase: Phase::Waiting,
        };

        if state.is_some_and(|s| s.phase.is_terminal()) {
            report.observed_phase = Phase::Closed;
            return report;
        }

        // --- 2 & 3. Ladder points ---
        for point in strategy.expected_points() {
            let status = if position
                .as_ref()
                .is_some_and(|p| within_tolerance(p.entry_price, point.price, self.tolerances.limit_price))
            {
                PointStatus::Position
            } else if let Some(fill) = snapshot.history.iter().find(|r| {
                r.symbol == strategy.symbol
                    && r.side == entry_side
                    && r.timestamp >= strategy.received_at
                    && r.is_fill()
                    && self.fill_matches(r, point.price)
            }) {
                PointStatus::Filled {
                    order_id: fill.id.clone(),
                }
            } else if let Some(order) = live.iter().find(|o| {
                o.kind == OrderKind::Limit
                    && o.side == entry_side
                    && within_tolerance(o.price, point.price, self.tolerances.limit_price)
            }) {
                PointStatus::Pending {
                    order_id: order.id.clone(),
                }
            } else if position.is_some() {
                PointStatus::Deferred
            } else {
                PointStatus::Missing
            };
            if status == PointStatus::Missing {
                report.missing_points.push(point.clone());
            }
            report.points.push(PointReport { point, status });
        }

        // --- 4. Protective orders ---
        if position.is_some() {
            let protective = |kind: OrderKind| {
                live.iter()
                    .filter(move |o| o.kind == kind && o.side == closing_side)
                    .collect::<Vec<_>>()
            };
            let stops = protective(OrderKind::StopLoss);
            let takes = protective(OrderKind::TakeProfit);
            report.stop_loss_orders = stops.len();
            report.take_profit_orders = takes.len();
            report.missing_stop_loss = !stops
                .iter()
                .any(|o| within_tolerance(o.price, strategy.stop_loss, self.tolerances.protective));
            report.missing_take_profits = strategy
                .take_profits
                .iter()
                .filter(|tp| {
                    !takes
                        .iter()
                        .any(|o| within_tolerance(o.price, **tp, self.tolerances.protective))
                })
                .copied()
                .collect();
        }

        // --- 5. Observed phase ---
        report.observed_phase = match &position {
            Some(_) if !report.missing_stop_loss && !report.missing_take_profit() => Phase::Done,
            Some(_) => Phase::Entry,
            None if report
                .points
                .iter()
                .any(|p| matches!(p.status, PointStatus::Pending { .. })) =>
            {
                Phase::EntryPending
            }
            None => Phase::Waiting,
        };

        report
    }

    /// A limit fill matches on its own price, a market fill on its average.
    fn fill_matches(&self, record: &OrderHistoryRecord, target: Decimal) -> bool {
        record
            .price
            .is_some_and(|p| within_tolerance(p, target, self.tolerances.limit_price))
            || record
                .average_price
                .is_some_and(|p| within_tolerance(p, target, self.tolerances.market_fill))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use core_types::{
        AddPoint, Direction, HistoryOrderType, HistoryStatus, OrderCategory, OrderSide, PointKind,
        PositionSide,
    };
    use rust_decimal_macros::dec;

    fn strategy() -> Strategy {
        Strategy {
            id: "s-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(60000),
            add_points: vec![
                AddPoint { price: dec!(61000), percent: dec!(0.3) },
                AddPoint { price: dec!(62000), percent: dec!(0.3) },
            ],
            stop_loss: dec!(58000),
            take_profits: vec![dec!(65000)],
            leverage: Some(10),
            rationale: String::new(),
            received_at: Utc::now() - Duration::hours(1),
        }
    }

    fn order(id: &str, kind: OrderKind, side: OrderSide, price: Decimal, age_secs: i64) -> OpenOrder {
        OpenOrder {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            kind,
            side,
            price,
            quantity: dec!(0.1),
            status: "live".to_string(),
            category: if kind == OrderKind::Limit {
                OrderCategory::Normal
            } else {
                OrderCategory::Plan
            },
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn long_at(entry: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.5),
            entry_price: entry,
            mark_price: entry,
            unrealized_pnl: Decimal::ZERO,
            leverage: 10,
            liquidation_price: dec!(54000),
            margin: dec!(3000),
        }
    }

    fn fill(price: Option<Decimal>, average: Option<Decimal>) -> OrderHistoryRecord {
        OrderHistoryRecord {
            id: "h-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: if price.is_some() {
                HistoryOrderType::Limit
            } else {
                HistoryOrderType::Market
            },
            price,
            average_price: average,
            status: HistoryStatus::Filled,
            timestamp: Utc::now(),
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(ToleranceSettings::default())
    }

    #[test]
    fn empty_venue_misses_the_whole_ladder() {
        let report = reconciler().reconcile(&strategy(), None, &VenueSnapshot::default());
        let missing: Vec<_> = report
            .missing_points
            .iter()
            .map(|p| (p.kind, p.price, p.percent))
            .collect();
        assert_eq!(
            missing,
            vec![
                (PointKind::Entry, dec!(60000), dec!(0.4)),
                (PointKind::Add(1), dec!(61000), dec!(0.3)),
                (PointKind::Add(2), dec!(62000), dec!(0.3)),
            ]
        );
        assert!(report.has_divergence());
        assert!(!report.missing_stop_loss, "no position, nothing to protect");
        assert_eq!(report.observed_phase, Phase::Waiting);
    }

    #[test]
    fn open_position_defers_points_and_flags_take_profit() {
        let snapshot = VenueSnapshot {
            positions: vec![long_at(dec!(60050))],
            open_orders: vec![order("sl", OrderKind::StopLoss, OrderSide::Sell, dec!(58000), 10)],
            history: vec![],
        };
        let report = reconciler().reconcile(&strategy(), None, &snapshot);
        assert!(report.missing_points.is_empty());
        assert_eq!(report.points[0].status, PointStatus::Position);
        assert_eq!(report.points[1].status, PointStatus::Deferred);
        assert!(!report.missing_stop_loss);
        assert_eq!(report.missing_take_profits, vec![dec!(65000)]);
        assert_eq!(report.observed_phase, Phase::Entry);
        assert!(report.has_divergence());
    }

    #[test]
    fn full_protection_is_done() {
        let snapshot = VenueSnapshot {
            positions: vec![long_at(dec!(60000))],
            open_orders: vec![
                order("sl", OrderKind::StopLoss, OrderSide::Sell, dec!(58100), 10),
                order("tp", OrderKind::TakeProfit, OrderSide::Sell, dec!(64500), 10),
            ],
            history: vec![],
        };
        let report = reconciler().reconcile(&strategy(), None, &snapshot);
        assert!(!report.has_divergence(), "{}", report.render());
        assert_eq!(report.observed_phase, Phase::Done);
    }

    #[test]
    fn each_take_profit_is_checked_separately() {
        let mut s = strategy();
        s.take_profits = vec![dec!(65000), dec!(67000), dec!(70000)];
        let snapshot = VenueSnapshot {
            positions: vec![long_at(dec!(60000))],
            open_orders: vec![
                order("sl", OrderKind::StopLoss, OrderSide::Sell, dec!(58000), 10),
                order("tp1", OrderKind::TakeProfit, OrderSide::Sell, dec!(65000), 10),
            ],
            history: vec![],
        };
        let report = reconciler().reconcile(&s, None, &snapshot);
        assert_eq!(report.missing_take_profits, vec![dec!(67000), dec!(70000)]);
        assert_eq!(report.take_profit_orders, 1);
    }

    #[test]
    fn protective_orders_on_the_wrong_side_do_not_count() {
        let snapshot = VenueSnapshot {
            positions: vec![long_at(dec!(60000))],
            open_orders: vec![order("sl", OrderKind::StopLoss, OrderSide::Buy, dec!(58000), 10)],
            history: vec![],
        };
        let report = reconciler().reconcile(&strategy(), None, &snapshot);
        assert!(report.missing_stop_loss);
        assert_eq!(report.stop_loss_orders, 0);
    }

    #[test]
    fn fills_match_by_limit_price_or_market_average() {
        let r = reconciler();
        let s = strategy();

        let limit_fill = VenueSnapshot {
            history: vec![fill(Some(dec!(60060)), None)],
            ..VenueSnapshot::default()
        };
        let report = r.reconcile(&s, None, &limit_fill);
        assert!(matches!(report.points[0].status, PointStatus::Filled { .. }));

        let limit_miss = VenueSnapshot {
            history: vec![fill(Some(dec!(60061)), None)],
            ..VenueSnapshot::default()
        };
        assert_eq!(r.reconcile(&s, None, &limit_miss).points[0].status, PointStatus::Missing);

        let market_fill = VenueSnapshot {
            history: vec![fill(None, Some(dec!(60180)))],
            ..VenueSnapshot::default()
        };
        assert!(matches!(
            r.reconcile(&s, None, &market_fill).points[0].status,
            PointStatus::Filled { .. }
        ));

        let market_miss = VenueSnapshot {
            history: vec![fill(None, Some(dec!(60181)))],
            ..VenueSnapshot::default()
        };
        assert_eq!(r.reconcile(&s, None, &market_miss).points[0].status, PointStatus::Missing);
    }

    #[test]
    fn cancelled_orders_and_old_fills_are_not_fills() {
        let mut cancelled = fill(Some(dec!(60000)), None);
        cancelled.status = HistoryStatus::Cancelled;
        let mut stale = fill(Some(dec!(60000)), None);
        stale.timestamp = Utc::now() - Duration::hours(2);

        let snapshot = VenueSnapshot {
            history: vec![cancelled, stale],
            ..VenueSnapshot::default()
        };
        let report = reconciler().reconcile(&strategy(), None, &snapshot);
        assert_eq!(report.points[0].status, PointStatus::Missing);
    }

    #[test]
    fn live_limit_orders_keep_points_pending() {
        let snapshot = VenueSnapshot {
            open_orders: vec![order("o-1", OrderKind::Limit, OrderSide::Buy, dec!(60000), 10)],
            ..VenueSnapshot::default()
        };
        let report = reconciler().reconcile(&strategy(), None, &snapshot);
        assert_eq!(
            report.points[0].status,
            PointStatus::Pending { order_id: "o-1".to_string() }
        );
        assert_eq!(report.missing_points.len(), 2);
        assert_eq!(report.observed_phase, Phase::EntryPending);
    }

    #[test]
    fn duplicates_keep_the_earliest_order() {
        let orders = vec![
            order("newer", OrderKind::Limit, OrderSide::Buy, dec!(60000), 5),
            order("older", OrderKind::Limit, OrderSide::Buy, dec!(60000), 50),
            order("other-side", OrderKind::Limit, OrderSide::Sell, dec!(60000), 1),
            order("other-price", OrderKind::Limit, OrderSide::Buy, dec!(61000), 1),
        ];
        let duplicates = find_duplicates(&orders, dec!(0.005));
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].id, "newer");

        let snapshot = VenueSnapshot {
            open_orders: orders,
            ..VenueSnapshot::default()
        };
        let report = reconciler().reconcile(&strategy(), None, &snapshot);
        assert_eq!(
            report.points[0].status,
            PointStatus::Pending { order_id: "older".to_string() }
        );
        assert_eq!(report.duplicates.len(), 1);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let snapshot = VenueSnapshot {
            positions: vec![long_at(dec!(60050))],
            open_orders: vec![
                order("sl", OrderKind::StopLoss, OrderSide::Sell, dec!(58000), 10),
                order("a", OrderKind::Limit, OrderSide::Buy, dec!(61000), 20),
                order("b", OrderKind::Limit, OrderSide::Buy, dec!(61000), 10),
            ],
            history: vec![fill(None, Some(dec!(60050)))],
        };
        let r = reconciler();
        let s = strategy();
        let first = r.reconcile(&s, None, &snapshot);
        let second = r.reconcile(&s, None, &snapshot);
        assert_eq!(first, second);
        assert_eq!(first.render(), second.render());
    }

    #[test]
    fn closed_strategies_report_nothing() {
        let mut state = StrategyExecutionState::new("t-1", "s-1", "BTCUSDT");
        state.phase = Phase::Closed;
        let report = reconciler().reconcile(&strategy(), Some(&state), &VenueSnapshot::default());
        assert!(!report.has_divergence());
        assert_eq!(report.observed_phase, Phase::Closed);
    }
}
