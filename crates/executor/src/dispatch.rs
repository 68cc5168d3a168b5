use crate::error::ExecutorError;
use api_client::VenueAdapter;
use core_types::{Decision, DecisionAction, LimitOrderRequest, Position, PositionSide};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What the venue did with one decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    /// Set when the venue had nothing to do (e.g. closing a flat side).
    pub note: Option<String>,
}

impl DispatchReport {
    fn noted(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }
}

/// Converts a quote-currency notional into base quantity at `price`.
pub fn quantity_for_notional(notional: Decimal, price: Decimal) -> Result<Decimal, ExecutorError> {
    if price <= Decimal::ZERO {
        return Err(ExecutorError::DataInconsistency(format!(
            "cannot size an order at price {}",
            price
        )));
    }
    if notional <= Decimal::ZERO {
        return Err(ExecutorError::DataInconsistency(format!(
            "cannot size an order for notional {}",
            notional
        )));
    }
    Ok(notional / price)
}

fn require<T: Clone>(value: &Option<T>, what: &str, action: DecisionAction) -> Result<T, ExecutorError> {
    value
        .clone()
        .ok_or_else(|| ExecutorError::DataInconsistency(format!("{} requires {}", action, what)))
}

/// Translates decisions into venue calls.
///
/// The dispatcher does no policy: phase gating, risk checks and duplicate
/// detection happen before a decision gets here.
pub struct Dispatcher {
    venue: Arc<dyn VenueAdapter>,
}

impl Dispatcher {
    pub fn new(venue: Arc<dyn VenueAdapter>) -> Self {
        Self { venue }
    }

    pub fn venue(&self) -> &Arc<dyn VenueAdapter> {
        &self.venue
    }

    async fn position(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, ExecutorError> {
        Ok(self
            .venue
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol && p.side == side && p.is_open()))
    }

    /// Base quantity for `notional` at `price`, rounded to what the venue accepts.
    async fn sized(
        &self,
        symbol: &str,
        notional: Decimal,
        price: Decimal,
    ) -> Result<Decimal, ExecutorError> {
        let raw = quantity_for_notional(notional, price)?;
        Ok(self.venue.format_quantity(symbol, raw).await?)
    }

    pub async fn dispatch(&self, decision: &Decision) -> Result<DispatchReport, ExecutorError> {
        let symbol = decision.symbol.as_str();
        let action = decision.action;
        debug!(%action, symbol, "dispatching decision");

        let report = match action {
            DecisionAction::Hold | DecisionAction::Wait => DispatchReport::noted("passive"),

            DecisionAction::OpenLong | DecisionAction::OpenShort => {
                let price = require(&decision.price, "a reference price", action)?;
                let notional = require(&decision.position_size_usd, "a position size", action)?;
                let quantity = self.sized(symbol, notional, price).await?;
                let ack = if action == DecisionAction::OpenLong {
                    self.venue.open_long(symbol, quantity).await?
                } else {
                    self.venue.open_short(symbol, quantity).await?
                };
                DispatchReport {
                    order_id: Some(ack.order_id),
                    client_order_id: ack.client_order_id,
                    price: Some(price),
                    quantity: Some(quantity),
                    note: None,
                }
            }

            DecisionAction::CloseLong | DecisionAction::CloseShort => {
                let ack = if action == DecisionAction::CloseLong {
                    self.venue.close_long(symbol, None).await?
                } else {
                    self.venue.close_short(symbol, None).await?
                };
                match ack {
                    Some(ack) => DispatchReport {
                        order_id: Some(ack.order_id),
                        client_order_id: ack.client_order_id,
                        ..DispatchReport::default()
                    },
                    None => DispatchReport::noted("position already flat"),
                }
            }

            DecisionAction::PartialClose => {
                let side = require(&decision.position_side, "a position side", action)?;
                let ratio = require(&decision.close_ratio, "a close ratio", action)?;
                if ratio <= Decimal::ZERO || ratio > Decimal::ONE {
                    return Err(ExecutorError::DataInconsistency(format!(
                        "close ratio {} outside (0, 1]",
                        ratio
                    )));
                }
                let Some(position) = self.position(symbol, side).await? else {
                    return Ok(DispatchReport::noted("position already flat"));
                };
                let quantity = if ratio == Decimal::ONE {
                    None
                } else {
                    Some(self.venue.format_quantity(symbol, position.quantity * ratio).await?)
                };
                let ack = match side {
                    PositionSide::Long => self.venue.close_long(symbol, quantity).await?,
                    PositionSide::Short => self.venue.close_short(symbol, quantity).await?,
                };
                DispatchReport {
                    order_id: ack.as_ref().map(|a| a.order_id.clone()),
                    client_order_id: ack.and_then(|a| a.client_order_id),
                    quantity: Some(quantity.unwrap_or(position.quantity)),
                    ..DispatchReport::default()
                }
            }

            DecisionAction::PlaceLimitOrder => {
                let side = require(&decision.side, "an order side", action)?;
                let price = require(&decision.price, "a limit price", action)?;
                let notional = require(&decision.position_size_usd, "a position size", action)?;
                let quantity = self.sized(symbol, notional, price).await?;
                let request = LimitOrderRequest {
                    symbol: symbol.to_string(),
                    side,
                    price,
                    quantity,
                    client_order_id: Uuid::new_v4().simple().to_string(),
                };
                let ack = self.venue.place_limit_order(&request).await?;
                DispatchReport {
                    order_id: Some(ack.order_id),
                    client_order_id: ack.client_order_id.or(Some(request.client_order_id)),
                    price: Some(price),
                    quantity: Some(quantity),
                    note: None,
                }
            }

            DecisionAction::CancelOrder => {
                let order_id = require(&decision.order_id, "an order id", action)?;
                self.venue.cancel_order(symbol, &order_id).await?;
                DispatchReport {
                    order_id: Some(order_id),
                    ..DispatchReport::default()
                }
            }

            DecisionAction::SetStopLoss | DecisionAction::UpdateStopLoss => {
                let side = require(&decision.position_side, "a position side", action)?;
                let trigger = require(&decision.stop_loss, "a stop-loss price", action)?;
                if action == DecisionAction::UpdateStopLoss {
                    self.venue.cancel_stop_loss_orders(symbol).await?;
                }
                let ack = self.venue.set_stop_loss(symbol, side, trigger).await?;
                DispatchReport {
                    order_id: Some(ack.order_id),
                    client_order_id: ack.client_order_id,
                    price: Some(trigger),
                    ..DispatchReport::default()
                }
            }

            DecisionAction::SetTakeProfit | DecisionAction::UpdateTakeProfit => {
                let side = require(&decision.position_side, "a position side", action)?;
                let trigger = require(&decision.take_profit, "a take-profit price", action)?;
                if action == DecisionAction::UpdateTakeProfit {
                    self.venue.cancel_take_profit_orders(symbol).await?;
                }
                // A ratio below one makes this one rung of a take-profit ladder.
                let quantity = match decision.close_ratio {
                    Some(ratio) if ratio > Decimal::ZERO && ratio < Decimal::ONE => {
                        let position = self.position(symbol, side).await?.ok_or_else(|| {
                            ExecutorError::DataInconsistency(format!(
                                "no {} position on {} to protect",
                                side, symbol
                            ))
                        })?;
                        Some(self.venue.format_quantity(symbol, position.quantity * ratio).await?)
                    }
                    _ => None,
                };
                let ack = self
                    .venue
                    .set_take_profit(symbol, side, trigger, quantity)
                    .await?;
                DispatchReport {
                    order_id: Some(ack.order_id),
                    client_order_id: ack.client_order_id,
                    price: Some(trigger),
                    quantity,
                    note: None,
                }
            }
        };

        if !action.is_passive() {
            info!(
                %action,
                symbol,
                order_id = ?report.order_id,
                quantity = ?report.quantity,
                note = ?report.note,
                "decision dispatched"
            );
        }
        Ok(report)
    }
}
