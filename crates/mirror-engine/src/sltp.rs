//! Stop-loss and take-profit lifecycle against live liquidation prices.
//!
//! Stops sit at a configured fraction of the entry-to-liquidation distance;
//! take-profits target the trader's average ROE plus one standard deviation.
//! Working triggers are re-created only when price or amount drifts by more
//! than one percent.

use copybot_core::db::{PositionRepository, StatsRepository, TriggerOrderRepository};
use copybot_core::types::{MirroredPosition, Side, TriggerKind};
use copybot_core::Result;
use exchange_gateway::{Gateway, TriggerCancelIntent, TriggerIntent, TriggerOrderKind};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Re-create threshold for price/amount drift, percent.
const MAX_DRIFT_PERC: Decimal = Decimal::ONE;

/// Stop price at `ratio` of the distance from entry to liquidation.
pub fn stop_loss_price(side: Side, entry: Decimal, liquidation: Decimal, ratio: Decimal) -> Decimal {
    if side.is_long() {
        entry - (entry - liquidation) * ratio
    } else {
        entry + (liquidation - entry) * ratio
    }
}

/// Take-profit price from the trader's closed-trade statistics. The target
/// percent is `(avg_roe + std_dev) * 100 / leverage`; short targets floor
/// at zero.
pub fn take_profit_price(
    side: Side,
    entry: Decimal,
    leverage: u32,
    avg_roe: Decimal,
    std_dev: Decimal,
) -> Decimal {
    let tp_perc = (avg_roe + std_dev) * Decimal::ONE_HUNDRED / Decimal::from(leverage.max(1));
    let offset = entry / Decimal::ONE_HUNDRED * tp_perc;
    if side.is_long() {
        entry + offset
    } else {
        (entry - offset).max(Decimal::ZERO)
    }
}

/// Round `value` to the same number of decimal places as `reference`.
pub fn quantize_like(value: Decimal, reference: Decimal) -> Decimal {
    value.round_dp(reference.scale())
}

/// Percentage difference between two values relative to the larger one.
pub fn pct_diff(x: Decimal, y: Decimal) -> Decimal {
    let larger = x.max(y);
    if larger.is_zero() {
        return Decimal::ZERO;
    }
    (x - y).abs() / larger * Decimal::ONE_HUNDRED
}

/// Whether a working trigger drifted far enough to be re-created. A drift of
/// exactly one percent does not trigger.
pub fn drift_exceeds_limit(
    prev_price: Decimal,
    new_price: Decimal,
    prev_amount: Decimal,
    new_amount: Decimal,
) -> bool {
    pct_diff(prev_price, new_price) > MAX_DRIFT_PERC
        || pct_diff(prev_amount, new_amount) > MAX_DRIFT_PERC
}

/// Maintains trigger orders for one instance.
pub struct SlTpManager<'a> {
    pub positions: &'a PositionRepository,
    pub triggers: &'a TriggerOrderRepository,
    pub stats: &'a StatsRepository,
    pub gateway: &'a Gateway,
    pub sl_ratio: Decimal,
}

impl SlTpManager<'_> {
    /// Pull liquidation prices from the exchange's position endpoint for
    /// every filled position. Symbols without an open position on the venue
    /// yield no price; the stored value then reflects that.
    pub async fn refresh_liquidation_prices(&self) -> Result<()> {
        let active = self.positions.active().await?;
        let filled: Vec<&MirroredPosition> = active.iter().filter(|p| p.is_filled).collect();
        if filled.is_empty() {
            return Ok(());
        }

        let prices = self.gateway.liquidation_prices().await?;
        for pos in filled {
            let current = prices.get(&pos.symbol).copied();
            if current != pos.liquidation_price {
                debug!(
                    upstream_id = pos.upstream_id,
                    from = ?pos.liquidation_price,
                    to = ?current,
                    "Updating liquidation price"
                );
                self.positions
                    .update_liquidation_price(pos.upstream_id, current)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn reconcile_stop_losses(&self) -> Result<()> {
        let active = self.positions.active().await?;
        let needs: HashMap<i64, &MirroredPosition> = active
            .iter()
            .filter(|p| p.is_filled && !p.is_closed && p.liquidation_price.is_some())
            .map(|p| (p.upstream_id, p))
            .collect();

        self.cancel_stale_triggers(TriggerKind::StopLoss, &needs).await?;

        let latest = self.triggers.latest_by_position(TriggerKind::StopLoss).await?;
        let mut to_cancel = Vec::new();
        let mut to_create = Vec::new();
        let mut rearm_ids: HashMap<i64, i64> = HashMap::new();

        for (&pos_id, pos) in &needs {
            // The filter above guarantees a liquidation price; a position
            // without one is skipped until the next refresh.
            let Some(liquidation) = pos.liquidation_price else {
                continue;
            };
            let raw_price = stop_loss_price(pos.side, pos.entry_price, liquidation, self.sl_ratio);
            let amount = pos.user_amount;

            match latest.get(&pos_id) {
                Some(row) => {
                    let price = quantize_like(raw_price, row.price);
                    let intent = Self::trigger_intent(pos, TriggerOrderKind::StopMarket, price, amount);
                    if row.is_active {
                        if drift_exceeds_limit(row.price, price, row.amount, amount) {
                            if let Some(order_id) = &row.order_id {
                                to_cancel.push(TriggerCancelIntent {
                                    trigger_id: row.id,
                                    symbol: row.symbol.clone(),
                                    order_id: order_id.clone(),
                                });
                            }
                            rearm_ids.insert(pos_id, row.id);
                            to_create.push(intent);
                        }
                    } else {
                        // Previous trigger already inactive: re-create only.
                        rearm_ids.insert(pos_id, row.id);
                        to_create.push(intent);
                    }
                }
                None => {
                    to_create.push(Self::trigger_intent(
                        pos,
                        TriggerOrderKind::StopMarket,
                        raw_price,
                        amount,
                    ));
                }
            }
        }

        self.apply_trigger_changes(TriggerKind::StopLoss, to_cancel, to_create, &rearm_ids)
            .await
    }

    pub async fn reconcile_take_profits(&self) -> Result<()> {
        let active = self.positions.active().await?;
        let needs: HashMap<i64, &MirroredPosition> = active
            .iter()
            .filter(|p| p.is_filled && !p.is_closed)
            .map(|p| (p.upstream_id, p))
            .collect();

        self.cancel_stale_triggers(TriggerKind::TakeProfit, &needs).await?;

        let latest = self.triggers.latest_by_position(TriggerKind::TakeProfit).await?;
        let mut to_cancel = Vec::new();
        let mut to_create = Vec::new();
        let mut rearm_ids: HashMap<i64, i64> = HashMap::new();

        for (&pos_id, pos) in &needs {
            let Some(kc_row) = self.stats.kc_row(&pos.trader_id).await? else {
                warn!(trader = %pos.trader_id, "No KC stats for take-profit target");
                continue;
            };
            let (Some(avg_roe), Some(std_dev)) = (kc_row.avg_roe, kc_row.roe_std_dev) else {
                continue;
            };

            let raw_price =
                take_profit_price(pos.side, pos.entry_price, pos.leverage, avg_roe, std_dev);
            let price = quantize_like(raw_price, pos.entry_price);
            let amount = pos.user_amount;

            match latest.get(&pos_id) {
                Some(row) => {
                    let intent =
                        Self::trigger_intent(pos, TriggerOrderKind::TakeProfitMarket, price, amount);
                    if row.is_active {
                        if drift_exceeds_limit(row.price, price, row.amount, amount) {
                            if let Some(order_id) = &row.order_id {
                                to_cancel.push(TriggerCancelIntent {
                                    trigger_id: row.id,
                                    symbol: row.symbol.clone(),
                                    order_id: order_id.clone(),
                                });
                            }
                            rearm_ids.insert(pos_id, row.id);
                            to_create.push(intent);
                        }
                    } else {
                        rearm_ids.insert(pos_id, row.id);
                        to_create.push(intent);
                    }
                }
                None => {
                    to_create.push(Self::trigger_intent(
                        pos,
                        TriggerOrderKind::TakeProfitMarket,
                        price,
                        amount,
                    ));
                }
            }
        }

        self.apply_trigger_changes(TriggerKind::TakeProfit, to_cancel, to_create, &rearm_ids)
            .await
    }

    /// Reflect trigger fills back into the mirror table. A filled stop-loss
    /// closes the position, books a loss and doubles the trader's penalty;
    /// a filled take-profit just closes the position.
    pub async fn reflect_triggered(&self, kind: TriggerKind) -> Result<()> {
        let active = self.triggers.active_by_position(kind).await?;
        if active.is_empty() {
            return Ok(());
        }

        let watch: HashSet<String> = active
            .values()
            .filter_map(|t| t.order_id.clone())
            .collect();
        let symbols: Vec<String> = active
            .values()
            .map(|t| t.symbol.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let triggered = self.gateway.triggered_order_ids(&symbols, &watch).await;
        for row in active.values() {
            let Some(order_id) = &row.order_id else {
                continue;
            };
            if !triggered.contains(order_id) {
                continue;
            }

            debug!(order_id = %order_id, kind = kind.as_str(), "Trigger order filled");
            self.triggers.mark_filled_by_order(order_id).await?;
            self.positions.close_from_trigger(row.upstream_position_id).await?;

            if kind == TriggerKind::StopLoss {
                match self.positions.trader_of(row.upstream_position_id).await? {
                    Some(trader_id) => {
                        self.stats.record_result(&trader_id, false).await?;
                        self.stats.bump_penalty(&trader_id).await?;
                    }
                    None => warn!(
                        upstream_position_id = row.upstream_position_id,
                        "No trader found for filled stop-loss"
                    ),
                }
            }
        }
        Ok(())
    }

    fn trigger_intent(
        pos: &MirroredPosition,
        kind: TriggerOrderKind,
        price: Decimal,
        amount: Decimal,
    ) -> TriggerIntent {
        TriggerIntent {
            position_id: pos.upstream_id,
            symbol: pos.symbol.clone(),
            position_side: pos.side,
            kind,
            stop_price: price,
            amount,
        }
    }

    /// Cancel triggers protecting positions that are closed or gone.
    async fn cancel_stale_triggers(
        &self,
        kind: TriggerKind,
        needs: &HashMap<i64, &MirroredPosition>,
    ) -> Result<()> {
        let existing = self.triggers.active_by_position(kind).await?;
        let stale: Vec<TriggerCancelIntent> = existing
            .values()
            .filter(|t| !needs.contains_key(&t.upstream_position_id))
            .filter_map(|t| {
                t.order_id.as_ref().map(|order_id| TriggerCancelIntent {
                    trigger_id: t.id,
                    symbol: t.symbol.clone(),
                    order_id: order_id.clone(),
                })
            })
            .collect();

        for (intent, result) in self.gateway.cancel_triggers(stale).await {
            match result {
                Ok(_) => self.triggers.deactivate(intent.trigger_id).await?,
                Err(e) => warn!(trigger_id = intent.trigger_id, error = %e, "Stale trigger cancel failed"),
            }
        }
        Ok(())
    }

    async fn apply_trigger_changes(
        &self,
        kind: TriggerKind,
        to_cancel: Vec<TriggerCancelIntent>,
        to_create: Vec<TriggerIntent>,
        rearm_ids: &HashMap<i64, i64>,
    ) -> Result<()> {
        for (intent, result) in self.gateway.cancel_triggers(to_cancel).await {
            match result {
                Ok(_) => self.triggers.deactivate(intent.trigger_id).await?,
                Err(e) => warn!(trigger_id = intent.trigger_id, error = %e, "Trigger cancel failed"),
            }
        }

        for (intent, result) in self.gateway.create_triggers(to_create).await {
            let ack = match result {
                Ok(ack) => ack,
                Err(e) => {
                    warn!(position_id = intent.position_id, error = %e, "Trigger create failed");
                    continue;
                }
            };
            match rearm_ids.get(&intent.position_id) {
                Some(&row_id) => {
                    self.triggers
                        .rearm(row_id, &ack.order_id, intent.stop_price, intent.amount)
                        .await?;
                }
                None => {
                    self.triggers
                        .insert(
                            intent.position_id,
                            kind,
                            &ack.order_id,
                            &intent.symbol,
                            intent.position_side.flip(),
                            intent.stop_price,
                            intent.amount,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_stop_sits_between_entry_and_liquidation() {
        // entry 24, liquidation 20, ratio 0.5 -> 22.
        let price = stop_loss_price(
            Side::Buy,
            Decimal::new(24, 0),
            Decimal::new(20, 0),
            Decimal::new(5, 1),
        );
        assert_eq!(price, Decimal::new(22, 0));
    }

    #[test]
    fn test_short_stop_mirrors_above_entry() {
        let price = stop_loss_price(
            Side::Sell,
            Decimal::new(20, 0),
            Decimal::new(24, 0),
            Decimal::new(5, 1),
        );
        assert_eq!(price, Decimal::new(22, 0));
    }

    #[test]
    fn test_take_profit_long() {
        // (0.05 + 0.02) * 100 / 5 = 1.4% above entry.
        let price = take_profit_price(
            Side::Buy,
            Decimal::new(10_000, 2),
            5,
            Decimal::new(5, 2),
            Decimal::new(2, 2),
        );
        assert_eq!(price, Decimal::new(10_140, 2));
    }

    #[test]
    fn test_take_profit_short_floors_at_zero() {
        let price = take_profit_price(
            Side::Sell,
            Decimal::new(10, 0),
            1,
            Decimal::new(200, 0),
            Decimal::new(0, 0),
        );
        assert_eq!(price, Decimal::ZERO);
    }

    #[test]
    fn test_quantize_follows_reference_scale() {
        assert_eq!(
            quantize_like(Decimal::new(219_876, 4), Decimal::new(220, 1)),
            Decimal::new(220, 1)
        );
        assert_eq!(
            quantize_like(Decimal::new(219_876, 4), Decimal::new(22, 0)),
            Decimal::new(22, 0)
        );
    }

    #[test]
    fn test_exactly_one_percent_does_not_recreate() {
        let prev = Decimal::new(100, 0);
        let one_pct_lower = Decimal::new(99, 0);
        let amount = Decimal::new(10, 0);
        assert!(!drift_exceeds_limit(prev, one_pct_lower, amount, amount));
    }

    #[test]
    fn test_above_one_percent_recreates() {
        let prev = Decimal::new(100, 0);
        let below = Decimal::new(9_899, 2);
        let amount = Decimal::new(10, 0);
        assert!(drift_exceeds_limit(prev, below, amount, amount));
    }

    #[test]
    fn test_amount_drift_also_recreates() {
        let price = Decimal::new(100, 0);
        assert!(drift_exceeds_limit(
            price,
            price,
            Decimal::new(100, 0),
            Decimal::new(98, 0)
        ));
    }
}
