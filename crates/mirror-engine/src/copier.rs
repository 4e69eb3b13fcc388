//! Drives entry orders for admitted positions under the configured copy
//! mode: fixed base sizing, single-copy with selector, or multi-copy with
//! Kelly weights.

use crate::filter;
use crate::selector::{self, Selection};
use crate::sizer;
use copybot_core::config::{CopyTraderBy, PolicyConfig, SizingConfig};
use copybot_core::db::{PositionRepository, StatsRepository};
use copybot_core::types::{now_ms, IgnoreReason, MirroredPosition};
use copybot_core::Result;
use exchange_gateway::{
    CancelIntent, CloseIntent, Gateway, LotFilter, OpenIntent, PartialCloseIntent,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub struct Copier<'a> {
    pub positions: &'a PositionRepository,
    pub stats: &'a StatsRepository,
    pub gateway: &'a Gateway,
    pub sizing: &'a SizingConfig,
    pub policy: &'a PolicyConfig,
}

impl Copier<'_> {
    /// Open every admitted, not-yet-copied position at its stored base
    /// size, dropping expired intents and intents the free balance cannot
    /// carry.
    pub async fn copy_fixed(&self) -> Result<()> {
        let active = self.positions.active().await?;
        let to_open: Vec<MirroredPosition> = active
            .into_iter()
            .filter(|p| p.is_copy_candidate() && !p.is_copied)
            .collect();
        if to_open.is_empty() {
            return Ok(());
        }

        let plan = self
            .gateway
            .balance_plan(
                self.sizing.equity_of_total_equity,
                self.sizing.equity_per_single_pos,
            )
            .await?;
        let mut free = plan.free_to_use;

        let symbols = unique_symbols(&to_open);
        let last_prices = self.gateway.last_prices(&symbols).await;

        let now = now_ms();
        let mut intents = Vec::new();
        for pos in to_open {
            if filter::is_expired(&pos, now, self.policy.max_time_to_fill) {
                debug!(upstream_id = pos.upstream_id, "Expired before copy");
                self.positions
                    .set_ignored(pos.upstream_id, &IgnoreReason::Expired)
                    .await?;
                continue;
            }

            let price = last_prices
                .get(&pos.symbol)
                .copied()
                .unwrap_or(pos.entry_price);
            free -= sizer::margin_requirement(price, pos.user_amount, pos.leverage);
            if free < Decimal::ZERO {
                debug!(upstream_id = pos.upstream_id, "Insufficient free balance");
                self.positions
                    .set_ignored(pos.upstream_id, &IgnoreReason::InsufficientFunds)
                    .await?;
                continue;
            }

            self.positions
                .set_entry(pos.upstream_id, price, pos.user_amount)
                .await?;
            intents.push(OpenIntent {
                position_id: pos.upstream_id,
                symbol: pos.symbol.clone(),
                side: pos.side,
                leverage: pos.leverage,
                price,
                amount: pos.user_amount,
            });
        }

        self.open_and_record(intents).await
    }

    /// Single-copy mode: pick one trader by the ranking statistic with
    /// hysteresis, drop everyone else, and size that trader's positions from
    /// its penalized Kelly budget.
    pub async fn copy_single(&self, ranking: CopyTraderBy) -> Result<()> {
        let active = self.positions.active().await?;
        let kc = self.stats.all_kc().await?;
        let tc = self.stats.all_tc().await?;

        let leader = match ranking {
            CopyTraderBy::KellyCriterion => selector::leader_by_kc(&active, &kc),
            CopyTraderBy::TradeCount => selector::leader_by_tc(&active, &tc),
        };
        let current = selector::currently_copied(&active)?;

        let mut keep: HashSet<String> = HashSet::new();
        keep.extend(leader.clone());
        keep.extend(current.clone());
        if keep.is_empty() {
            debug!("No active traders eligible for copying");
            return Ok(());
        }

        let other_traders: HashSet<String> = active
            .iter()
            .filter(|p| !p.is_ignored())
            .map(|p| p.trader_id.clone())
            .filter(|t| !keep.contains(t))
            .collect();
        for trader_id in other_traders {
            self.close_cancel_ignore_trader(&trader_id).await?;
        }

        let selection = selector::decide(current, leader, ranking, &kc, &tc);
        info!(?selection, "Selector decision");
        match selection {
            Selection::Stay(trader) | Selection::Start(trader) => {
                self.copy_trader(&trader, &kc).await
            }
            Selection::Switch { from, to } => {
                self.close_cancel_ignore_trader(&from).await?;
                self.copy_trader(&to, &kc).await
            }
            Selection::Idle => Ok(()),
        }
    }

    /// Multi-copy mode: allocate the Kelly-scaled balance across all
    /// admitted traders by their normalized weights.
    pub async fn copy_multi(&self) -> Result<()> {
        let winners = self.positions.earliest_non_ignored_per_symbol().await?;
        if winners.is_empty() {
            return Ok(());
        }

        let mut grouped: HashMap<String, Vec<MirroredPosition>> = HashMap::new();
        for pos in winners {
            grouped.entry(pos.trader_id.clone()).or_default().push(pos);
        }
        let admitted: Vec<String> = grouped.keys().cloned().collect();

        let kc = self.stats.all_kc().await?;
        let alloc = sizer::kelly_allocation(&kc, &admitted);
        if alloc.total_kc <= Decimal::ZERO {
            debug!("Pooled Kelly criterion is non-positive, not copying");
            return Ok(());
        }

        let plan = self
            .gateway
            .balance_plan(
                self.sizing.equity_of_total_equity,
                self.sizing.equity_per_single_pos,
            )
            .await?;
        let budget = plan.balance_to_use * alloc.total_kc;

        for (trader_id, rows) in &grouped {
            let share = alloc.shares.get(trader_id).copied().unwrap_or_default();
            if share <= Decimal::ZERO {
                continue;
            }
            let per_pos = budget * share / Decimal::from(rows.len().max(1));
            let trader_budget = budget * share;

            let (to_open, existing) = split_open_existing(rows);
            if to_open.is_empty() {
                continue;
            }

            let symbols = unique_symbols(rows);
            let last_prices = self.gateway.last_prices(&symbols).await;
            let lots = self.gateway.lot_filters(&symbols).await;

            if !existing.is_empty() {
                self.rebalance(&existing, &last_prices, &lots, |pos| {
                    if pos.is_filled {
                        per_pos
                    } else {
                        trader_budget
                    }
                })
                .await?;
            }

            self.open_with_budget(&to_open, per_pos, &last_prices, &lots)
                .await?;
        }
        Ok(())
    }

    /// Open the chosen trader's pending positions, rebalancing already
    /// copied ones down to the per-position budget.
    async fn copy_trader(&self, trader_id: &str, kc: &HashMap<String, Decimal>) -> Result<()> {
        let grouped = self.positions.active_by_trader().await?;
        let Some(rows) = grouped.get(trader_id) else {
            return Ok(());
        };

        let (to_open, existing) = split_open_existing(rows);
        if to_open.is_empty() {
            debug!(trader = trader_id, "No positions to open");
            return Ok(());
        }

        let plan = self
            .gateway
            .balance_plan(
                self.sizing.equity_of_total_equity,
                self.sizing.equity_per_single_pos,
            )
            .await?;
        let penalties = self.stats.all_penalties().await?;
        let kelly = kc.get(trader_id).copied().unwrap_or_default();
        let fraction = sizer::single_copy_fraction(kelly, penalties.get(trader_id).copied());
        let budget = plan.balance_to_use * fraction;
        let per_pos = budget / Decimal::from(to_open.len() + existing.len());

        info!(
            trader = trader_id,
            %kelly,
            %budget,
            %per_pos,
            opening = to_open.len(),
            existing = existing.len(),
            "Copying trader"
        );

        let mut symbols = unique_symbols(&to_open);
        symbols.extend(unique_symbols(&existing));
        symbols.sort_unstable();
        symbols.dedup();
        let last_prices = self.gateway.last_prices(&symbols).await;
        let lots = self.gateway.lot_filters(&symbols).await;

        if !existing.is_empty() {
            self.rebalance(&existing, &last_prices, &lots, |_| per_pos).await?;
        }

        self.open_with_budget(&to_open, per_pos, &last_prices, &lots)
            .await
    }

    /// Ignore a trader's positions with reason "lower kc", cancelling
    /// working orders and closing filled ones.
    async fn close_cancel_ignore_trader(&self, trader_id: &str) -> Result<()> {
        let reason = IgnoreReason::LowerKelly;
        let grouped = self.positions.active_by_trader().await?;
        let Some(rows) = grouped.get(trader_id) else {
            return Ok(());
        };

        let mut to_close = Vec::new();
        let mut to_cancel = Vec::new();
        for pos in rows {
            if pos.is_ignored() {
                continue;
            }
            if pos.is_filled {
                if !pos.is_closed {
                    to_close.push(CloseIntent {
                        position_id: pos.upstream_id,
                        symbol: pos.symbol.clone(),
                        side: pos.side,
                        amount: pos.user_amount,
                    });
                }
            } else if let Some(order_id) = &pos.order_id {
                if !pos.is_canceled {
                    to_cancel.push(CancelIntent {
                        position_id: pos.upstream_id,
                        symbol: pos.symbol.clone(),
                        order_id: order_id.clone(),
                    });
                }
            } else {
                self.positions.set_ignored(pos.upstream_id, &reason).await?;
            }
        }

        for (intent, result) in self.gateway.cancel_orders(to_cancel).await {
            match result {
                Ok(_) => {
                    self.positions
                        .mark_canceled(intent.position_id, Some(&reason))
                        .await?
                }
                Err(e) => warn!(position_id = intent.position_id, error = %e, "Cancel failed"),
            }
        }
        for (intent, result) in self.gateway.close_orders(to_close).await {
            match result {
                Ok(_) => {
                    self.positions
                        .mark_closed(intent.position_id, Decimal::ZERO, Some(&reason))
                        .await?
                }
                Err(e) => warn!(position_id = intent.position_id, error = %e, "Close failed"),
            }
        }
        Ok(())
    }

    /// Bring already copied positions down to their budget: partial-close
    /// filled ones, cancel-and-reopen unfilled ones at the reduced size.
    async fn rebalance(
        &self,
        existing: &[MirroredPosition],
        last_prices: &HashMap<String, Decimal>,
        lots: &HashMap<String, LotFilter>,
        budget_for: impl Fn(&MirroredPosition) -> Decimal,
    ) -> Result<()> {
        let mut to_partial = Vec::new();
        let mut partial_amounts: HashMap<i64, Decimal> = HashMap::new();
        let mut cancel_reopen: HashMap<i64, (CancelIntent, OpenIntent)> = HashMap::new();

        for pos in existing {
            let budget = budget_for(pos);
            if pos.is_filled {
                let Some(&price) = last_prices.get(&pos.symbol) else {
                    continue;
                };
                if price.is_zero() {
                    continue;
                }
                let value = pos.user_amount * price / Decimal::from(pos.leverage);
                let excess = value - budget;
                if excess <= Decimal::ZERO {
                    continue;
                }
                let raw = excess * Decimal::from(pos.leverage) / price;
                let step = lots
                    .get(&pos.symbol)
                    .map(|l| l.step_size)
                    .unwrap_or(Decimal::ZERO);
                let quantity = sizer::snap_close_amount(raw, step, pos.user_amount);
                if quantity.is_zero() {
                    continue;
                }
                partial_amounts.insert(pos.upstream_id, pos.user_amount - quantity);
                to_partial.push(PartialCloseIntent {
                    position_id: pos.upstream_id,
                    symbol: pos.symbol.clone(),
                    side: pos.side,
                    amount: quantity,
                });
            } else {
                // Unfilled limit order: compare against the original entry
                // notional and reopen smaller when above budget.
                let value = pos.user_amount * pos.entry_price;
                if value <= budget {
                    continue;
                }
                let Some(order_id) = &pos.order_id else {
                    continue;
                };
                let raw = budget / pos.entry_price;
                let amount = match lots.get(&pos.symbol) {
                    Some(lot) => sizer::snap_entry_amount(raw, lot, pos.entry_price),
                    None => raw,
                };
                cancel_reopen.insert(
                    pos.upstream_id,
                    (
                        CancelIntent {
                            position_id: pos.upstream_id,
                            symbol: pos.symbol.clone(),
                            order_id: order_id.clone(),
                        },
                        OpenIntent {
                            position_id: pos.upstream_id,
                            symbol: pos.symbol.clone(),
                            side: pos.side,
                            leverage: pos.leverage,
                            price: pos.entry_price,
                            amount,
                        },
                    ),
                );
            }
        }

        for (intent, result) in self.gateway.partial_close_orders(to_partial).await {
            match result {
                Ok(_) => {
                    if let Some(&amount) = partial_amounts.get(&intent.position_id) {
                        self.positions.set_user_amount(intent.position_id, amount).await?;
                    }
                }
                Err(e) => {
                    warn!(position_id = intent.position_id, error = %e, "Rebalance partial close failed")
                }
            }
        }

        let cancels: Vec<CancelIntent> =
            cancel_reopen.values().map(|(c, _)| c.clone()).collect();
        let mut reopen = Vec::new();
        for (intent, result) in self.gateway.cancel_orders(cancels).await {
            match result {
                Ok(_) => {
                    self.positions.set_canceled_flag(intent.position_id).await?;
                    if let Some((_, open)) = cancel_reopen.get(&intent.position_id) {
                        self.positions
                            .set_entry(intent.position_id, open.price, open.amount)
                            .await?;
                        reopen.push(open.clone());
                    }
                }
                Err(e) => {
                    warn!(position_id = intent.position_id, error = %e, "Rebalance cancel failed")
                }
            }
        }

        self.open_and_record(reopen).await
    }

    async fn open_with_budget(
        &self,
        to_open: &[MirroredPosition],
        per_pos: Decimal,
        last_prices: &HashMap<String, Decimal>,
        lots: &HashMap<String, LotFilter>,
    ) -> Result<()> {
        let mut intents = Vec::new();
        for pos in to_open {
            let price = last_prices
                .get(&pos.symbol)
                .copied()
                .unwrap_or(pos.entry_price);
            let raw = sizer::entry_quantity(per_pos, price, pos.leverage);
            let amount = match lots.get(&pos.symbol) {
                Some(lot) => sizer::snap_entry_amount(raw, lot, price),
                None => {
                    warn!(symbol = %pos.symbol, "Missing lot filter, using unsnapped amount");
                    raw
                }
            };
            if amount.is_zero() {
                continue;
            }
            self.positions.set_entry(pos.upstream_id, price, amount).await?;
            intents.push(OpenIntent {
                position_id: pos.upstream_id,
                symbol: pos.symbol.clone(),
                side: pos.side,
                leverage: pos.leverage,
                price,
                amount,
            });
        }
        self.open_and_record(intents).await
    }

    async fn open_and_record(&self, intents: Vec<OpenIntent>) -> Result<()> {
        for (intent, result) in self.gateway.open_orders(intents).await {
            match result {
                Ok(ack) => {
                    info!(
                        position_id = intent.position_id,
                        order_id = %ack.order_id,
                        symbol = %intent.symbol,
                        amount = %intent.amount,
                        "Entry order placed"
                    );
                    self.positions
                        .mark_copied(intent.position_id, &ack.order_id)
                        .await?;
                }
                Err(e) => warn!(position_id = intent.position_id, error = %e, "Entry order failed"),
            }
        }
        Ok(())
    }
}

fn unique_symbols(positions: &[MirroredPosition]) -> Vec<String> {
    positions
        .iter()
        .map(|p| p.symbol.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect()
}

/// Split a trader's rows into not-yet-copied candidates and live copied
/// positions.
fn split_open_existing(
    rows: &[MirroredPosition],
) -> (Vec<MirroredPosition>, Vec<MirroredPosition>) {
    let mut to_open = Vec::new();
    let mut existing = Vec::new();
    for pos in rows {
        if pos.order_id.is_none() && !pos.is_ignored() {
            to_open.push(pos.clone());
        } else if pos.order_id.is_some() && !pos.is_canceled && !pos.is_closed {
            existing.push(pos.clone());
        }
    }
    (to_open, existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use copybot_core::types::{Side, UpstreamPosition};

    fn row(id: i64, order_id: Option<&str>, ignored: bool) -> MirroredPosition {
        let up = UpstreamPosition {
            upstream_id: id,
            trader_id: "t1".into(),
            symbol: "SOLUSDT".into(),
            side: Side::Buy,
            leverage: 5,
            entry_price: Decimal::new(24, 0),
            mark_price: None,
            amount: Decimal::new(100, 0),
            pnl: None,
            roe: None,
            open_time_ms: 0,
            updated_time_ms: 0,
        };
        let mut pos = MirroredPosition::from_upstream(&up, id);
        pos.order_id = order_id.map(str::to_string);
        pos.is_copied = order_id.is_some();
        if ignored {
            pos.ignore_reason = Some(IgnoreReason::FirstRun);
        }
        pos
    }

    #[test]
    fn test_split_open_existing() {
        let rows = vec![
            row(1, None, false),
            row(2, Some("o2"), false),
            row(3, None, true),
        ];
        let (to_open, existing) = split_open_existing(&rows);
        assert_eq!(to_open.len(), 1);
        assert_eq!(to_open[0].upstream_id, 1);
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].upstream_id, 2);
    }

    #[test]
    fn test_split_skips_canceled_and_closed() {
        let mut canceled = row(4, Some("o4"), false);
        canceled.is_canceled = true;
        let mut closed = row(5, Some("o5"), false);
        closed.is_closed = true;
        let (to_open, existing) = split_open_existing(&[canceled, closed]);
        assert!(to_open.is_empty());
        assert!(existing.is_empty());
    }
}
