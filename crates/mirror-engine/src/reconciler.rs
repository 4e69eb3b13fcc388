//! The reconciliation phases of one cycle: reflect fills, update PnL,
//! retire disappeared positions, insert new ones, resize on leader
//! reductions, and resolve symbol conflicts.
//!
//! Each DB write is a single-row update performed only after the matching
//! exchange acknowledgement; a failed exchange call leaves the row for the
//! next cycle.

use crate::filter::{self, AdmissionInputs};
use crate::matcher::{self, MatchKind};
use crate::sizer;
use copybot_core::config::{PolicyConfig, SizingConfig};
use copybot_core::db::{PositionRepository, StatsRepository, TraderRepository};
use copybot_core::types::{now_ms, IgnoreReason, MirroredPosition, UpstreamPosition};
use copybot_core::Result;
use exchange_gateway::{CancelAck, CancelIntent, CloseIntent, Gateway, PartialCloseIntent};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub struct Reconciler<'a> {
    pub positions: &'a PositionRepository,
    pub traders: &'a TraderRepository,
    pub stats: &'a StatsRepository,
    pub gateway: &'a Gateway,
    pub sizing: &'a SizingConfig,
    pub policy: &'a PolicyConfig,
}

impl Reconciler<'_> {
    /// Phase 1: mark mirrored positions whose entry order shows FILLED in
    /// the exchange's order history. Replaying this phase is a no-op.
    pub async fn reflect_fills(&self) -> Result<()> {
        let active = self.positions.active().await?;
        let pending: Vec<&MirroredPosition> = active
            .iter()
            .filter(|p| p.is_copied && !p.is_filled && p.order_id.is_some())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let symbols: Vec<String> = pending
            .iter()
            .map(|p| p.symbol.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let filled = self.gateway.filled_order_ids(&symbols).await;

        for pos in pending {
            let Some(order_id) = &pos.order_id else {
                continue;
            };
            if filled.contains(order_id) {
                debug!(upstream_id = pos.upstream_id, "Entry order filled");
                self.positions.mark_filled(pos.upstream_id).await?;
            }
        }
        Ok(())
    }

    /// Phase 2: copy PnL and ROE from each matched upstream position.
    pub async fn update_pnl_roe(
        &self,
        upstream: &HashMap<String, Vec<UpstreamPosition>>,
    ) -> Result<()> {
        for pos in self.positions.active().await? {
            let Some(candidates) = upstream.get(&pos.trader_id) else {
                continue;
            };
            let Some(found) = matcher::find_upstream(&pos, candidates) else {
                continue;
            };
            let up = found.upstream;
            if pos.pnl != up.pnl || pos.roe != up.roe {
                self.positions
                    .update_pnl_roe(pos.upstream_id, up.pnl, up.roe)
                    .await?;
            }
        }
        Ok(())
    }

    /// Phase 3: retire mirrored positions whose upstream counterpart is
    /// gone, and expire stale unfilled orders.
    pub async fn retire_disappeared(
        &self,
        upstream: &HashMap<String, Vec<UpstreamPosition>>,
    ) -> Result<()> {
        let now = now_ms();
        let mut to_close: Vec<CloseIntent> = Vec::new();
        let mut to_cancel: Vec<CancelIntent> = Vec::new();
        // Ignore reason carried into the pending cancel, keyed by row.
        let mut cancel_reasons: HashMap<i64, IgnoreReason> = HashMap::new();
        let mut roes: HashMap<i64, (String, Option<Decimal>)> = HashMap::new();

        for pos in self.positions.active().await? {
            roes.insert(pos.upstream_id, (pos.trader_id.clone(), pos.roe));
            let candidates = upstream.get(&pos.trader_id).map(Vec::as_slice).unwrap_or(&[]);

            if matcher::find_upstream(&pos, candidates).is_some() {
                // Still mirrored upstream; check the fill-window expiry.
                let already_expired =
                    matches!(&pos.ignore_reason, Some(IgnoreReason::Expired));
                if !pos.is_filled
                    && !already_expired
                    && filter::is_expired(&pos, now, self.policy.max_time_to_fill)
                {
                    self.positions
                        .set_ignored(pos.upstream_id, &IgnoreReason::Expired)
                        .await?;
                    if let Some(order_id) = &pos.order_id {
                        if !pos.is_canceled {
                            cancel_reasons.insert(pos.upstream_id, IgnoreReason::Expired);
                            to_cancel.push(CancelIntent {
                                position_id: pos.upstream_id,
                                symbol: pos.symbol.clone(),
                                order_id: order_id.clone(),
                            });
                        }
                    }
                }
                continue;
            }

            // Disappeared upstream.
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
                if pos.is_canceled {
                    // Cancel already confirmed earlier; just retire the row.
                    self.positions.deactivate(pos.upstream_id).await?;
                    self.record_outcome(&pos.trader_id, pos.roe).await?;
                } else {
                    to_cancel.push(CancelIntent {
                        position_id: pos.upstream_id,
                        symbol: pos.symbol.clone(),
                        order_id: order_id.clone(),
                    });
                }
            } else {
                // Never copied.
                self.positions.deactivate(pos.upstream_id).await?;
                self.record_outcome(&pos.trader_id, pos.roe).await?;
            }
        }

        for (intent, result) in self.gateway.cancel_orders(to_cancel).await {
            match result {
                Ok(CancelAck::Canceled) | Ok(CancelAck::NotFound) => {
                    let reason = cancel_reasons.get(&intent.position_id);
                    self.positions
                        .mark_canceled(intent.position_id, reason)
                        .await?;
                    // An expired cancel keeps the row active; everything else
                    // retires it and books the outcome.
                    if !matches!(reason, Some(r) if !r.is_terminal()) {
                        if let Some((trader_id, roe)) = roes.get(&intent.position_id) {
                            self.record_outcome(trader_id, *roe).await?;
                        }
                    }
                }
                Err(e) => warn!(position_id = intent.position_id, error = %e, "Cancel failed"),
            }
        }

        for (intent, result) in self.gateway.close_orders(to_close).await {
            match result {
                Ok(_) => {
                    self.positions
                        .mark_closed(intent.position_id, Decimal::ZERO, None)
                        .await?;
                    if let Some((trader_id, roe)) = roes.get(&intent.position_id) {
                        self.record_outcome(trader_id, *roe).await?;
                    }
                }
                Err(e) => warn!(position_id = intent.position_id, error = %e, "Close failed"),
            }
        }

        Ok(())
    }

    /// Phase 4: persist new upstream positions that pass the admission
    /// filter, sized at the percent-of-equity base.
    pub async fn insert_new(
        &self,
        upstream: &HashMap<String, Vec<UpstreamPosition>>,
        first_run: bool,
    ) -> Result<()> {
        let mirrors = self.positions.active().await?;
        let mut fresh: Vec<&UpstreamPosition> = Vec::new();
        for positions in upstream.values() {
            for up in positions {
                if !matcher::has_mirror(up, &mirrors) {
                    fresh.push(up);
                }
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let trader_ids: Vec<String> = fresh
            .iter()
            .map(|up| up.trader_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let rois = self.traders.rois_for(&trader_ids).await?;
        let kinds = self.traders.trader_kinds(&trader_ids).await?;
        let trade_counts = self.positions.closed_trade_counts().await?;
        let kc = self.stats.all_kc().await?;
        let success = self.stats.all_success().await?;

        let plan = self
            .gateway
            .balance_plan(
                self.sizing.equity_of_total_equity,
                self.sizing.equity_per_single_pos,
            )
            .await?;

        let symbols: Vec<String> = fresh
            .iter()
            .map(|up| up.symbol.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let lot_filters = self.gateway.lot_filters(&symbols).await;

        let now = now_ms();
        for up in fresh {
            let verdict = admission_for(
                up,
                first_run,
                self.policy,
                &rois,
                &kinds,
                &trade_counts,
                &kc,
            );

            let win_lose = success
                .get(&up.trader_id)
                .map(|s| s.win_lose_res())
                .unwrap_or(0);
            let pct = sizer::dynamic_allocation_pct(self.sizing, win_lose);
            let budget = plan.balance_to_use * pct / Decimal::ONE_HUNDRED;
            let raw = sizer::entry_quantity(budget, up.entry_price, up.leverage);
            let user_amount = match lot_filters.get(&up.symbol) {
                Some(lot) => sizer::snap_entry_amount(raw, lot, up.entry_price),
                None => {
                    warn!(symbol = %up.symbol, "Missing lot filter, using unsnapped amount");
                    raw
                }
            };

            let mut row = MirroredPosition::from_upstream(up, now);
            row.user_amount = user_amount;
            row.ignore_reason = verdict;

            info!(
                upstream_id = row.upstream_id,
                trader = %row.trader_id,
                symbol = %row.symbol,
                ignored = ?row.ignore_reason,
                %user_amount,
                "Inserting new upstream position"
            );
            self.positions.insert(&row).await?;
            self.traders
                .update_last_pos_at(&up.trader_id, chrono::Utc::now())
                .await?;
        }
        Ok(())
    }

    /// Phase 5: mirror leader reductions with snapped partial closes; on
    /// leader increases only record the new amount.
    pub async fn resize_existing(
        &self,
        upstream: &HashMap<String, Vec<UpstreamPosition>>,
    ) -> Result<()> {
        let mut to_partial: Vec<PartialCloseIntent> = Vec::new();
        // (new upstream amount, new user amount) per row pending close ack.
        let mut pending: HashMap<i64, (Decimal, Decimal)> = HashMap::new();

        let active = self.positions.active().await?;
        let symbols: Vec<String> = active
            .iter()
            .map(|p| p.symbol.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let lot_filters = self.gateway.lot_filters(&symbols).await;

        for pos in &active {
            let candidates = upstream.get(&pos.trader_id).map(Vec::as_slice).unwrap_or(&[]);
            let Some(found) = matcher::find_upstream(pos, candidates) else {
                continue;
            };
            let up = found.upstream;

            match found.kind {
                MatchKind::PartialClose => {
                    if pos.upstream_amount.is_zero() {
                        continue;
                    }
                    let ratio = up.amount / pos.upstream_amount;
                    let new_user_amount = pos.user_amount * ratio;
                    let raw_close = pos.user_amount - new_user_amount;

                    if pos.is_ignored() || !pos.is_filled {
                        // Nothing to reduce on the venue yet; track the
                        // leader's new size.
                        self.positions
                            .set_upstream_amount(pos.upstream_id, up.amount)
                            .await?;
                        continue;
                    }

                    let step = lot_filters
                        .get(&pos.symbol)
                        .map(|l| l.step_size)
                        .unwrap_or(Decimal::ZERO);
                    let quantity = sizer::snap_close_amount(raw_close, step, pos.user_amount);
                    if quantity.is_zero() {
                        continue;
                    }

                    pending.insert(
                        pos.upstream_id,
                        (up.amount, pos.user_amount - quantity),
                    );
                    to_partial.push(PartialCloseIntent {
                        position_id: pos.upstream_id,
                        symbol: pos.symbol.clone(),
                        side: pos.side,
                        amount: quantity,
                    });
                }
                MatchKind::Resized | MatchKind::Assumed => {
                    // The leader increased or re-priced; we never add to our
                    // position, only track the size.
                    if pos.upstream_amount < up.amount {
                        self.positions
                            .set_upstream_amount(pos.upstream_id, up.amount)
                            .await?;
                    }
                }
                MatchKind::Unchanged => {}
            }
        }

        for (intent, result) in self.gateway.partial_close_orders(to_partial).await {
            match result {
                Ok(_) => {
                    if let Some((upstream_amount, user_amount)) = pending.get(&intent.position_id)
                    {
                        self.positions
                            .update_amounts(intent.position_id, *upstream_amount, *user_amount)
                            .await?;
                        debug!(
                            position_id = intent.position_id,
                            closed = %intent.amount,
                            "Partially closed on leader reduction"
                        );
                    }
                }
                Err(e) => {
                    warn!(position_id = intent.position_id, error = %e, "Partial close failed")
                }
            }
        }
        Ok(())
    }

    /// Resolve symbol conflicts across the active set and drive the losers'
    /// cancels and closes.
    pub async fn resolve_conflicts(&self) -> Result<()> {
        let active = self.positions.active().await?;
        let candidates: Vec<MirroredPosition> = active
            .iter()
            .filter(|p| !p.is_ignored())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let trader_ids: Vec<String> = candidates
            .iter()
            .map(|p| p.trader_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let success = self.stats.all_success().await?;
        let win_lose: HashMap<String, i32> = success
            .iter()
            .map(|(t, s)| (t.clone(), s.win_lose_res()))
            .collect();
        let rois = self.traders.rois_for(&trader_ids).await?;
        let total_roi: HashMap<String, Decimal> = rois
            .iter()
            .filter_map(|(t, r)| r.total.map(|v| (t.clone(), v)))
            .collect();

        let losers = filter::resolve_conflicts(&candidates, &win_lose, &total_roi);
        if losers.is_empty() {
            return Ok(());
        }

        let by_id: HashMap<i64, &MirroredPosition> =
            candidates.iter().map(|p| (p.upstream_id, p)).collect();
        let mut to_cancel = Vec::new();
        let mut to_close = Vec::new();
        let mut reasons: HashMap<i64, IgnoreReason> = HashMap::new();
        let mut roes: HashMap<i64, (String, Option<Decimal>)> = HashMap::new();

        for (upstream_id, reason) in losers {
            let Some(pos) = by_id.get(&upstream_id) else {
                continue;
            };
            info!(upstream_id, reason = %reason, "Conflict loser");
            roes.insert(upstream_id, (pos.trader_id.clone(), pos.roe));

            if !pos.is_copied {
                self.positions.set_ignored(upstream_id, &reason).await?;
            } else if pos.is_filled {
                if !pos.is_closed {
                    reasons.insert(upstream_id, reason);
                    to_close.push(CloseIntent {
                        position_id: upstream_id,
                        symbol: pos.symbol.clone(),
                        side: pos.side,
                        amount: pos.user_amount,
                    });
                }
            } else if let Some(order_id) = &pos.order_id {
                if !pos.is_canceled {
                    reasons.insert(upstream_id, reason);
                    to_cancel.push(CancelIntent {
                        position_id: upstream_id,
                        symbol: pos.symbol.clone(),
                        order_id: order_id.clone(),
                    });
                }
            } else {
                self.positions.set_ignored(upstream_id, &reason).await?;
            }
        }

        for (intent, result) in self.gateway.cancel_orders(to_cancel).await {
            match result {
                Ok(_) => {
                    self.positions
                        .mark_canceled(intent.position_id, reasons.get(&intent.position_id))
                        .await?;
                    if let Some((trader_id, roe)) = roes.get(&intent.position_id) {
                        self.record_outcome(trader_id, *roe).await?;
                    }
                }
                Err(e) => warn!(position_id = intent.position_id, error = %e, "Conflict cancel failed"),
            }
        }

        for (intent, result) in self.gateway.close_orders(to_close).await {
            match result {
                Ok(_) => {
                    self.positions
                        .mark_closed(
                            intent.position_id,
                            Decimal::ZERO,
                            reasons.get(&intent.position_id),
                        )
                        .await?;
                    if let Some((trader_id, roe)) = roes.get(&intent.position_id) {
                        self.record_outcome(trader_id, *roe).await?;
                    }
                }
                Err(e) => warn!(position_id = intent.position_id, error = %e, "Conflict close failed"),
            }
        }

        Ok(())
    }

    /// Book a deactivated position as a win or a loss by its last ROE.
    async fn record_outcome(&self, trader_id: &str, roe: Option<Decimal>) -> Result<()> {
        match roe {
            Some(roe) if roe > Decimal::ZERO => self.stats.record_result(trader_id, true).await,
            Some(roe) if roe < Decimal::ZERO => self.stats.record_result(trader_id, false).await,
            _ => Ok(()),
        }
    }
}

/// Evaluate the admission rules for one upstream position.
fn admission_for(
    up: &UpstreamPosition,
    first_run: bool,
    policy: &PolicyConfig,
    rois: &HashMap<String, copybot_core::types::RoiWindows>,
    kinds: &HashMap<String, copybot_core::types::TraderKind>,
    trade_counts: &HashMap<String, i64>,
    kc: &HashMap<String, Decimal>,
) -> Option<IgnoreReason> {
    let inputs = AdmissionInputs {
        first_run,
        policy,
        trader_kind: kinds.get(&up.trader_id).copied(),
        roi: rois.get(&up.trader_id).cloned().unwrap_or_default(),
        closed_trades: trade_counts.get(&up.trader_id).copied().unwrap_or(0),
        kelly: kc.get(&up.trader_id).copied(),
    };
    filter::admission_verdict(&inputs)
}
