//! Admission rules for new positions and conflict resolution across the
//! active set. Rules are evaluated in order; the first trigger wins.

use copybot_core::config::PolicyConfig;
use copybot_core::types::{
    IgnoreReason, MirroredPosition, RoiWindow, RoiWindows, TraderKind,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// Traders need at least this many closed trades before being copied.
pub const MIN_CLOSED_TRADES: i64 = 30;

/// Everything known about a trader at admission time.
pub struct AdmissionInputs<'a> {
    /// First cycle of this process: everything is ignored.
    pub first_run: bool,
    pub policy: &'a PolicyConfig,
    pub trader_kind: Option<TraderKind>,
    pub roi: RoiWindows,
    pub closed_trades: i64,
    pub kelly: Option<Decimal>,
}

/// Decide whether a new position is admitted; `Some` carries the ignore
/// reason to persist.
pub fn admission_verdict(inputs: &AdmissionInputs) -> Option<IgnoreReason> {
    if inputs.first_run {
        return Some(IgnoreReason::FirstRun);
    }

    if inputs.policy.ignore_observed_traders && inputs.trader_kind == Some(TraderKind::Observed) {
        return Some(IgnoreReason::ObservedTrader);
    }

    if inputs.policy.ignore_neg_all_timeframes_roi_traders {
        let mut negative = Vec::new();
        let windows = [
            (RoiWindow::Daily, inputs.roi.daily),
            (RoiWindow::Weekly, inputs.roi.weekly),
            (RoiWindow::Monthly, inputs.roi.monthly),
            (RoiWindow::Total, inputs.roi.total),
        ];
        for (window, value) in windows {
            if matches!(value, Some(v) if v <= Decimal::ZERO) {
                negative.push(window);
            }
        }
        if !negative.is_empty() {
            return Some(IgnoreReason::NegativeRoi(negative));
        }
    }

    if inputs.policy.ignore_neg_total_roi_traders {
        match inputs.roi.total {
            None => return Some(IgnoreReason::MissingTotalRoi),
            Some(total) if total <= Decimal::ZERO => {
                return Some(IgnoreReason::NegativeTotalRoi)
            }
            _ => {}
        }
    }

    if inputs.closed_trades < MIN_CLOSED_TRADES {
        return Some(IgnoreReason::LowTradeCount);
    }

    if matches!(inputs.kelly, Some(kc) if kc <= Decimal::ZERO) {
        return Some(IgnoreReason::NegativeKelly);
    }

    None
}

/// A still-unfilled order past its fill window is expired.
pub fn is_expired(pos: &MirroredPosition, now_ms: i64, max_time_to_fill_secs: i64) -> bool {
    pos.age_secs(now_ms) >= max_time_to_fill_secs
}

/// Resolve symbol conflicts across active, non-ignored positions.
///
/// Pair policies: hedged (same trader, opposite sides) keeps the later
/// update timestamp; cross-opposite (distinct traders) compares win-lose
/// result, falling back to total ROI; duplicates (same symbol and side) keep
/// the earliest inserted row. `positions` must be in insertion order.
/// Returns the losers with their reasons; positions already marked in this
/// pass are skipped in later pairs.
pub fn resolve_conflicts(
    positions: &[MirroredPosition],
    win_lose: &HashMap<String, i32>,
    total_roi: &HashMap<String, Decimal>,
) -> Vec<(i64, IgnoreReason)> {
    let mut losers: Vec<(i64, IgnoreReason)> = Vec::new();
    let mut marked: HashSet<i64> = HashSet::new();

    for (i, a) in positions.iter().enumerate() {
        for b in positions.iter().skip(i + 1) {
            if marked.contains(&a.upstream_id) {
                break;
            }
            if marked.contains(&b.upstream_id) || a.symbol != b.symbol {
                continue;
            }

            if a.side == b.side {
                marked.insert(b.upstream_id);
                losers.push((b.upstream_id, IgnoreReason::DuplicateSymbol));
                continue;
            }

            if a.trader_id == b.trader_id {
                let loser = if b.updated_time_ms >= a.updated_time_ms { a } else { b };
                marked.insert(loser.upstream_id);
                losers.push((loser.upstream_id, IgnoreReason::Hedged));
                continue;
            }

            let a_wl = win_lose.get(&a.trader_id).copied().unwrap_or(0);
            let b_wl = win_lose.get(&b.trader_id).copied().unwrap_or(0);
            if a_wl != b_wl {
                let loser = if a_wl > b_wl { b } else { a };
                marked.insert(loser.upstream_id);
                losers.push((loser.upstream_id, IgnoreReason::LowerWinLoseRes));
            } else {
                let a_roi = total_roi.get(&a.trader_id).copied().unwrap_or_default();
                let b_roi = total_roi.get(&b.trader_id).copied().unwrap_or_default();
                let loser = if a_roi > b_roi { b } else { a };
                marked.insert(loser.upstream_id);
                losers.push((loser.upstream_id, IgnoreReason::LowerRoi));
            }
        }
    }

    losers
}

#[cfg(test)]
mod tests {
    use super::*;
    use copybot_core::config::{CopyMode, CopyTraderBy};
    use copybot_core::types::{Side, UpstreamPosition};

    fn policy() -> PolicyConfig {
        PolicyConfig {
            sl_ratio: Decimal::new(5, 1),
            copy_trader_by: CopyTraderBy::KellyCriterion,
            copy_mode: CopyMode::Single,
            max_time_to_fill: 300,
            ignore_neg_total_roi_traders: true,
            ignore_neg_all_timeframes_roi_traders: true,
            ignore_observed_traders: true,
        }
    }

    fn inputs(policy: &PolicyConfig) -> AdmissionInputs<'_> {
        AdmissionInputs {
            first_run: false,
            policy,
            trader_kind: Some(TraderKind::Followed),
            roi: RoiWindows {
                daily: Some(Decimal::new(1, 2)),
                weekly: Some(Decimal::new(2, 2)),
                monthly: Some(Decimal::new(5, 2)),
                total: Some(Decimal::new(20, 2)),
            },
            closed_trades: 40,
            kelly: Some(Decimal::new(8, 2)),
        }
    }

    #[test]
    fn test_healthy_trader_is_admitted() {
        let policy = policy();
        assert_eq!(admission_verdict(&inputs(&policy)), None);
    }

    #[test]
    fn test_first_run_ignores_everything() {
        let policy = policy();
        let mut i = inputs(&policy);
        i.first_run = true;
        assert_eq!(admission_verdict(&i), Some(IgnoreReason::FirstRun));
    }

    #[test]
    fn test_observed_trader_is_ignored_when_toggled() {
        let policy = policy();
        let mut i = inputs(&policy);
        i.trader_kind = Some(TraderKind::Observed);
        assert_eq!(admission_verdict(&i), Some(IgnoreReason::ObservedTrader));
    }

    #[test]
    fn test_negative_windows_build_a_composite_reason() {
        let policy = policy();
        let mut i = inputs(&policy);
        i.roi.daily = Some(Decimal::ZERO);
        i.roi.monthly = Some(Decimal::new(-1, 2));
        assert_eq!(
            admission_verdict(&i),
            Some(IgnoreReason::NegativeRoi(vec![
                RoiWindow::Daily,
                RoiWindow::Monthly
            ]))
        );
    }

    #[test]
    fn test_missing_total_roi() {
        let policy = policy();
        let mut i = inputs(&policy);
        i.roi.total = None;
        assert_eq!(admission_verdict(&i), Some(IgnoreReason::MissingTotalRoi));
    }

    #[test]
    fn test_low_trade_count() {
        let policy = policy();
        let mut i = inputs(&policy);
        i.closed_trades = MIN_CLOSED_TRADES - 1;
        assert_eq!(admission_verdict(&i), Some(IgnoreReason::LowTradeCount));
    }

    #[test]
    fn test_non_positive_kelly() {
        let policy = policy();
        let mut i = inputs(&policy);
        i.kelly = Some(Decimal::ZERO);
        assert_eq!(admission_verdict(&i), Some(IgnoreReason::NegativeKelly));
        i.kelly = None;
        assert_eq!(admission_verdict(&i), None);
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let up = UpstreamPosition {
            upstream_id: 1,
            trader_id: "t".into(),
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
        let pos = MirroredPosition::from_upstream(&up, 0);
        assert!(!is_expired(&pos, 299_999, 300));
        assert!(is_expired(&pos, 300_000, 300));
    }

    fn conflict_pos(
        id: i64,
        trader: &str,
        symbol: &str,
        side: Side,
        updated_time_ms: i64,
    ) -> MirroredPosition {
        let up = UpstreamPosition {
            upstream_id: id,
            trader_id: trader.into(),
            symbol: symbol.into(),
            side,
            leverage: 5,
            entry_price: Decimal::new(24, 0),
            mark_price: None,
            amount: Decimal::new(100, 0),
            pnl: None,
            roe: None,
            open_time_ms: 0,
            updated_time_ms,
        };
        MirroredPosition::from_upstream(&up, id)
    }

    #[test]
    fn test_hedged_keeps_the_later_position() {
        let positions = vec![
            conflict_pos(1, "t1", "SOLUSDT", Side::Buy, 1_000),
            conflict_pos(2, "t1", "SOLUSDT", Side::Sell, 2_000),
        ];
        let losers = resolve_conflicts(&positions, &HashMap::new(), &HashMap::new());
        assert_eq!(losers, vec![(1, IgnoreReason::Hedged)]);
    }

    #[test]
    fn test_cross_opposite_compares_win_lose_first() {
        let positions = vec![
            conflict_pos(1, "t1", "SOLUSDT", Side::Buy, 1_000),
            conflict_pos(2, "t2", "SOLUSDT", Side::Sell, 2_000),
        ];
        let win_lose = HashMap::from([("t1".to_string(), 3), ("t2".to_string(), 5)]);
        let losers = resolve_conflicts(&positions, &win_lose, &HashMap::new());
        assert_eq!(losers, vec![(1, IgnoreReason::LowerWinLoseRes)]);
    }

    #[test]
    fn test_cross_opposite_falls_back_to_roi() {
        let positions = vec![
            conflict_pos(1, "t1", "SOLUSDT", Side::Buy, 1_000),
            conflict_pos(2, "t2", "SOLUSDT", Side::Sell, 2_000),
        ];
        let win_lose = HashMap::from([("t1".to_string(), 3), ("t2".to_string(), 3)]);
        let roi = HashMap::from([
            ("t1".to_string(), Decimal::new(30, 2)),
            ("t2".to_string(), Decimal::new(10, 2)),
        ]);
        let losers = resolve_conflicts(&positions, &win_lose, &roi);
        assert_eq!(losers, vec![(2, IgnoreReason::LowerRoi)]);
    }

    #[test]
    fn test_duplicate_keeps_the_earliest_row() {
        let positions = vec![
            conflict_pos(1, "t1", "SOLUSDT", Side::Buy, 1_000),
            conflict_pos(2, "t2", "SOLUSDT", Side::Buy, 2_000),
            conflict_pos(3, "t3", "SOLUSDT", Side::Buy, 3_000),
        ];
        let losers = resolve_conflicts(&positions, &HashMap::new(), &HashMap::new());
        assert_eq!(
            losers,
            vec![
                (2, IgnoreReason::DuplicateSymbol),
                (3, IgnoreReason::DuplicateSymbol)
            ]
        );
    }

    #[test]
    fn test_marked_losers_do_not_fight_again() {
        // 1 loses to 2 (hedged, earlier); 1 must not then beat 3.
        let positions = vec![
            conflict_pos(1, "t1", "SOLUSDT", Side::Buy, 1_000),
            conflict_pos(2, "t1", "SOLUSDT", Side::Sell, 2_000),
            conflict_pos(3, "t2", "SOLUSDT", Side::Buy, 3_000),
        ];
        let losers = resolve_conflicts(&positions, &HashMap::new(), &HashMap::new());
        assert_eq!(losers.len(), 2);
        assert_eq!(losers[0], (1, IgnoreReason::Hedged));
        // 2 and 3 remain opposite-side across traders: equal stats ignore 2.
        assert_eq!(losers[1], (2, IgnoreReason::LowerRoi));
    }
}
