//! Single-copy trader selection with switch hysteresis.

use copybot_core::config::CopyTraderBy;
use copybot_core::types::MirroredPosition;
use copybot_core::{Error, Result};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// Required edge before abandoning the currently copied trader: the
/// candidate's KC must exceed 1.2x the incumbent's.
const KC_SWITCH_RATIO: Decimal = Decimal::from_parts(12, 0, 0, false, 1);

/// What the selector decided for this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Keep copying the incumbent.
    Stay(String),
    /// Drop the incumbent and start copying the challenger.
    Switch { from: String, to: String },
    /// No incumbent; start copying the leader.
    Start(String),
    /// Nothing to copy.
    Idle,
}

impl Selection {
    /// The trader that will be copied after this decision, if any.
    pub fn chosen(&self) -> Option<&str> {
        match self {
            Selection::Stay(t) | Selection::Start(t) => Some(t),
            Selection::Switch { to, .. } => Some(to),
            Selection::Idle => None,
        }
    }
}

/// The trader with the largest Kelly criterion among those holding at least
/// one copy-candidate position.
pub fn leader_by_kc(
    positions: &[MirroredPosition],
    kc: &HashMap<String, Decimal>,
) -> Option<String> {
    let mut best: Option<(String, Decimal)> = None;
    for pos in positions.iter().filter(|p| p.is_copy_candidate()) {
        let Some(value) = kc.get(&pos.trader_id) else {
            continue;
        };
        if *value > Decimal::ZERO && best.as_ref().map_or(true, |(_, b)| value > b) {
            best = Some((pos.trader_id.clone(), *value));
        }
    }
    best.map(|(trader, _)| trader)
}

/// The trader with the largest closed-trade count among those holding at
/// least one copy-candidate position.
pub fn leader_by_tc(
    positions: &[MirroredPosition],
    tc: &HashMap<String, i64>,
) -> Option<String> {
    let mut best: Option<(String, i64)> = None;
    for pos in positions.iter().filter(|p| p.is_copy_candidate()) {
        let Some(value) = tc.get(&pos.trader_id) else {
            continue;
        };
        if *value > 0 && best.as_ref().map_or(true, |(_, b)| value > b) {
            best = Some((pos.trader_id.clone(), *value));
        }
    }
    best.map(|(trader, _)| trader)
}

/// The trader whose positions are currently copied and not closed. Finding
/// more than one such trader violates the single-copy invariant.
pub fn currently_copied(positions: &[MirroredPosition]) -> Result<Option<String>> {
    let traders: HashSet<&str> = positions
        .iter()
        .filter(|p| p.is_active && p.is_copied && !p.is_closed && !p.is_ignored())
        .map(|p| p.trader_id.as_str())
        .collect();

    match traders.len() {
        0 => Ok(None),
        1 => Ok(traders.into_iter().next().map(str::to_string)),
        _ => {
            let mut names: Vec<&str> = traders.into_iter().collect();
            names.sort_unstable();
            Err(Error::Anomaly(format!(
                "more than one currently copied trader: {}",
                names.join(", ")
            )))
        }
    }
}

/// Decide whom to copy, applying the hysteresis band against the incumbent.
pub fn decide(
    current: Option<String>,
    leader: Option<String>,
    ranking: CopyTraderBy,
    kc: &HashMap<String, Decimal>,
    tc: &HashMap<String, i64>,
) -> Selection {
    match (current, leader) {
        (None, None) => Selection::Idle,
        (Some(current), None) => Selection::Stay(current),
        (None, Some(leader)) => Selection::Start(leader),
        (Some(current), Some(leader)) if current == leader => Selection::Stay(current),
        (Some(current), Some(leader)) => {
            let should_switch = match ranking {
                CopyTraderBy::KellyCriterion => {
                    let current_kc = kc.get(&current).copied().unwrap_or_default();
                    let leader_kc = kc.get(&leader).copied().unwrap_or_default();
                    current_kc * KC_SWITCH_RATIO < leader_kc
                }
                CopyTraderBy::TradeCount => {
                    let current_tc = tc.get(&current).copied().unwrap_or_default();
                    let leader_tc = tc.get(&leader).copied().unwrap_or_default();
                    current_tc < leader_tc
                }
            };
            if should_switch {
                Selection::Switch {
                    from: current,
                    to: leader,
                }
            } else {
                Selection::Stay(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copybot_core::types::{Side, UpstreamPosition};

    fn position(id: i64, trader: &str, copied: bool) -> MirroredPosition {
        let up = UpstreamPosition {
            upstream_id: id,
            trader_id: trader.into(),
            symbol: format!("S{id}USDT"),
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
        pos.is_copied = copied;
        pos
    }

    fn kc(pairs: &[(&str, i64, u32)]) -> HashMap<String, Decimal> {
        pairs
            .iter()
            .map(|(t, mantissa, scale)| (t.to_string(), Decimal::new(*mantissa, *scale)))
            .collect()
    }

    #[test]
    fn test_leader_is_largest_positive_kc() {
        let positions = vec![position(1, "t1", false), position(2, "t2", false)];
        let stats = kc(&[("t1", 10, 2), ("t2", 13, 2)]);
        assert_eq!(leader_by_kc(&positions, &stats), Some("t2".to_string()));
    }

    #[test]
    fn test_negative_kc_traders_never_lead() {
        let positions = vec![position(1, "t1", false)];
        let stats = kc(&[("t1", -5, 2)]);
        assert_eq!(leader_by_kc(&positions, &stats), None);
    }

    #[test]
    fn test_currently_copied_unique() {
        let positions = vec![position(1, "t1", true), position(2, "t1", true)];
        assert_eq!(currently_copied(&positions).unwrap(), Some("t1".to_string()));
    }

    #[test]
    fn test_two_copied_traders_is_an_anomaly() {
        let positions = vec![position(1, "t1", true), position(2, "t2", true)];
        assert!(currently_copied(&positions).is_err());
    }

    #[test]
    fn test_hysteresis_holds_at_exactly_1_2x() {
        let stats = kc(&[("t1", 10, 2), ("t2", 12, 2)]);
        let selection = decide(
            Some("t1".into()),
            Some("t2".into()),
            CopyTraderBy::KellyCriterion,
            &stats,
            &HashMap::new(),
        );
        assert_eq!(selection, Selection::Stay("t1".to_string()));
    }

    #[test]
    fn test_switches_above_1_2x() {
        let stats = kc(&[("t1", 10, 2), ("t2", 13, 2)]);
        let selection = decide(
            Some("t1".into()),
            Some("t2".into()),
            CopyTraderBy::KellyCriterion,
            &stats,
            &HashMap::new(),
        );
        assert_eq!(
            selection,
            Selection::Switch {
                from: "t1".to_string(),
                to: "t2".to_string()
            }
        );
    }

    #[test]
    fn test_stays_below_threshold() {
        // 0.11 / 0.10 = 1.1x: inside the hysteresis band.
        let stats = kc(&[("t1", 10, 2), ("t2", 11, 2)]);
        let selection = decide(
            Some("t1".into()),
            Some("t2".into()),
            CopyTraderBy::KellyCriterion,
            &stats,
            &HashMap::new(),
        );
        assert_eq!(selection, Selection::Stay("t1".to_string()));
    }

    #[test]
    fn test_trade_count_switches_on_strictly_greater() {
        let tc = HashMap::from([("t1".to_string(), 50_i64), ("t2".to_string(), 50_i64)]);
        let selection = decide(
            Some("t1".into()),
            Some("t2".into()),
            CopyTraderBy::TradeCount,
            &HashMap::new(),
            &tc,
        );
        assert_eq!(selection, Selection::Stay("t1".to_string()));

        let tc = HashMap::from([("t1".to_string(), 50_i64), ("t2".to_string(), 51_i64)]);
        let selection = decide(
            Some("t1".into()),
            Some("t2".into()),
            CopyTraderBy::TradeCount,
            &HashMap::new(),
            &tc,
        );
        assert!(matches!(selection, Selection::Switch { .. }));
    }

    #[test]
    fn test_no_incumbent_starts_on_leader() {
        let selection = decide(
            None,
            Some("t2".into()),
            CopyTraderBy::KellyCriterion,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(selection, Selection::Start("t2".to_string()));
    }
}
