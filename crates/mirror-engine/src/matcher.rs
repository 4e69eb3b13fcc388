//! Position matching between the upstream feed and the mirror table.
//!
//! The feed may re-price or re-leverage a position between refreshes, so
//! (trader, symbol, side) plus any one corroborating signal is treated as
//! the same position; only a fully unmatched pair means new/disappeared.
//! This avoids re-entering a position the leader merely adjusted.

use copybot_core::types::{MirroredPosition, UpstreamPosition};

/// How a mirrored position relates to its matched upstream counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Same keys, upstream amount decreased: the leader partially closed.
    PartialClose,
    /// Same keys, equal amount and update timestamp: nothing happened.
    Unchanged,
    /// Same (trader, symbol, side, leverage); price or size moved but we
    /// assume the same position and never re-enter.
    Resized,
    /// Same (trader, symbol, side) and equal update timestamp.
    Assumed,
}

/// A mirrored position's upstream counterpart.
#[derive(Debug)]
pub struct UpstreamMatch<'a> {
    pub kind: MatchKind,
    pub upstream: &'a UpstreamPosition,
}

fn classify(mirror: &MirroredPosition, up: &UpstreamPosition) -> Option<MatchKind> {
    if mirror.trader_id != up.trader_id || mirror.symbol != up.symbol || mirror.side != up.side {
        return None;
    }

    if mirror.entry_price == up.entry_price && up.amount < mirror.upstream_amount {
        return Some(MatchKind::PartialClose);
    }
    if mirror.entry_price == up.entry_price
        && mirror.upstream_amount == up.amount
        && mirror.updated_time_ms == up.updated_time_ms
    {
        return Some(MatchKind::Unchanged);
    }
    if mirror.leverage == up.leverage {
        return Some(MatchKind::Resized);
    }
    if mirror.updated_time_ms == up.updated_time_ms {
        return Some(MatchKind::Assumed);
    }
    None
}

/// Find the upstream counterpart of a mirrored position, if any.
pub fn find_upstream<'a>(
    mirror: &MirroredPosition,
    upstream: &'a [UpstreamPosition],
) -> Option<UpstreamMatch<'a>> {
    for up in upstream {
        if let Some(kind) = classify(mirror, up) {
            return Some(UpstreamMatch { kind, upstream: up });
        }
    }
    None
}

/// Whether an upstream position is already tracked by one of the mirrors.
/// Unmatched upstream positions are new.
pub fn has_mirror(up: &UpstreamPosition, mirrors: &[MirroredPosition]) -> bool {
    mirrors.iter().any(|mirror| classify(mirror, up).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use copybot_core::types::Side;
    use rust_decimal::Decimal;

    fn upstream(amount: i64, updated_time_ms: i64) -> UpstreamPosition {
        UpstreamPosition {
            upstream_id: 10,
            trader_id: "t1".into(),
            symbol: "SOLUSDT".into(),
            side: Side::Buy,
            leverage: 5,
            entry_price: Decimal::new(24, 0),
            mark_price: None,
            amount: Decimal::new(amount, 0),
            pnl: None,
            roe: None,
            open_time_ms: 1_000,
            updated_time_ms,
        }
    }

    fn mirror(amount: i64, updated_time_ms: i64) -> MirroredPosition {
        MirroredPosition::from_upstream(&upstream(amount, updated_time_ms), 2_000)
    }

    #[test]
    fn test_amount_decrease_is_partial_close() {
        let m = mirror(100, 5_000);
        let ups = vec![upstream(60, 6_000)];
        let found = find_upstream(&m, &ups).unwrap();
        assert_eq!(found.kind, MatchKind::PartialClose);
    }

    #[test]
    fn test_identical_position_is_unchanged() {
        let m = mirror(100, 5_000);
        let ups = vec![upstream(100, 5_000)];
        assert_eq!(find_upstream(&m, &ups).unwrap().kind, MatchKind::Unchanged);
    }

    #[test]
    fn test_increase_with_same_leverage_is_resized() {
        let m = mirror(100, 5_000);
        // Larger amount, newer timestamp: matched through the leverage rule,
        // never treated as a new position.
        let ups = vec![upstream(150, 6_000)];
        assert_eq!(find_upstream(&m, &ups).unwrap().kind, MatchKind::Resized);
    }

    #[test]
    fn test_leverage_change_matches_by_timestamp() {
        let m = mirror(100, 5_000);
        let mut up = upstream(150, 5_000);
        up.leverage = 10;
        up.entry_price = Decimal::new(25, 0);
        assert_eq!(
            find_upstream(&m, &[up]).unwrap().kind,
            MatchKind::Assumed
        );
    }

    #[test]
    fn test_different_side_never_matches() {
        let m = mirror(100, 5_000);
        let mut up = upstream(100, 5_000);
        up.side = Side::Sell;
        assert!(find_upstream(&m, &[up]).is_none());
    }

    #[test]
    fn test_unmatched_upstream_is_new() {
        let m = mirror(100, 5_000);
        let mut up = upstream(100, 9_000);
        up.symbol = "BTCUSDT".into();
        assert!(!has_mirror(&up, std::slice::from_ref(&m)));

        let same = upstream(100, 5_000);
        assert!(has_mirror(&same, &[m]));
    }
}
