//! Position sizing: percent-of-equity base, win/lose modulation, Kelly
//! weighting and exchange lot-step snapping.

use copybot_core::config::SizingConfig;
use exchange_gateway::LotFilter;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Orders below this notional are bumped up to the next lot step.
pub const MIN_NOTIONAL_USDT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Base allocation percent for a trader, modulated by its running win-lose
/// result and clamped to the configured band.
pub fn dynamic_allocation_pct(sizing: &SizingConfig, win_lose_res: i32) -> Decimal {
    let x = sizing.equity_per_single_pos + Decimal::from(win_lose_res) * sizing.incr_decr_perc;
    x.clamp(sizing.min_pos_size_perc, sizing.max_pos_size_perc)
}

/// Contract quantity for a USDT budget at the given entry price and leverage.
pub fn entry_quantity(usdt_budget: Decimal, entry_price: Decimal, leverage: u32) -> Decimal {
    if entry_price.is_zero() {
        return Decimal::ZERO;
    }
    usdt_budget / entry_price * Decimal::from(leverage)
}

/// Margin a position consumes when opened.
pub fn margin_requirement(entry_price: Decimal, amount: Decimal, leverage: u32) -> Decimal {
    entry_price * amount / Decimal::from(leverage.max(1))
}

/// Snap an entry quantity to the symbol's lot step: round to the nearer
/// multiple with ties going up, clamp to the minimum quantity, and round up
/// whenever the resulting notional would fall below the exchange minimum.
pub fn snap_entry_amount(raw: Decimal, filter: &LotFilter, entry_price: Decimal) -> Decimal {
    if filter.step_size.is_zero() {
        return raw;
    }
    let steps = raw / filter.step_size;
    let floor_value = steps.floor() * filter.step_size;
    let ceil_value = steps.ceil() * filter.step_size;

    let mut corrected = if (ceil_value - raw) <= (raw - floor_value) {
        ceil_value
    } else {
        floor_value
    };

    if corrected < filter.min_qty {
        corrected = filter.min_qty;
    }
    if corrected * entry_price < MIN_NOTIONAL_USDT {
        corrected = ceil_value;
    }
    corrected
}

/// Snap a quantity-to-close down to the lot step, never exceeding the held
/// amount.
pub fn snap_close_amount(raw: Decimal, step_size: Decimal, held: Decimal) -> Decimal {
    if step_size.is_zero() {
        return raw.min(held);
    }
    let floored = (raw / step_size).floor() * step_size;
    floored.min(held)
}

/// Balance weights for multi-copy mode.
#[derive(Debug, Clone)]
pub struct KellyAllocation {
    /// `min(1, Σ KC)` over the admitted traders.
    pub total_kc: Decimal,
    /// Per-trader share: the raw KC when the sum stays within 1, otherwise
    /// normalized by the sum.
    pub shares: HashMap<String, Decimal>,
}

pub fn kelly_allocation(kc: &HashMap<String, Decimal>, admitted: &[String]) -> KellyAllocation {
    let sum: Decimal = admitted
        .iter()
        .filter_map(|t| kc.get(t))
        .copied()
        .sum();

    let mut shares = HashMap::new();
    for trader in admitted {
        let value = kc.get(trader).copied().unwrap_or_default();
        let share = if sum > Decimal::ONE && !sum.is_zero() {
            value / sum
        } else {
            value
        };
        shares.insert(trader.clone(), share);
    }

    KellyAllocation {
        total_kc: sum.min(Decimal::ONE),
        shares,
    }
}

/// Fraction of the tradable balance granted to the single-copy trader:
/// its Kelly criterion divided by its penalty, capped at 1.
pub fn single_copy_fraction(kelly: Decimal, penalty: Option<i64>) -> Decimal {
    let penalized = match penalty {
        Some(p) if p > 0 => kelly / Decimal::from(p),
        _ => kelly,
    };
    penalized.min(Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing() -> SizingConfig {
        SizingConfig {
            equity_of_total_equity: Decimal::new(90, 0),
            equity_per_single_pos: Decimal::new(5, 0),
            incr_decr_perc: Decimal::new(5, 1),
            max_pos_size_perc: Decimal::new(10, 0),
            min_pos_size_perc: Decimal::new(1, 0),
        }
    }

    fn lot(step: Decimal, min_qty: Decimal) -> LotFilter {
        LotFilter {
            min_qty,
            step_size: step,
        }
    }

    #[test]
    fn test_base_allocation_unmodified_at_zero_win_lose() {
        assert_eq!(dynamic_allocation_pct(&sizing(), 0), Decimal::new(5, 0));
    }

    #[test]
    fn test_allocation_clamps_to_band() {
        // 5 + 20 * 0.5 = 15 -> clamped to 10.
        assert_eq!(dynamic_allocation_pct(&sizing(), 20), Decimal::new(10, 0));
        // 5 - 20 * 0.5 = -5 -> clamped to 1.
        assert_eq!(dynamic_allocation_pct(&sizing(), -20), Decimal::new(1, 0));
    }

    #[test]
    fn test_new_admission_sizing_example() {
        // 10 000 USDT equity, 90% tradable, 5% base, win-lose 0:
        // 9 000 * 5% = 450 USDT; (450 / 24) * 5 = 93.75; step 0.1 -> 93.8.
        let budget = Decimal::new(9_000, 0) * dynamic_allocation_pct(&sizing(), 0)
            / Decimal::ONE_HUNDRED;
        assert_eq!(budget, Decimal::new(450, 0));

        let raw = entry_quantity(budget, Decimal::new(24, 0), 5);
        assert_eq!(raw, Decimal::new(9_375, 2));

        let snapped = snap_entry_amount(
            raw,
            &lot(Decimal::new(1, 1), Decimal::new(1, 1)),
            Decimal::new(24, 0),
        );
        assert_eq!(snapped, Decimal::new(938, 1));
    }

    #[test]
    fn test_snap_rounds_to_nearer_multiple() {
        let filter = lot(Decimal::new(1, 1), Decimal::new(1, 1));
        let price = Decimal::new(100, 0);
        assert_eq!(
            snap_entry_amount(Decimal::new(9_372, 2), &filter, price),
            Decimal::new(937, 1)
        );
        assert_eq!(
            snap_entry_amount(Decimal::new(9_378, 2), &filter, price),
            Decimal::new(938, 1)
        );
    }

    #[test]
    fn test_snap_tie_breaks_upward() {
        let filter = lot(Decimal::new(1, 1), Decimal::new(1, 1));
        assert_eq!(
            snap_entry_amount(Decimal::new(9_375, 2), &filter, Decimal::new(100, 0)),
            Decimal::new(938, 1)
        );
    }

    #[test]
    fn test_snap_enforces_min_qty() {
        let filter = lot(Decimal::new(1, 1), Decimal::new(5, 1));
        assert_eq!(
            snap_entry_amount(Decimal::new(2, 1), &filter, Decimal::new(100, 0)),
            Decimal::new(5, 1)
        );
    }

    #[test]
    fn test_snap_forces_up_below_min_notional() {
        // 0.44 at price 10 snaps down to 0.4 => 4 USDT < 5, so take the
        // ceiling step instead.
        let filter = lot(Decimal::new(1, 1), Decimal::new(1, 1));
        assert_eq!(
            snap_entry_amount(Decimal::new(44, 2), &filter, Decimal::new(10, 0)),
            Decimal::new(5, 1)
        );
    }

    #[test]
    fn test_leader_reduction_close_snapping() {
        // Leader 100 -> 60; user held 93.8, new amount 56.28, to close
        // 37.52 -> floored to 37.5.
        let held = Decimal::new(938, 1);
        let ratio = Decimal::new(60, 0) / Decimal::new(100, 0);
        let new_user = held * ratio;
        assert_eq!(new_user, Decimal::new(5_628, 2));

        let to_close = snap_close_amount(held - new_user, Decimal::new(1, 1), held);
        assert_eq!(to_close, Decimal::new(375, 1));
        assert_eq!(held - to_close, Decimal::new(563, 1));
    }

    #[test]
    fn test_close_amount_capped_at_held() {
        assert_eq!(
            snap_close_amount(Decimal::new(12, 0), Decimal::new(1, 1), Decimal::new(10, 0)),
            Decimal::new(10, 0)
        );
    }

    #[test]
    fn test_kelly_allocation_within_unit_sum() {
        let kc = HashMap::from([
            ("t1".to_string(), Decimal::new(8, 2)),
            ("t2".to_string(), Decimal::new(12, 2)),
        ]);
        let admitted = vec!["t1".to_string(), "t2".to_string()];
        let alloc = kelly_allocation(&kc, &admitted);
        assert_eq!(alloc.total_kc, Decimal::new(20, 2));
        assert_eq!(alloc.shares["t1"], Decimal::new(8, 2));
        assert_eq!(alloc.shares["t2"], Decimal::new(12, 2));
    }

    #[test]
    fn test_kelly_allocation_normalizes_above_one() {
        let kc = HashMap::from([
            ("t1".to_string(), Decimal::new(9, 1)),
            ("t2".to_string(), Decimal::new(9, 1)),
        ]);
        let admitted = vec!["t1".to_string(), "t2".to_string()];
        let alloc = kelly_allocation(&kc, &admitted);
        assert_eq!(alloc.total_kc, Decimal::ONE);
        assert_eq!(alloc.shares["t1"], Decimal::new(5, 1));
    }

    #[test]
    fn test_single_copy_fraction_applies_penalty_then_cap() {
        assert_eq!(
            single_copy_fraction(Decimal::new(8, 2), Some(2)),
            Decimal::new(4, 2)
        );
        assert_eq!(single_copy_fraction(Decimal::new(3, 0), Some(2)), Decimal::ONE);
        assert_eq!(
            single_copy_fraction(Decimal::new(8, 2), None),
            Decimal::new(8, 2)
        );
    }

    #[test]
    fn test_margin_requirement() {
        assert_eq!(
            margin_requirement(Decimal::new(24, 0), Decimal::new(938, 1), 5),
            Decimal::new(45_024, 2)
        );
    }
}
