//! Upstream and mirrored position records.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::order::Side;

/// ROI timeframe reported by the leaderboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiWindow {
    Daily,
    Weekly,
    Monthly,
    Total,
}

impl RoiWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoiWindow::Daily => "daily",
            RoiWindow::Weekly => "weekly",
            RoiWindow::Monthly => "monthly",
            RoiWindow::Total => "total",
        }
    }
}

/// Why a mirrored position was excluded from copying.
///
/// The reason is persisted as text; `as_db_string`/`from_db` keep the stored
/// form stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Everything observed on the process's first cycle is skipped.
    FirstRun,
    /// Trader is observed-only and observed traders are excluded.
    ObservedTrader,
    /// One or more ROI timeframes were non-positive.
    NegativeRoi(Vec<RoiWindow>),
    MissingTotalRoi,
    NegativeTotalRoi,
    /// Trader has fewer than the minimum number of closed trades.
    LowTradeCount,
    NegativeKelly,
    /// Same trader holds the opposite side of the same symbol.
    Hedged,
    /// Another active position already covers this symbol and side.
    DuplicateSymbol,
    LowerRoi,
    LowerWinLoseRes,
    /// Selector dropped this trader for one with a larger Kelly criterion.
    LowerKelly,
    /// Limit order stayed unfilled past the configured expiry.
    Expired,
    InsufficientFunds,
}

impl IgnoreReason {
    pub fn as_db_string(&self) -> String {
        match self {
            IgnoreReason::FirstRun => "first time run".to_string(),
            IgnoreReason::ObservedTrader => "ignore observed".to_string(),
            IgnoreReason::NegativeRoi(windows) => {
                let names: Vec<&str> = windows.iter().map(|w| w.as_str()).collect();
                format!("negative {} ROI", names.join(", "))
            }
            IgnoreReason::MissingTotalRoi => "missing total ROI".to_string(),
            IgnoreReason::NegativeTotalRoi => "negative total ROI".to_string(),
            IgnoreReason::LowTradeCount => "less than 30 trades".to_string(),
            IgnoreReason::NegativeKelly => "negative kc".to_string(),
            IgnoreReason::Hedged => "hedged".to_string(),
            IgnoreReason::DuplicateSymbol => "same symbol and side".to_string(),
            IgnoreReason::LowerRoi => "lower roi".to_string(),
            IgnoreReason::LowerWinLoseRes => "lower win lose res".to_string(),
            IgnoreReason::LowerKelly => "lower kc".to_string(),
            IgnoreReason::Expired => "expired".to_string(),
            IgnoreReason::InsufficientFunds => "insufficient funds".to_string(),
        }
    }

    pub fn from_db(s: &str) -> Option<IgnoreReason> {
        let reason = match s {
            "first time run" => IgnoreReason::FirstRun,
            "ignore observed" => IgnoreReason::ObservedTrader,
            "missing total ROI" => IgnoreReason::MissingTotalRoi,
            "negative total ROI" => IgnoreReason::NegativeTotalRoi,
            "less than 30 trades" => IgnoreReason::LowTradeCount,
            "negative kc" => IgnoreReason::NegativeKelly,
            "hedged" => IgnoreReason::Hedged,
            "same symbol and side" => IgnoreReason::DuplicateSymbol,
            "lower roi" => IgnoreReason::LowerRoi,
            "lower win lose res" => IgnoreReason::LowerWinLoseRes,
            "lower kc" => IgnoreReason::LowerKelly,
            "expired" => IgnoreReason::Expired,
            "insufficient funds" => IgnoreReason::InsufficientFunds,
            other => {
                let composite = other.strip_prefix("negative ")?.strip_suffix(" ROI")?;
                let mut windows = Vec::new();
                for name in composite.split(", ") {
                    match name {
                        "daily" => windows.push(RoiWindow::Daily),
                        "weekly" => windows.push(RoiWindow::Weekly),
                        "monthly" => windows.push(RoiWindow::Monthly),
                        "total" => windows.push(RoiWindow::Total),
                        _ => return None,
                    }
                }
                IgnoreReason::NegativeRoi(windows)
            }
        };
        Some(reason)
    }

    /// An expired position is still tracked until its cancel confirms; every
    /// other reason is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IgnoreReason::Expired)
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_db_string())
    }
}

/// A lead trader's open position as reported by the leaderboard feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamPosition {
    /// Venue-assigned position id.
    pub upstream_id: i64,
    pub trader_id: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
    /// The leader's position size.
    pub amount: Decimal,
    pub pnl: Option<Decimal>,
    pub roe: Option<Decimal>,
    pub open_time_ms: i64,
    pub updated_time_ms: i64,
}

/// A locally tracked position mirroring (or pending to mirror) an upstream
/// position on the target exchange. One row per upstream position id per
/// instance table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirroredPosition {
    /// Venue-assigned upstream position id; primary key of the instance table.
    pub upstream_id: i64,
    /// Order id on the local exchange, set once the entry order is placed.
    pub order_id: Option<String>,
    pub trader_id: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
    /// The leader's size, as last seen upstream.
    pub upstream_amount: Decimal,
    /// Our size on the local exchange.
    pub user_amount: Decimal,
    pub pnl: Option<Decimal>,
    pub roe: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
    pub open_time_ms: i64,
    pub updated_time_ms: i64,
    pub inserted_at_ms: i64,
    pub is_active: bool,
    pub is_copied: bool,
    pub is_filled: bool,
    pub is_canceled: bool,
    pub is_closed: bool,
    pub ignore_reason: Option<IgnoreReason>,
}

impl MirroredPosition {
    /// Build a fresh, not-yet-copied row from an upstream position.
    pub fn from_upstream(up: &UpstreamPosition, inserted_at_ms: i64) -> Self {
        Self {
            upstream_id: up.upstream_id,
            order_id: None,
            trader_id: up.trader_id.clone(),
            symbol: up.symbol.clone(),
            side: up.side,
            leverage: up.leverage,
            entry_price: up.entry_price,
            mark_price: up.mark_price,
            upstream_amount: up.amount,
            user_amount: Decimal::ZERO,
            pnl: up.pnl,
            roe: up.roe,
            liquidation_price: None,
            open_time_ms: up.open_time_ms,
            updated_time_ms: up.updated_time_ms,
            inserted_at_ms,
            is_active: true,
            is_copied: false,
            is_filled: false,
            is_canceled: false,
            is_closed: false,
            ignore_reason: None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore_reason.is_some()
    }

    /// Eligible for copy decisions: active, not ignored, not closed.
    pub fn is_copy_candidate(&self) -> bool {
        self.is_active && !self.is_ignored() && !self.is_closed
    }

    /// Age of the row in whole seconds.
    pub fn age_secs(&self, now_ms: i64) -> i64 {
        (now_ms - self.inserted_at_ms) / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_reason_round_trip() {
        let reasons = [
            IgnoreReason::FirstRun,
            IgnoreReason::ObservedTrader,
            IgnoreReason::MissingTotalRoi,
            IgnoreReason::NegativeTotalRoi,
            IgnoreReason::LowTradeCount,
            IgnoreReason::NegativeKelly,
            IgnoreReason::Hedged,
            IgnoreReason::DuplicateSymbol,
            IgnoreReason::LowerRoi,
            IgnoreReason::LowerWinLoseRes,
            IgnoreReason::LowerKelly,
            IgnoreReason::Expired,
            IgnoreReason::InsufficientFunds,
        ];
        for reason in reasons {
            let stored = reason.as_db_string();
            assert_eq!(IgnoreReason::from_db(&stored), Some(reason));
        }
    }

    #[test]
    fn test_composite_roi_reason() {
        let reason = IgnoreReason::NegativeRoi(vec![RoiWindow::Daily, RoiWindow::Monthly]);
        assert_eq!(reason.as_db_string(), "negative daily, monthly ROI");
        assert_eq!(
            IgnoreReason::from_db("negative daily, monthly ROI"),
            Some(reason)
        );
    }

    #[test]
    fn test_expired_is_not_terminal() {
        assert!(!IgnoreReason::Expired.is_terminal());
        assert!(IgnoreReason::Hedged.is_terminal());
    }

    #[test]
    fn test_position_age() {
        let up = UpstreamPosition {
            upstream_id: 1,
            trader_id: "t".into(),
            symbol: "BTCUSDT".into(),
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
        let pos = MirroredPosition::from_upstream(&up, 1_000_000);
        assert_eq!(pos.age_secs(1_031_000), 31);
        assert!(pos.is_copy_candidate());
    }
}
