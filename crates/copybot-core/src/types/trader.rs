//! Lead trader identity and per-trader statistics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A lead trader from the leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub trader_id: String,
    pub nickname: Option<String>,
    pub aum: Option<Decimal>,
    pub follow_pnl: Option<Decimal>,
    pub follower_count: Option<i32>,
    pub win_ratio: Option<Decimal>,
    /// Total ROI as reported by the leaderboard.
    pub yield_ratio: Option<Decimal>,
    /// The symbol the trader predominantly trades, when reported.
    pub symbol: Option<String>,
    pub is_init: bool,
    pub is_followed: bool,
    pub is_observed: bool,
    /// When the trader last opened a position we mirrored.
    pub last_pos_at: Option<DateTime<Utc>>,
}

/// How the engine currently relates to a trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderKind {
    /// Passed the follower filter on the latest leaderboard refresh.
    Followed,
    /// Dropped from the leaderboard but retained with read-only attention.
    Observed,
}

/// ROI figures per timeframe for one trader. Missing values read as `None`;
/// the filter distinguishes missing from non-positive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoiWindows {
    pub daily: Option<Decimal>,
    pub weekly: Option<Decimal>,
    pub monthly: Option<Decimal>,
    pub total: Option<Decimal>,
}

/// Running win/lose counters per (trader, instance); drives the dynamic
/// position-size modifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessStats {
    pub trader_id: String,
    pub is_active: bool,
    pub win_count: i32,
    pub lose_count: i32,
}

impl SuccessStats {
    pub fn win_lose_res(&self) -> i32 {
        self.win_count - self.lose_count
    }

    pub fn win_rate(&self) -> Option<Decimal> {
        let total = self.win_count + self.lose_count;
        if total == 0 {
            None
        } else {
            Some(Decimal::from(self.win_count) / Decimal::from(total))
        }
    }
}

/// Kelly-criterion aggregates over a trader's closed mirrored trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KcStats {
    pub trader_id: String,
    pub trades_count: i64,
    pub roe_sum: Option<Decimal>,
    pub avg_roe: Option<Decimal>,
    pub roe_std_dev: Option<Decimal>,
    /// `avg_roe / roe_std_dev^2`, null when the variance is zero.
    pub kelly: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_lose_res() {
        let stats = SuccessStats {
            trader_id: "t".into(),
            is_active: true,
            win_count: 7,
            lose_count: 4,
        };
        assert_eq!(stats.win_lose_res(), 3);
        assert_eq!(stats.win_rate(), Some(Decimal::new(7, 0) / Decimal::new(11, 0)));
    }

    #[test]
    fn test_win_rate_empty() {
        let stats = SuccessStats {
            trader_id: "t".into(),
            is_active: true,
            win_count: 0,
            lose_count: 0,
        };
        assert_eq!(stats.win_rate(), None);
    }
}
