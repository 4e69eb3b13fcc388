//! Typed configuration with the recognised policy, sizing and credential keys.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

/// Top-level application configuration, loaded from `copybot.toml` plus
/// `COPYBOT_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub sizing: SizingConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Per-instance master switch and exchange credentials, keyed "x1".."x3".
    pub instances: HashMap<String, InstanceConfig>,
    /// Per-date-range trader admission thresholds used by the leaderboard
    /// observer, keyed by date range in days.
    #[serde(default)]
    pub filter_traders: HashMap<String, TraderFilterThresholds>,
    #[serde(default)]
    pub search_traders: SearchTradersConfig,
    /// Inter-cycle sleep in seconds.
    #[serde(default = "default_loop_delay_secs")]
    pub loop_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// The percent-of-equity sizing knobs of the Sizer.
#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    /// Share of total equity available to the engine, percent.
    pub equity_of_total_equity: Decimal,
    /// Base allocation per single position, percent of the tradable balance.
    pub equity_per_single_pos: Decimal,
    /// Step applied per win-lose point of the trader.
    pub incr_decr_perc: Decimal,
    pub max_pos_size_perc: Decimal,
    pub min_pos_size_perc: Decimal,
}

/// Copy-policy knobs: filter toggles, expiry, SL ratio and copy mode.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Fraction of the entry-to-liquidation distance at which the stop sits.
    pub sl_ratio: Decimal,
    #[serde(default)]
    pub copy_trader_by: CopyTraderBy,
    #[serde(default)]
    pub copy_mode: CopyMode,
    /// Unfilled-order expiry in seconds.
    pub max_time_to_fill: i64,
    #[serde(default)]
    pub ignore_neg_total_roi_traders: bool,
    #[serde(default)]
    pub ignore_neg_all_timeframes_roi_traders: bool,
    #[serde(default)]
    pub ignore_observed_traders: bool,
}

/// Ranking statistic used by the single-copy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CopyTraderBy {
    #[default]
    #[serde(rename = "KC")]
    KellyCriterion,
    #[serde(rename = "TC")]
    TradeCount,
}

/// How admitted positions are allocated balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// One trader at a time, chosen by the selector, budgeted by its Kelly
    /// criterion divided by its penalty.
    #[default]
    Single,
    /// All admitted traders, budgeted by normalized Kelly weights.
    Multi,
    /// Open every admitted position at its stored base size.
    Fixed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Master enable for copying on this instance.
    #[serde(default)]
    pub copy_positions: bool,
    pub exchange_api_key: String,
    pub exchange_api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Token-bucket rate applied across all concurrent exchange operations.
    #[serde(default = "default_ops_per_second")]
    pub ops_per_second: u32,
    /// Override for the exchange REST endpoint (testnets).
    pub base_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ops_per_second: default_ops_per_second(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

/// Minimum per-window trader statistics required to follow a trader. All
/// bounds are optional; a missing bound never rejects.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraderFilterThresholds {
    pub win_ratio: Option<Decimal>,
    pub yield_ratio: Option<Decimal>,
    pub current_follow_pnl: Option<Decimal>,
    pub profit_days: Option<i32>,
    pub loss_days: Option<i32>,
    pub profit_loss_days_diff: Option<i32>,
}

/// Upstream discovery parameters consumed by the leaderboard observer.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchTradersConfig {
    #[serde(default = "default_search_pages")]
    pub pages: u32,
    #[serde(default = "default_date_ranges")]
    pub date_ranges: Vec<u32>,
}

impl Default for SearchTradersConfig {
    fn default() -> Self {
        Self {
            pages: default_search_pages(),
            date_ranges: default_date_ranges(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_ops_per_second() -> u32 {
    10
}

fn default_loop_delay_secs() -> u64 {
    5
}

fn default_search_pages() -> u32 {
    3
}

fn default_date_ranges() -> Vec<u32> {
    vec![1, 7, 30]
}

impl Config {
    /// Load from the given file (without extension suffixing rules of the
    /// `config` crate) layered under `COPYBOT_*` environment variables.
    pub fn load(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let cfg: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("COPYBOT").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.sizing.min_pos_size_perc > self.sizing.max_pos_size_perc {
            return Err(Error::InvalidConfig(format!(
                "min_pos_size_perc {} exceeds max_pos_size_perc {}",
                self.sizing.min_pos_size_perc, self.sizing.max_pos_size_perc
            )));
        }
        if self.policy.sl_ratio <= Decimal::ZERO || self.policy.sl_ratio > Decimal::ONE {
            return Err(Error::InvalidConfig(format!(
                "sl_ratio {} out of (0, 1]",
                self.policy.sl_ratio
            )));
        }
        Ok(())
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.instances.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/copybot_test".into(),
                max_connections: 2,
            },
            sizing: SizingConfig {
                equity_of_total_equity: Decimal::new(90, 0),
                equity_per_single_pos: Decimal::new(5, 0),
                incr_decr_perc: Decimal::new(5, 1),
                max_pos_size_perc: Decimal::new(10, 0),
                min_pos_size_perc: Decimal::new(1, 0),
            },
            policy: PolicyConfig {
                sl_ratio: Decimal::new(5, 1),
                copy_trader_by: CopyTraderBy::KellyCriterion,
                copy_mode: CopyMode::Single,
                max_time_to_fill: 300,
                ignore_neg_total_roi_traders: true,
                ignore_neg_all_timeframes_roi_traders: false,
                ignore_observed_traders: true,
            },
            gateway: GatewayConfig::default(),
            alerts: AlertsConfig::default(),
            instances: HashMap::new(),
            filter_traders: HashMap::new(),
            search_traders: SearchTradersConfig::default(),
            loop_delay_secs: 5,
        }
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_size_band() {
        let mut cfg = base_config();
        cfg.sizing.min_pos_size_perc = Decimal::new(20, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sl_ratio_out_of_range() {
        let mut cfg = base_config();
        cfg.policy.sl_ratio = Decimal::new(15, 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_gateway_defaults() {
        let gw = GatewayConfig::default();
        assert_eq!(gw.ops_per_second, 10);
        assert!(gw.base_url.is_none());
    }
}
