//! The per-instance control loop: one reconciliation cycle per tick, with
//! consecutive-crash backoff and a three-strike halt.

use crate::copier::Copier;
use crate::reconciler::Reconciler;
use crate::sltp::SlTpManager;
use copybot_core::config::{Config, CopyMode};
use copybot_core::db::{
    PositionRepository, StatsRepository, TraderRepository, TriggerOrderRepository,
};
use copybot_core::notify::Notifier;
use copybot_core::types::{now_ms, Instance, TriggerKind};
use copybot_core::Error;
use exchange_gateway::Gateway;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_CONSECUTIVE_CRASHES: u32 = 3;
/// Cycle delay assumed until a configuration file has loaded once; matches
/// the configuration default.
const DEFAULT_LOOP_DELAY_SECS: u64 = 5;
/// Closed positions older than this no longer feed the KC aggregates.
const KC_LOOKBACK_MS: i64 = 365 * 24 * 60 * 60 * 1000;

pub struct Engine {
    instance: Instance,
    config_path: String,
    positions: PositionRepository,
    traders: TraderRepository,
    stats: StatsRepository,
    triggers: TriggerOrderRepository,
    gateway: Gateway,
    notifier: Notifier,
    first_run: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: Instance,
        config_path: String,
        positions: PositionRepository,
        traders: TraderRepository,
        stats: StatsRepository,
        triggers: TriggerOrderRepository,
        gateway: Gateway,
        notifier: Notifier,
    ) -> Self {
        Self {
            instance,
            config_path,
            positions,
            traders,
            stats,
            triggers,
            gateway,
            notifier,
            first_run: true,
        }
    }

    /// Run cycles until the consecutive-crash limit halts the loop. A halt
    /// is a clean exit; the next start reconciles from persistent state.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut crash_count: u32 = 0;
        // Base for both the normal inter-cycle sleep and the crash backoff
        // (crash_count * base * 4). Kept across iterations: when a crash is
        // the config load itself, the last successfully loaded delay still
        // applies, and only before any load has succeeded does the default
        // stand in.
        let mut base_delay_secs: u64 = DEFAULT_LOOP_DELAY_SECS;

        loop {
            // Reload so policy toggles and the master switch apply without a
            // restart.
            let outcome = match Config::load(&self.config_path) {
                Ok(cfg) => {
                    base_delay_secs = cfg.loop_delay_secs;
                    self.cycle(&cfg).await
                }
                Err(e) => Err(anyhow::Error::from(e)),
            };

            match outcome {
                Ok(()) => {
                    if crash_count > 0 {
                        crash_count = 0;
                        let msg = format!(
                            "Copy engine '{}' recovered after a crashed cycle.",
                            self.instance
                        );
                        info!("{msg}");
                        self.notifier.send(&msg).await;
                    }
                    tokio::time::sleep(Duration::from_secs(base_delay_secs)).await;
                }
                Err(e) => {
                    crash_count += 1;
                    error!(instance = %self.instance, crash_count, error = ?e, "Cycle crashed");

                    if crash_count >= MAX_CONSECUTIVE_CRASHES {
                        let msg = format!(
                            "Copy engine '{}' halted after {crash_count} consecutive crashes. Last error: {e}",
                            self.instance
                        );
                        self.notifier.send(&msg).await;
                        return Ok(());
                    }

                    let delay_secs = u64::from(crash_count) * base_delay_secs * 4;
                    let msg = format!(
                        "Copy engine '{}' crashed: {e}. Retrying in {delay_secs} seconds.",
                        self.instance
                    );
                    self.notifier.send(&msg).await;
                    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                }
            }
        }
    }

    /// One reconciliation cycle. Phases run sequentially; operations within
    /// a phase fan out through the gateway.
    async fn cycle(&mut self, cfg: &Config) -> anyhow::Result<()> {
        let reconciler = Reconciler {
            positions: &self.positions,
            traders: &self.traders,
            stats: &self.stats,
            gateway: &self.gateway,
            sizing: &cfg.sizing,
            policy: &cfg.policy,
        };
        let sltp = SlTpManager {
            positions: &self.positions,
            triggers: &self.triggers,
            stats: &self.stats,
            gateway: &self.gateway,
            sl_ratio: cfg.policy.sl_ratio,
        };

        reconciler.reflect_fills().await?;

        sltp.refresh_liquidation_prices().await?;
        sltp.reconcile_stop_losses().await?;
        sltp.reconcile_take_profits().await?;
        sltp.reflect_triggered(TriggerKind::StopLoss).await?;
        sltp.reflect_triggered(TriggerKind::TakeProfit).await?;

        let upstream = self.traders.upstream_positions().await?;
        let watched = self.traders.followed_or_observed_ids().await?;
        self.stats.sync_success_active_set(&watched).await?;

        reconciler.update_pnl_roe(&upstream).await?;
        reconciler.retire_disappeared(&upstream).await?;

        self.stats.recompute_kc(now_ms() - KC_LOOKBACK_MS).await?;

        reconciler.insert_new(&upstream, self.first_run).await?;
        reconciler.resolve_conflicts().await?;
        reconciler.resize_existing(&upstream).await?;

        let enabled = cfg
            .instance(self.instance.as_str())
            .map(|i| i.copy_positions)
            .unwrap_or(false);
        if enabled {
            let copier = Copier {
                positions: &self.positions,
                stats: &self.stats,
                gateway: &self.gateway,
                sizing: &cfg.sizing,
                policy: &cfg.policy,
            };
            let result = match cfg.policy.copy_mode {
                CopyMode::Fixed => copier.copy_fixed().await,
                CopyMode::Single => copier.copy_single(cfg.policy.copy_trader_by).await,
                CopyMode::Multi => copier.copy_multi().await,
            };
            // An invariant violation aborts only the decision phase; the
            // rest of the cycle stands and the loop keeps running.
            match result {
                Err(Error::Anomaly(msg)) => {
                    warn!(instance = %self.instance, "{msg}");
                    self.notifier
                        .send(&format!("Copy engine '{}': {msg}", self.instance))
                        .await;
                }
                other => other?,
            }
        } else {
            info!(instance = %self.instance, "Copying disabled by master switch");
        }

        self.first_run = false;
        Ok(())
    }
}
