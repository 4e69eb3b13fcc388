//! Success counters, Kelly-criterion aggregates and stop-loss penalties for
//! one instance.

use crate::types::{Instance, KcStats, SuccessStats};
use crate::Result;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::debug;

pub struct StatsRepository {
    pool: PgPool,
    position_table: String,
    kc_table: String,
}

impl StatsRepository {
    pub fn new(pool: PgPool, instance: Instance) -> Self {
        Self {
            pool,
            position_table: instance.position_table(),
            kc_table: instance.kc_table(),
        }
    }

    // Success stats

    pub async fn all_success(&self) -> Result<HashMap<String, SuccessStats>> {
        let rows = sqlx::query(
            "SELECT trader_id, is_active, win_count, lose_count FROM success_stats WHERE position_table = $1",
        )
        .bind(&self.position_table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let stats = SuccessStats {
                    trader_id: r.get("trader_id"),
                    is_active: r.get("is_active"),
                    win_count: r.get("win_count"),
                    lose_count: r.get("lose_count"),
                };
                (stats.trader_id.clone(), stats)
            })
            .collect())
    }

    /// Insert the trader as active, or re-activate an inactive row resetting
    /// its counters.
    pub async fn ensure_success_active(&self, trader_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO success_stats (trader_id, position_table, is_active, win_count, lose_count)
            VALUES ($1, $2, TRUE, 0, 0)
            ON CONFLICT (trader_id, position_table) DO UPDATE SET
                is_active = TRUE,
                win_count = CASE WHEN success_stats.is_active THEN success_stats.win_count ELSE 0 END,
                lose_count = CASE WHEN success_stats.is_active THEN success_stats.lose_count ELSE 0 END,
                updated_on = NOW()
            "#,
        )
        .bind(trader_id)
        .bind(&self.position_table)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_result(&self, trader_id: &str, is_win: bool) -> Result<()> {
        self.ensure_success_active(trader_id).await?;
        let column = if is_win { "win_count" } else { "lose_count" };
        let sql = format!(
            "UPDATE success_stats SET {column} = {column} + 1, updated_on = NOW() WHERE trader_id = $1 AND position_table = $2"
        );
        sqlx::query(&sql)
            .bind(trader_id)
            .bind(&self.position_table)
            .execute(&self.pool)
            .await?;
        debug!(trader_id, is_win, "Recorded position outcome");
        Ok(())
    }

    /// Align the active success-stats set with the currently followed or
    /// observed traders: deactivate dropped traders, (re)activate the rest.
    pub async fn sync_success_active_set(&self, trader_ids: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE success_stats SET is_active = FALSE, updated_on = NOW()
            WHERE position_table = $1 AND is_active AND trader_id != ALL($2)
            "#,
        )
        .bind(&self.position_table)
        .bind(trader_ids)
        .execute(&self.pool)
        .await?;

        for trader_id in trader_ids {
            self.ensure_success_active(trader_id).await?;
        }
        Ok(())
    }

    // Kelly-criterion stats

    /// Recompute per-trader KC aggregates from closed positions no older than
    /// `cutoff_ms`, upserting into the instance's KC table. Population
    /// standard deviation, so a trader's variance is over exactly its closed
    /// trades.
    pub async fn recompute_kc(&self, cutoff_ms: i64) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {kc} (trader_id, trades_count, roe_sum, avg_roe, roe_std_dev, kelly_criterion)
            SELECT
                trader_id,
                COUNT(*) AS trades_count,
                SUM(roe) AS roe_sum,
                AVG(roe) AS avg_roe,
                STDDEV_POP(roe) AS roe_std_dev,
                AVG(roe) / NULLIF(STDDEV_POP(roe) * STDDEV_POP(roe), 0) AS kelly_criterion
            FROM {pos}
            WHERE NOT is_active AND updated_time_ms >= $1
            GROUP BY trader_id
            ON CONFLICT (trader_id) DO UPDATE SET
                trades_count = EXCLUDED.trades_count,
                roe_sum = EXCLUDED.roe_sum,
                avg_roe = EXCLUDED.avg_roe,
                roe_std_dev = EXCLUDED.roe_std_dev,
                kelly_criterion = EXCLUDED.kelly_criterion
            "#,
            kc = self.kc_table,
            pos = self.position_table,
        );
        sqlx::query(&sql).bind(cutoff_ms).execute(&self.pool).await?;
        Ok(())
    }

    /// Kelly criterion per trader; traders with a null KC are omitted.
    pub async fn all_kc(&self) -> Result<HashMap<String, Decimal>> {
        let sql = format!(
            "SELECT trader_id, kelly_criterion FROM {} ORDER BY kelly_criterion DESC",
            self.kc_table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                r.get::<Option<Decimal>, _>("kelly_criterion")
                    .map(|kc| (r.get("trader_id"), kc))
            })
            .collect())
    }

    /// Closed-trade counts per trader from the KC table.
    pub async fn all_tc(&self) -> Result<HashMap<String, i64>> {
        let sql = format!(
            "SELECT trader_id, trades_count FROM {} ORDER BY trades_count DESC",
            self.kc_table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("trader_id"), r.get("trades_count")))
            .collect())
    }

    pub async fn kc_row(&self, trader_id: &str) -> Result<Option<KcStats>> {
        let sql = format!(
            "SELECT trader_id, trades_count, roe_sum, avg_roe, roe_std_dev, kelly_criterion FROM {} WHERE trader_id = $1",
            self.kc_table
        );
        let row = sqlx::query(&sql)
            .bind(trader_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| KcStats {
            trader_id: r.get("trader_id"),
            trades_count: r.get("trades_count"),
            roe_sum: r.get("roe_sum"),
            avg_roe: r.get("avg_roe"),
            roe_std_dev: r.get("roe_std_dev"),
            kelly: r.get("kelly_criterion"),
        }))
    }

    // Penalties

    /// Register a stop-loss hit: insert the penalty at 2, or double it.
    pub async fn bump_penalty(&self, trader_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO penalties (trader_id, position_table, penalty_kind, penalty_value)
            VALUES ($1, $2, 'sl', 2)
            ON CONFLICT (trader_id, position_table)
                DO UPDATE SET penalty_value = penalties.penalty_value * 2
            "#,
        )
        .bind(trader_id)
        .bind(&self.position_table)
        .execute(&self.pool)
        .await?;
        debug!(trader_id, "Bumped stop-loss penalty");
        Ok(())
    }

    pub async fn all_penalties(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT trader_id, penalty_value FROM penalties WHERE position_table = $1",
        )
        .bind(&self.position_table)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("trader_id"), r.get::<i32, _>("penalty_value") as i64))
            .collect())
    }
}
