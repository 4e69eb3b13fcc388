//! Read access to the shared trader, trader-stats and upstream temp tables.
//!
//! These tables are written by the leaderboard observer; the engine only
//! reads them.

use crate::types::{RoiWindows, Side, Trader, TraderKind, UpstreamPosition};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

pub struct TraderRepository {
    pool: PgPool,
}

impl TraderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Trader ids currently followed or observed.
    pub async fn followed_or_observed_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT trader_id FROM trader WHERE is_followed OR is_observed")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("trader_id")).collect())
    }

    pub async fn get(&self, trader_id: &str) -> Result<Option<Trader>> {
        let row = sqlx::query(
            r#"
            SELECT trader_id, nickname, aum, follow_pnl, follower_count,
                   win_ratio, yield_ratio, symbol, is_init, is_followed,
                   is_observed, last_pos_at
            FROM trader
            WHERE trader_id = $1
            "#,
        )
        .bind(trader_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Trader {
            trader_id: r.get("trader_id"),
            nickname: r.get("nickname"),
            aum: r.get("aum"),
            follow_pnl: r.get("follow_pnl"),
            follower_count: r.get("follower_count"),
            win_ratio: r.get("win_ratio"),
            yield_ratio: r.get("yield_ratio"),
            symbol: r.get("symbol"),
            is_init: r.get("is_init"),
            is_followed: r.get("is_followed"),
            is_observed: r.get("is_observed"),
            last_pos_at: r.get("last_pos_at"),
        }))
    }

    /// How the engine relates to a trader right now. Observation wins over
    /// following when both flags are set.
    pub async fn trader_kind(&self, trader_id: &str) -> Result<Option<TraderKind>> {
        Ok(self.get(trader_id).await?.and_then(|t| {
            if t.is_observed {
                Some(TraderKind::Observed)
            } else if t.is_followed {
                Some(TraderKind::Followed)
            } else {
                None
            }
        }))
    }

    pub async fn trader_kinds(&self, trader_ids: &[String]) -> Result<HashMap<String, TraderKind>> {
        let mut kinds = HashMap::new();
        for trader_id in trader_ids {
            if let Some(kind) = self.trader_kind(trader_id).await? {
                kinds.insert(trader_id.clone(), kind);
            }
        }
        Ok(kinds)
    }

    /// ROI per timeframe for the given traders. Total ROI comes from the
    /// trader row; daily/weekly/monthly from the per-window stats
    /// (date ranges 1, 7 and 30).
    pub async fn rois_for(&self, trader_ids: &[String]) -> Result<HashMap<String, RoiWindows>> {
        if trader_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut rois: HashMap<String, RoiWindows> = HashMap::new();

        let rows = sqlx::query("SELECT trader_id, yield_ratio FROM trader WHERE trader_id = ANY($1)")
            .bind(trader_ids)
            .fetch_all(&self.pool)
            .await?;
        for r in &rows {
            let entry = rois.entry(r.get("trader_id")).or_default();
            entry.total = r.get("yield_ratio");
        }

        let rows = sqlx::query(
            r#"
            SELECT trader_id, date_range, yield_ratio
            FROM trader_stats
            WHERE trader_id = ANY($1) AND date_range IN (1, 7, 30)
            "#,
        )
        .bind(trader_ids)
        .fetch_all(&self.pool)
        .await?;
        for r in &rows {
            let entry = rois.entry(r.get("trader_id")).or_default();
            match r.get::<i32, _>("date_range") {
                1 => entry.daily = r.get("yield_ratio"),
                7 => entry.weekly = r.get("yield_ratio"),
                30 => entry.monthly = r.get("yield_ratio"),
                _ => {}
            }
        }

        Ok(rois)
    }

    /// Stamp when a trader last opened a position we started mirroring.
    pub async fn update_last_pos_at(&self, trader_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE trader SET last_pos_at = $2 WHERE trader_id = $1")
            .bind(trader_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The current upstream positions of every followed or observed trader,
    /// grouped by trader id.
    pub async fn upstream_positions(&self) -> Result<HashMap<String, Vec<UpstreamPosition>>> {
        let rows = sqlx::query(
            r#"
            SELECT p.upstream_id, p.trader_id, p.symbol, p.side, p.leverage,
                   p.entry_price, p.mark_price, p.amount, p.pnl, p.roe,
                   p.open_time_ms, p.updated_time_ms
            FROM position_temp p
            JOIN trader t ON t.trader_id = p.trader_id
            WHERE t.is_followed OR t.is_observed
            ORDER BY p.updated_time_ms ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<UpstreamPosition>> = HashMap::new();
        for r in &rows {
            let pos = UpstreamPosition {
                upstream_id: r.get("upstream_id"),
                trader_id: r.get("trader_id"),
                symbol: r.get("symbol"),
                side: Side::from_db(r.get::<String, _>("side").as_str()),
                leverage: r.get::<i32, _>("leverage").max(1) as u32,
                entry_price: r.get("entry_price"),
                mark_price: r.get("mark_price"),
                amount: r.get("amount"),
                pnl: r.get("pnl"),
                roe: r.get("roe"),
                open_time_ms: r.get("open_time_ms"),
                updated_time_ms: r.get("updated_time_ms"),
            };
            grouped.entry(pos.trader_id.clone()).or_default().push(pos);
        }

        Ok(grouped)
    }
}
