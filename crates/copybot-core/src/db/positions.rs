//! Database operations for one instance's mirrored positions.

use crate::types::{IgnoreReason, Instance, MirroredPosition, Side};
use crate::Result;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::debug;

const SELECT_COLUMNS: &str = r#"
    upstream_id, order_id, trader_id, symbol, side, leverage, entry_price,
    mark_price, upstream_amount, user_amount, pnl, roe, liquidation_price,
    open_time_ms, updated_time_ms, inserted_at_ms, is_active, is_copied,
    is_filled, is_canceled, is_closed, is_ignored, ignore_reason
"#;

/// Repository for the `position_{instance}` table.
pub struct PositionRepository {
    pool: PgPool,
    table: String,
}

impl PositionRepository {
    pub fn new(pool: PgPool, instance: Instance) -> Self {
        Self {
            pool,
            table: instance.position_table(),
        }
    }

    /// All active rows, oldest insertion first.
    pub async fn active(&self) -> Result<Vec<MirroredPosition>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} WHERE is_active ORDER BY inserted_at_ms ASC, upstream_id ASC",
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::row_to_position).collect())
    }

    /// Active rows grouped by trader, preserving insertion order.
    pub async fn active_by_trader(&self) -> Result<HashMap<String, Vec<MirroredPosition>>> {
        let mut grouped: HashMap<String, Vec<MirroredPosition>> = HashMap::new();
        for pos in self.active().await? {
            grouped.entry(pos.trader_id.clone()).or_default().push(pos);
        }
        Ok(grouped)
    }

    /// The earliest active, non-ignored row per symbol — the winners of the
    /// duplicate-symbol rule, used to pick the multi-copy trader set.
    pub async fn earliest_non_ignored_per_symbol(&self) -> Result<Vec<MirroredPosition>> {
        let sql = format!(
            r#"
            SELECT DISTINCT ON (symbol) {SELECT_COLUMNS}
            FROM {}
            WHERE is_active AND NOT is_ignored
            ORDER BY symbol, inserted_at_ms ASC, upstream_id ASC
            "#,
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::row_to_position).collect())
    }

    /// Closed-trade counts per trader over deactivated rows.
    pub async fn closed_trade_counts(&self) -> Result<HashMap<String, i64>> {
        let sql = format!(
            "SELECT trader_id, COUNT(*) AS trade_count FROM {} WHERE NOT is_active GROUP BY trader_id",
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("trader_id"), r.get("trade_count")))
            .collect())
    }

    pub async fn insert(&self, pos: &MirroredPosition) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                upstream_id, order_id, trader_id, symbol, side, leverage,
                entry_price, mark_price, upstream_amount, user_amount, pnl, roe,
                liquidation_price, open_time_ms, updated_time_ms, inserted_at_ms,
                is_active, is_copied, is_filled, is_canceled, is_closed,
                is_ignored, ignore_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            ON CONFLICT (upstream_id) DO NOTHING
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(pos.upstream_id)
            .bind(&pos.order_id)
            .bind(&pos.trader_id)
            .bind(&pos.symbol)
            .bind(pos.side.as_str())
            .bind(pos.leverage as i32)
            .bind(pos.entry_price)
            .bind(pos.mark_price)
            .bind(pos.upstream_amount)
            .bind(pos.user_amount)
            .bind(pos.pnl)
            .bind(pos.roe)
            .bind(pos.liquidation_price)
            .bind(pos.open_time_ms)
            .bind(pos.updated_time_ms)
            .bind(pos.inserted_at_ms)
            .bind(pos.is_active)
            .bind(pos.is_copied)
            .bind(pos.is_filled)
            .bind(pos.is_canceled)
            .bind(pos.is_closed)
            .bind(pos.ignore_reason.is_some())
            .bind(pos.ignore_reason.as_ref().map(|r| r.as_db_string()))
            .execute(&self.pool)
            .await?;

        debug!(upstream_id = pos.upstream_id, table = %self.table, "Inserted mirrored position");
        Ok(())
    }

    pub async fn mark_filled(&self, upstream_id: i64) -> Result<()> {
        let sql = format!("UPDATE {} SET is_filled = TRUE WHERE upstream_id = $1", self.table);
        sqlx::query(&sql).bind(upstream_id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn update_pnl_roe(
        &self,
        upstream_id: i64,
        pnl: Option<Decimal>,
        roe: Option<Decimal>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET pnl = $2, roe = $3 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(pnl)
            .bind(roe)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate(&self, upstream_id: i64) -> Result<()> {
        let sql = format!("UPDATE {} SET is_active = FALSE WHERE upstream_id = $1", self.table);
        sqlx::query(&sql).bind(upstream_id).execute(&self.pool).await?;
        debug!(upstream_id, table = %self.table, "Deactivated mirrored position");
        Ok(())
    }

    /// Record a successful entry order: copied, with the exchange order id.
    /// Also clears a cancel flag left by a rebalancing cancel-and-reopen.
    pub async fn mark_copied(&self, upstream_id: i64, order_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET is_copied = TRUE, is_canceled = FALSE, order_id = $2 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a confirmed cancel. Expired positions stay active until their
    /// upstream counterpart disappears; every other reason deactivates.
    pub async fn mark_canceled(
        &self,
        upstream_id: i64,
        reason: Option<&IgnoreReason>,
    ) -> Result<()> {
        let keep_active = matches!(reason, Some(r) if !r.is_terminal());
        let sql = format!(
            r#"
            UPDATE {} SET
                is_canceled = TRUE,
                is_active = is_active AND $2,
                is_ignored = is_ignored OR $3,
                ignore_reason = COALESCE($4, ignore_reason)
            WHERE upstream_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(keep_active)
            .bind(reason.is_some())
            .bind(reason.map(|r| r.as_db_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a confirmed full close: the remaining user amount after the
    /// close and deactivation.
    pub async fn mark_closed(
        &self,
        upstream_id: i64,
        remaining_user_amount: Decimal,
        reason: Option<&IgnoreReason>,
    ) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {} SET
                is_closed = TRUE,
                is_active = FALSE,
                user_amount = $2,
                is_ignored = is_ignored OR $3,
                ignore_reason = COALESCE($4, ignore_reason)
            WHERE upstream_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(remaining_user_amount)
            .bind(reason.is_some())
            .bind(reason.map(|r| r.as_db_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Force-close after a triggered stop-loss or take-profit.
    pub async fn close_from_trigger(&self, upstream_id: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET is_closed = TRUE, is_active = FALSE, user_amount = 0 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql).bind(upstream_id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn set_ignored(&self, upstream_id: i64, reason: &IgnoreReason) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET is_ignored = TRUE, ignore_reason = $2 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(reason.as_db_string())
            .execute(&self.pool)
            .await?;
        debug!(upstream_id, reason = %reason, table = %self.table, "Ignored mirrored position");
        Ok(())
    }

    /// Persist a leader-side resize together with our own remaining amount.
    pub async fn update_amounts(
        &self,
        upstream_id: i64,
        upstream_amount: Decimal,
        user_amount: Decimal,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET upstream_amount = $2, user_amount = $3 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(upstream_amount)
            .bind(user_amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a leader size increase without adding to our position.
    pub async fn set_upstream_amount(&self, upstream_id: i64, amount: Decimal) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET upstream_amount = $2 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_user_amount(&self, upstream_id: i64, amount: Decimal) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET user_amount = $2 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_entry(&self, upstream_id: i64, entry_price: Decimal, user_amount: Decimal) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET entry_price = $2, user_amount = $3 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(entry_price)
            .bind(user_amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_canceled_flag(&self, upstream_id: i64) -> Result<()> {
        let sql = format!("UPDATE {} SET is_canceled = TRUE WHERE upstream_id = $1", self.table);
        sqlx::query(&sql).bind(upstream_id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn update_liquidation_price(
        &self,
        upstream_id: i64,
        price: Option<Decimal>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET liquidation_price = $2 WHERE upstream_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(upstream_id)
            .bind(price)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn trader_of(&self, upstream_id: i64) -> Result<Option<String>> {
        let sql = format!("SELECT trader_id FROM {} WHERE upstream_id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("trader_id")))
    }

    fn row_to_position(r: &sqlx::postgres::PgRow) -> MirroredPosition {
        let is_ignored: bool = r.get("is_ignored");
        let ignore_reason = if is_ignored {
            r.get::<Option<String>, _>("ignore_reason")
                .as_deref()
                .and_then(IgnoreReason::from_db)
        } else {
            None
        };

        MirroredPosition {
            upstream_id: r.get("upstream_id"),
            order_id: r.get("order_id"),
            trader_id: r.get("trader_id"),
            symbol: r.get("symbol"),
            side: Side::from_db(r.get::<String, _>("side").as_str()),
            leverage: r.get::<i32, _>("leverage").max(1) as u32,
            entry_price: r.get("entry_price"),
            mark_price: r.get("mark_price"),
            upstream_amount: r.get("upstream_amount"),
            user_amount: r.get("user_amount"),
            pnl: r.get("pnl"),
            roe: r.get("roe"),
            liquidation_price: r.get("liquidation_price"),
            open_time_ms: r.get("open_time_ms"),
            updated_time_ms: r.get("updated_time_ms"),
            inserted_at_ms: r.get("inserted_at_ms"),
            is_active: r.get("is_active"),
            is_copied: r.get("is_copied"),
            is_filled: r.get("is_filled"),
            is_canceled: r.get("is_canceled"),
            is_closed: r.get("is_closed"),
            ignore_reason,
        }
    }
}
