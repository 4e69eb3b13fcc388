//! Database operations for stop-loss and take-profit trigger orders.

use crate::types::{Instance, Side, TriggerKind, TriggerOrder};
use crate::Result;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::debug;

pub struct TriggerOrderRepository {
    pool: PgPool,
    position_table: String,
}

impl TriggerOrderRepository {
    pub fn new(pool: PgPool, instance: Instance) -> Self {
        Self {
            pool,
            position_table: instance.position_table(),
        }
    }

    /// All active triggers of one kind for this instance, keyed by the
    /// upstream position id they protect.
    pub async fn active_by_position(
        &self,
        kind: TriggerKind,
    ) -> Result<HashMap<i64, TriggerOrder>> {
        let rows = sqlx::query(
            r#"
            SELECT id, position_table, upstream_position_id, kind, order_id,
                   symbol, side, price, amount, is_active, is_filled
            FROM trigger_orders
            WHERE position_table = $1 AND kind = $2 AND is_active
            "#,
        )
        .bind(&self.position_table)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let order = Self::row_to_order(r);
                (order.upstream_position_id, order)
            })
            .collect())
    }

    /// Latest trigger row of one kind per position, active or not. Inactive
    /// rows are re-armed in place rather than re-inserted.
    pub async fn latest_by_position(
        &self,
        kind: TriggerKind,
    ) -> Result<HashMap<i64, TriggerOrder>> {
        let rows = sqlx::query(
            r#"
            SELECT id, position_table, upstream_position_id, kind, order_id,
                   symbol, side, price, amount, is_active, is_filled
            FROM trigger_orders
            WHERE position_table = $1 AND kind = $2 AND NOT is_filled
            "#,
        )
        .bind(&self.position_table)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let order = Self::row_to_order(r);
                (order.upstream_position_id, order)
            })
            .collect())
    }

    pub async fn insert(
        &self,
        upstream_position_id: i64,
        kind: TriggerKind,
        order_id: &str,
        symbol: &str,
        side: Side,
        price: Decimal,
        amount: Decimal,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO trigger_orders (
                position_table, upstream_position_id, kind, order_id, symbol,
                side, price, amount, is_active, is_filled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, FALSE)
            RETURNING id
            "#,
        )
        .bind(&self.position_table)
        .bind(upstream_position_id)
        .bind(kind.as_str())
        .bind(order_id)
        .bind(symbol)
        .bind(side.as_str())
        .bind(price)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.get("id");
        debug!(id, upstream_position_id, kind = kind.as_str(), "Inserted trigger order");
        Ok(id)
    }

    /// Re-arm an existing row after a cancel-and-re-create (or a plain
    /// re-create when the previous trigger had gone inactive).
    pub async fn rearm(
        &self,
        id: i64,
        order_id: &str,
        price: Decimal,
        amount: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trigger_orders
            SET order_id = $2, price = $3, amount = $4, is_active = TRUE
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(order_id)
        .bind(price)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE trigger_orders SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a trigger filled by its exchange order id.
    pub async fn mark_filled_by_order(&self, order_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trigger_orders
            SET is_active = FALSE, is_filled = TRUE
            WHERE position_table = $1 AND order_id = $2
            "#,
        )
        .bind(&self.position_table)
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_order(r: &sqlx::postgres::PgRow) -> TriggerOrder {
        TriggerOrder {
            id: r.get("id"),
            position_table: r.get("position_table"),
            upstream_position_id: r.get("upstream_position_id"),
            kind: TriggerKind::from_db(r.get::<String, _>("kind").as_str()),
            order_id: r.get("order_id"),
            symbol: r.get("symbol"),
            side: Side::from_db(r.get::<String, _>("side").as_str()),
            price: r.get("price"),
            amount: r.get("amount"),
            is_active: r.get("is_active"),
            is_filled: r.get("is_filled"),
        }
    }
}
