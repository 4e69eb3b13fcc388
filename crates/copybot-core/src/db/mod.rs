//! Database access layer for PostgreSQL.

pub mod positions;
pub mod stats;
pub mod traders;
pub mod trigger_orders;

pub use positions::PositionRepository;
pub use stats::StatsRepository;
pub use traders::TraderRepository;
pub use trigger_orders::TriggerOrderRepository;

use crate::config::DatabaseConfig;
use crate::types::Instance;
use crate::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::info;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// Run shared-table migrations from the migrations directory.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(Path::new("./migrations")).await?;
    migrator.run(pool).await?;
    Ok(())
}

/// Create the per-instance position and KC tables when missing.
pub async fn ensure_instance_tables(pool: &PgPool, instance: Instance) -> Result<()> {
    let position_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            upstream_id BIGINT PRIMARY KEY,
            order_id TEXT,
            trader_id TEXT NOT NULL REFERENCES trader (trader_id),
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            leverage INT NOT NULL,
            entry_price NUMERIC NOT NULL,
            mark_price NUMERIC,
            upstream_amount NUMERIC NOT NULL,
            user_amount NUMERIC NOT NULL DEFAULT 0,
            pnl NUMERIC,
            roe NUMERIC,
            liquidation_price NUMERIC,
            open_time_ms BIGINT NOT NULL,
            updated_time_ms BIGINT NOT NULL,
            inserted_at_ms BIGINT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            is_copied BOOLEAN NOT NULL DEFAULT FALSE,
            is_filled BOOLEAN NOT NULL DEFAULT FALSE,
            is_canceled BOOLEAN NOT NULL DEFAULT FALSE,
            is_closed BOOLEAN NOT NULL DEFAULT FALSE,
            is_ignored BOOLEAN NOT NULL DEFAULT FALSE,
            ignore_reason TEXT
        )
        "#,
        instance.position_table()
    );
    sqlx::query(&position_ddl).execute(pool).await?;

    let kc_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            trader_id TEXT PRIMARY KEY,
            trades_count BIGINT NOT NULL,
            roe_sum NUMERIC,
            avg_roe NUMERIC,
            roe_std_dev NUMERIC,
            kelly_criterion NUMERIC
        )
        "#,
        instance.kc_table()
    );
    sqlx::query(&kc_ddl).execute(pool).await?;

    Ok(())
}

/// Copy the position and KC tables of `from` into `to`. Refuses to touch a
/// destination table that already holds rows.
pub async fn replicate_instance(pool: &PgPool, from: Instance, to: Instance) -> Result<()> {
    let pairs = [
        (from.position_table(), to.position_table()),
        (from.kc_table(), to.kc_table()),
    ];

    for (_, to_table) in &pairs {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS row_count FROM {to_table}"))
            .fetch_one(pool)
            .await?;
        let row_count: i64 = row.get("row_count");
        if row_count > 0 {
            return Err(Error::Replication(format!(
                "table {to_table} is not empty ({row_count} rows)"
            )));
        }
    }

    for (from_table, to_table) in &pairs {
        sqlx::query(&format!("INSERT INTO {to_table} SELECT * FROM {from_table}"))
            .execute(pool)
            .await?;
        info!(from = %from_table, to = %to_table, "Replicated instance table");
    }

    Ok(())
}
