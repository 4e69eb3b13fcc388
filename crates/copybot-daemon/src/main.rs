//! Copy-trading engine daemon
//!
//! Runs one mirror instance's control loop. Optionally seeds a fresh
//! instance by replicating another instance's position and KC tables.

use anyhow::{Context, Result};
use clap::Parser;
use copybot_core::config::Config;
use copybot_core::db;
use copybot_core::notify::Notifier;
use copybot_core::types::Instance;
use exchange_gateway::{Gateway, RestExchange};
use mirror_engine::Engine;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "copybot", about = "Leaderboard copy-trading engine")]
struct Args {
    /// Mirror instance to run (x1, x2 or x3).
    instance: Instance,

    /// Seed this instance's tables from another instance before starting.
    instance_to_replicate: Option<Instance>,

    /// Configuration file.
    #[arg(long, default_value = "copybot")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "copybot=info,mirror_engine=info,copybot_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "Fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!(instance = %args.instance, "Starting copy-trading engine");

    let cfg = Config::load(&args.config).context("loading configuration")?;
    let instance_cfg = cfg
        .instance(args.instance.as_str())
        .with_context(|| format!("no configuration for instance {}", args.instance))?
        .clone();

    let pool = db::create_pool(&cfg.database)
        .await
        .context("connecting to database")?;
    db::run_migrations(&pool).await.context("running migrations")?;
    db::ensure_instance_tables(&pool, args.instance)
        .await
        .context("creating instance tables")?;

    if let Some(source) = args.instance_to_replicate {
        info!(from = %source, to = %args.instance, "Replicating instance tables");
        db::replicate_instance(&pool, source, args.instance)
            .await
            .context("replicating instance")?;
    }

    let exchange = RestExchange::new(
        instance_cfg.exchange_api_key,
        instance_cfg.exchange_api_secret,
        cfg.gateway.base_url.clone(),
    );
    let gateway = Gateway::new(Arc::new(exchange), cfg.gateway.ops_per_second);
    let notifier = Notifier::new(&cfg.alerts);

    let mut engine = Engine::new(
        args.instance,
        args.config,
        db::PositionRepository::new(pool.clone(), args.instance),
        db::TraderRepository::new(pool.clone()),
        db::StatsRepository::new(pool.clone(), args.instance),
        db::TriggerOrderRepository::new(pool, args.instance),
        gateway,
        notifier,
    );
    engine.run().await
}
