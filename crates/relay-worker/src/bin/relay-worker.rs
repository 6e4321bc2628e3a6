//! Worker runner: loads configuration, opens the pool, applies
//! migrations, starts workers and reply routers for the configured
//! domains, and waits for ctrl-c.
//!
//! Exit code 0 on graceful shutdown, nonzero on initialization failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_shared::models::CommandEnvelope;
use relay_shared::RelayConfig;
use relay_worker::runtime::connect_pool;
use relay_worker::{
    CommandHandler, HandlerContext, HandlerError, HandlerRegistry, ProcessManagerRegistry,
    WorkerRuntime,
};

#[derive(Debug, Parser)]
#[command(name = "relay-worker", version, about = "Run relay command-bus workers")]
struct Args {
    /// Path to the TOML configuration file (env vars with the RELAY__
    /// prefix override it).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Domain to run workers for; repeatable. Overrides the config file.
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Register the built-in Echo handler for each domain (smoke tests
    /// and load drills).
    #[arg(long)]
    echo: bool,
}

/// Smoke-test handler: completes with the command's own payload.
struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    async fn handle(
        &self,
        command: CommandEnvelope,
        _ctx: HandlerContext,
    ) -> Result<Value, HandlerError> {
        Ok(command.data)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config =
        RelayConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if !args.domains.is_empty() {
        config.domains = args.domains.clone();
    }
    if config.domains.is_empty() {
        bail!("no domains configured; pass --domain or set `domains` in the config file");
    }

    let pool = connect_pool(&config)
        .await
        .context("failed to open database pool")?;
    relay_shared::MIGRATOR
        .run(&pool)
        .await
        .context("failed to apply migrations")?;

    let mut registry = HandlerRegistry::new();
    if args.echo {
        for domain in &config.domains {
            registry.register(domain, "Echo", Arc::new(EchoHandler));
        }
    }
    if registry.is_empty() {
        warn!(
            "no handlers registered; commands will retry until exhaustion and land in the \
             troubleshooting queue (use --echo for a smoke-test handler)"
        );
    }

    let managers = ProcessManagerRegistry::new();
    let mut runtime = WorkerRuntime::new(pool, config, Arc::new(registry), Arc::new(managers));
    runtime.start().await.context("failed to start runtime")?;

    info!("relay-worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    runtime.shutdown().await;
    Ok(())
}
