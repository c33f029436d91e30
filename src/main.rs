//! adaptive-control: regime-aware policy and risk supervisor.
//!
//! Single-binary Tokio application that:
//! 1. Classifies the market regime from published features
//! 2. Switches the active trading policy with hysteresis
//! 3. Sizes incoming signals under Kelly and circuit-breaker limits
//! 4. Tracks signal outcomes and feeds them back into sizing

mod config;
mod feeds;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use common::clock::{SharedClock, SystemClock};
use orchestrator::{resolve_trades_dir, Collaborators, EventJournal, Orchestrator};

use crate::feeds::{JsonFeatureFeed, JsonlInbox};

/// Adaptive regime, policy, and risk control layer
#[derive(Parser)]
#[command(name = "adaptive-control", about = "Adaptive regime-aware trading control layer")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "ADAPTIVE_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Run one regime, risk, signal, and report pass, then exit.
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

const DEFAULT_LOG_FILTER: &str = "adaptive_control=info,orchestrator=info,risk_engine=info,\
policy_manager=info,regime_classifier=info,outcome_tracker=info,audit_store=info";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("adaptive-control starting up...");

    let cfg = config::load_config(&cli.config).context("loading configuration")?;
    info!(
        "Risk: equity={:.2}, daily_loss_limit={:.2}, max_consecutive_losses={}, max_drawdown={:.1}%",
        cfg.engine.risk.account_equity,
        cfg.engine.risk.daily_loss_limit,
        cfg.engine.risk.max_consecutive_losses,
        cfg.engine.risk.max_drawdown_pct * 100.0,
    );
    info!(
        "Feeds: {} | store: {} | reports: {}",
        cfg.feeds.dir, cfg.engine.storage.db_path, cfg.engine.orchestrator.report_dir
    );

    let clock: SharedClock = Arc::new(SystemClock);

    let journal_dir = resolve_trades_dir();
    let journal = match EventJournal::open(journal_dir.clone(), clock.clone()) {
        Ok(journal) => {
            info!("Event journal: {}", journal_dir.display());
            Some(journal.shared())
        }
        Err(e) => {
            warn!("Event journal disabled ({}): {}", journal_dir.display(), e);
            None
        }
    };

    let feed_dir = cfg.feeds.path();
    let collaborators = Collaborators {
        market: Arc::new(JsonFeatureFeed::new(&feed_dir)),
        signals: Arc::new(JsonlInbox::new(&feed_dir)),
        journal,
        store: None,
    };

    let orchestrator = Orchestrator::initialize(cfg.engine, collaborators, clock)
        .await
        .context("initializing orchestrator")?;

    if cli.once {
        let report = orchestrator.run_once().await;
        orchestrator.shutdown().await;
        let path = report.context("single pass failed")?;
        info!("Report written to {}", path.display());
        return Ok(());
    }

    orchestrator
        .start()
        .await
        .context("starting control loops")?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl_c received; shutting down"),
        Err(e) => error!("failed to listen for ctrl_c: {}", e),
    }

    orchestrator.shutdown().await;
    let status = orchestrator.status().await;
    info!(
        uptime_secs = status.uptime_secs,
        degraded = ?status.degraded,
        "adaptive-control stopped"
    );
    Ok(())
}
