// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tokenflow Node
//!
//! Entry point for the `tokenflow-node` binary. Parses CLI arguments,
//! initializes logging and metrics, then either hosts a party or runs the
//! in-process simulation.
//!
//! - `run`: serve one party's inbox and the metrics endpoint
//! - `simulate`: run an issue and transfer scenario between five parties
//! - `version`: print build version information

mod cli;
mod config;
mod logging;
mod metrics;
mod simulate;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use tokenflow_protocol::identity::WalletRegistry;
use tokenflow_protocol::ledger::MemoryLedger;
use tokenflow_protocol::storage::{MemoryStatusStore, SledStatusStore, StatusStore};
use tokenflow_protocol::ttx::{serve, AuditorService, Infrastructure, PartyContext};

use cli::{Commands, TokenflowCli};
use config::NodeConfig;
use metrics::{NodeMetrics, NodeState};

const DEFAULT_LOG_LEVEL: &str = "tokenflow_node=info,tokenflow_protocol=info";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TokenflowCli::parse();
    logging::init_logging(DEFAULT_LOG_LEVEL, cli.log_format.into());

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Simulate(args) => run_simulation(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn open_store(args: &cli::RunArgs, table: &str) -> Result<Arc<dyn StatusStore>> {
    match &args.data_dir {
        Some(dir) => {
            let path = dir.join(table);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("failed to create store directory {}", path.display()))?;
            let store = SledStatusStore::open(&path)
                .with_context(|| format!("failed to open status store at {}", path.display()))?;
            tracing::info!(path = %path.display(), "status store opened");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStatusStore::new())),
    }
}

/// Hosts one party until interrupted.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let cfg = NodeConfig::load(args.config.as_deref())?;

    let infra = Infrastructure::default();
    infra.networks.register(Arc::new(MemoryLedger::new(
        &cfg.network,
        &cfg.channel,
        infra.vault.clone(),
    )));

    let wallets = Arc::new(WalletRegistry::new());
    let wallet = wallets.create_wallet(&args.wallet);
    let mut builder = PartyContext::builder(&infra, wallets)
        .status_store(open_store(&args, "owner")?)
        .ttx_config(cfg.ttx.clone())
        .finality_config(cfg.finality.clone())
        .selector_config(cfg.selector.clone());
    if args.auditor {
        builder = builder.auditor(AuditorService::new(
            wallet,
            open_store(&args, "auditor")?,
            infra.networks.clone(),
            cfg.audit.clone(),
        ));
    }
    let party = builder.build().context("failed to build party")?;
    let eviction = party.start_background();
    let server = serve(party.clone());

    tracing::info!(
        party = %party.me(),
        wallet = %args.wallet,
        auditor = args.auditor,
        tms = %cfg.tms_id(),
        "starting tokenflow-node"
    );

    let state = NodeState {
        metrics: Arc::new(NodeMetrics::new().context("failed to register metrics")?),
        party: party.clone(),
        started: chrono::Utc::now(),
    };
    let addr = format!("0.0.0.0:{}", args.metrics_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", addr))?;
    tracing::info!("metrics server listening on {}", addr);

    tokio::select! {
        res = axum::serve(listener, metrics::router(state)) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    party.shutdown();
    let _ = server.await;
    let _ = eviction.await;
    tracing::info!("tokenflow-node stopped");
    Ok(())
}

async fn run_simulation(args: cli::SimulateArgs) -> Result<()> {
    let cfg = NodeConfig::load(args.config.as_deref())?;
    let metrics = NodeMetrics::new()
        .and_then(|m| m.register_transactions())
        .context("failed to register metrics")?;
    let report = simulate::run(&cfg, &metrics, &args.token_type, args.issue, args.pay).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_version() {
    println!("tokenflow-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol       {}", tokenflow_protocol::config::PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
