//! creditd - credit ledger reconciliation daemon
//!
//! Runs overspend reconciliation and decision-time capture either as a
//! long-lived scheduler or as a single pass.

use clap::{Parser, Subcommand};
use credit_service::{Collaborators, CreditConfig, CreditServices, DaemonError, Scheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Credit ledger daemon CLI
#[derive(Parser)]
#[command(name = "creditd")]
#[command(about = "Credit ledger daemon - overspend reconciliation and decision capture", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CREDIT_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, env = "CREDIT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CREDIT_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run one reconciliation pass and print its report
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = CreditConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let collaborators = Collaborators::from_config(&config).await?;
    let services = CreditServices::assemble(collaborators, &config);
    let (scheduler, trigger_rx) = Scheduler::new(&config.reconciler, &services);

    match cli.command.unwrap_or(Command::Run) {
        Command::Reconcile => {
            let report = scheduler.tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                anyhow::bail!("{} pair(s) failed to reconcile", report.failures.len());
            }
        }
        Command::Run => {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                interval_secs = config.reconciler.interval_secs,
                "creditd starting"
            );
            let runner = std::sync::Arc::clone(&scheduler);
            let handle = tokio::spawn(async move {
                runner.start(trigger_rx).await;
            });

            shutdown_signal().await;
            scheduler.stop().await;
            handle
                .await
                .map_err(|e| DaemonError::Scheduler(e.to_string()))?;
            tracing::info!("creditd shut down");
        }
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
