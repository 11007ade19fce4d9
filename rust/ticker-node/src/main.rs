//! Ticker node - main entry point.

use clap::Parser;
use mimalloc::MiMalloc;
use ticker_core::SchedulerTimeZone;

use ticker_node::cli::{self, Cli, Command};
use ticker_node::config::AppConfig;
use ticker_node::logging::init_tracing;
use ticker_node::server;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        Command::Run { config, node_id } => {
            let mut config = AppConfig::load(config.as_deref())?;
            if let Some(node_id) = node_id {
                config.scheduler.node_id = Some(node_id);
            }
            init_tracing(&config.logging)?;
            server::run(config, shutdown_signal()).await
        }
        Command::CronNext { expression, count, utc } => {
            let zone = if utc { SchedulerTimeZone::Utc } else { SchedulerTimeZone::Local };
            for time in cli::cron_next(&expression, count, zone, chrono::Utc::now())? {
                println!("{}", cli::format_time(time, zone));
            }
            Ok(())
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        () = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
