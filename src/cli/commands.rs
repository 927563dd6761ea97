use anyhow::Result;
use tracing::info;

use crate::broker::ConnectionBroker;
use crate::config::TunnelConfig;
use crate::stats::RelayStats;

use super::config::{check_config, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Run { config } => {
            run_relay(config).await?;
        }
    }

    Ok(())
}

/// Load configuration and relay until Ctrl-C
async fn run_relay(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    info!("Loading configuration from: {}", config_path);
    let config = TunnelConfig::load(&config_path)?;

    let stats = RelayStats::new();
    let broker = ConnectionBroker::bind(config, stats.clone()).await?;

    broker
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let snapshot = stats.snapshot();
    info!(
        "Stopped after {} session(s): {} bytes from clients, {} bytes from upstream, {} correction(s)",
        snapshot.total_sessions,
        snapshot.bytes_from_client,
        snapshot.bytes_from_upstream,
        snapshot.corrections
    );
    Ok(())
}
