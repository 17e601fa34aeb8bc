use clap::Parser;
use eth_analytics_rs::{api, config::AppConfig, App};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Ethereum block ingestion with live push updates and MEV heuristics
#[derive(Parser, Debug)]
#[command(name = "eth-analytics-rs", version, about)]
struct Cli {
    /// Ingest from a recorded JSON fixture instead of a live node
    #[arg(long, value_name = "FIXTURE")]
    replay: Option<PathBuf>,

    /// Port for the HTTP and WebSocket server
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,eth_analytics_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load()?;
    if let Some(fixture) = cli.replay {
        config.replay_fixture = Some(fixture);
    }
    if let Some(port) = cli.api_port {
        config.api_port = port;
    }
    config.validate()?;

    // Initialize the application
    let app = match App::init(config).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!("Failed to initialize application: {:#}", e);
            return Err(e);
        }
    };

    app.start().await?;

    let server_app = app.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::start_server(server_app).await {
            error!("API server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");

    app.stop().await;
    if let Err(e) = api_handle.await {
        error!("API server task failed: {}", e);
    }

    Ok(())
}
