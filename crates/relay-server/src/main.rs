use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use relay_core::config::CONFIG_FILE_NAME;
use relay_core::{Relay, RelayConfig};

mod routes;

#[derive(Parser)]
#[command(name = "relay-server")]
#[command(about = "Slack signal relay: OAuth install, Events API webhook and signal store.")]
#[command(version)]
struct Cli {
    /// Address to listen on (overrides config and PORT)
    #[arg(long, env = "RELAY_BIND")]
    bind: Option<String>,

    /// Directory holding state, key and relay.toml
    #[arg(long, env = "RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Explicit config file path
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| cli.data_dir.as_ref().map(|dir| dir.join(CONFIG_FILE_NAME)));

    let mut config = RelayConfig::from_lookup(config_path.as_deref(), |key| std::env::var(key).ok())?;
    if let Some(dir) = cli.data_dir.as_ref() {
        config.data_dir = dir.clone();
    }
    if let Some(bind) = cli.bind.as_ref() {
        config.bind = bind.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let bind = config.bind.clone();

    let relay = Arc::new(Relay::init(config).await?);
    let app = routes::build_router(relay.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound server address")?;
    info!("relay listening on {}", local_addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await;

    relay.shutdown().await;
    serve_result.context("relay server exited unexpectedly")?;
    Ok(())
}
