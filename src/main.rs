use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dvpn_backend::{
    config::{Config, LoggingConfig},
    DvpnApp,
};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, source) = load_config().await?;

    init_tracing(&config.logging);

    info!("Starting dvpn-backend...");
    match &source {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    let app = DvpnApp::new(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let app_clone = app.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, initiating graceful shutdown...");
                let _ = shutdown_tx.send(());
                if let Err(e) = app_clone.shutdown().await {
                    error!("Error during shutdown: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        }
    });

    app.run_with_shutdown(shutdown_rx).await?;

    info!("dvpn-backend stopped gracefully");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
    }
}

/// Load configuration from file or use defaults
async fn load_config() -> Result<(Config, Option<PathBuf>)> {
    let mut config_paths = Vec::new();
    if let Some(explicit) = std::env::var_os("DVPN_CONFIG") {
        config_paths.push(PathBuf::from(explicit));
    }
    config_paths.push(PathBuf::from("./dvpn.toml"));
    config_paths.push(PathBuf::from("/etc/dvpn/dvpn.toml"));
    if let Some(dir) = dirs::config_dir() {
        config_paths.push(dir.join("dvpn/dvpn.toml"));
    }

    for path in config_paths {
        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let config: Config = toml::from_str(&content)?;
            return Ok((config, Some(path)));
        }
    }

    Ok((Config::default(), None))
}
