use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use vulnwatch::epss::EpssCollector;
use vulnwatch::feeds::FeedCollector;
use vulnwatch::kev::KevCollector;
use vulnwatch::nvd::NvdCollector;
use vulnwatch::server::serve_health;
use vulnwatch::{AppConfig, Store, Supervisor};

/// Grace window for collectors to wind down after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "vulnwatch", version, about = "Vulnerability-intelligence ingestion engine")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "vulnwatch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let cfg = AppConfig::load(&cli.config).context("failed to load configuration")?;

    let store = Arc::new(
        Store::connect(&cfg.database_url)
            .await
            .context("failed to initialise database pool")?,
    );
    store.migrate().await.context("failed to run migrations")?;

    let mut supervisor = Supervisor::new();

    if cfg.feeds.iter().any(|f| f.enabled) {
        supervisor.spawn(Arc::new(FeedCollector::new(store.clone(), &cfg)));
    } else {
        info!("no feeds configured");
    }
    if cfg.nvd.enabled {
        supervisor.spawn(Arc::new(NvdCollector::new(store.clone(), cfg.nvd.clone())));
    }
    if cfg.kev.enabled {
        supervisor.spawn(Arc::new(KevCollector::new(store.clone(), cfg.kev.clone())));
    }
    if cfg.epss.enabled {
        supervisor.spawn(Arc::new(EpssCollector::new(store.clone(), cfg.epss.clone())));
    }

    let health_shutdown = supervisor.subscribe();
    let bind = cfg.server_bind.clone();
    let server = tokio::spawn(async move {
        if let Err(err) = serve_health(&bind, health_shutdown).await {
            error!(error = %err, "health server failed");
        }
    });

    info!("running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("shutdown signal received");

    supervisor.join(SHUTDOWN_GRACE).await;
    let _ = server.await;

    info!("shutdown complete");
    Ok(())
}
