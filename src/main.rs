use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tunesync::catalog::{CatalogClient, CatalogService};
use tunesync::config;
use tunesync::credentials::StoredCredentials;
use tunesync::db;
use tunesync::relay::ws::{router, WsState};
use tunesync::relay::{BroadcastBus, NotificationRelay};
use tunesync::worker;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/tunesync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let creds = StoredCredentials::new(
        pool.clone(),
        cfg.catalog.token_url.clone(),
        cfg.catalog.client_id.clone(),
        cfg.catalog.client_secret.clone(),
    );
    let base_url = Url::parse(&cfg.catalog.api_base).context("invalid catalog.api_base")?;
    let catalog: Arc<dyn CatalogService> = Arc::new(CatalogClient::new(
        creds,
        base_url,
        cfg.catalog.page_size,
        Duration::from_millis(cfg.app.page_delay_ms),
    ));

    let bus = Arc::new(BroadcastBus::new(256));
    let relay = NotificationRelay::new(
        pool.clone(),
        bus.clone(),
        Duration::from_millis(cfg.app.settle_delay_ms),
    );

    for worker_id in 0..cfg.app.workers {
        let pool = pool.clone();
        let catalog = catalog.clone();
        let relay = relay.clone();
        tokio::spawn(async move {
            info!(worker_id, "starting queue worker");
            worker::run(pool, catalog, relay, Duration::from_millis(500)).await;
        });
    }

    let app = router(WsState {
        pool: pool.clone(),
        bus,
    });
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.bind))?;
    info!(bind = %cfg.server.bind, "serving websocket relay");
    axum::serve(listener, app).await?;

    Ok(())
}
