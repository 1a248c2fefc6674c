use anyhow::{Context, Result};
use axum::Router;
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, RunMode};
use services::{catalog::Catalog, dedup_service::DedupService, object_store::ObjectStore};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting dedup-store with config: {:?}", cfg);

    // --- Object namespace ---
    let objects = ObjectStore::new(&cfg.data_dir);
    objects
        .init()
        .await
        .with_context(|| format!("creating data directory {}", cfg.data_dir.display()))?;

    // --- Catalog ---
    ensure_sqlite_parent(&cfg.database_url)?;
    let catalog = Catalog::connect(&cfg.database_url, cfg.max_connections, cfg.catalog_timeout)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    let statements = catalog.migrate().await.context("applying catalog schema")?;
    tracing::info!("Applied {} schema statements", statements);
    if mode == RunMode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    let service = DedupService::new(catalog, objects);

    if mode == RunMode::Reclaim {
        let summary = service.reclaim_orphans(cfg.reclaim_grace).await?;
        tracing::info!(
            scanned = summary.scanned,
            removed = summary.removed,
            recent = summary.recent,
            grace_secs = cfg.reclaim_grace.as_secs(),
            "Reclaim pass complete."
        );
        return Ok(());
    }

    // --- Leftovers from a previous run; nothing is uploading yet ---
    service
        .objects
        .sweep_staging()
        .await
        .context("sweeping staging directory")?;

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the directory holding a file-backed SQLite database.
fn ensure_sqlite_parent(database_url: &str) -> Result<()> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if db_path.is_empty() || db_path.starts_with(":memory:") {
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}
