use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod test_support;

use services::{
    archive_janitor::ArchiveJanitor,
    archive_service::ArchiveService,
    cache_builder::{CacheBuilder, spawn_cache_schedule},
    catalog_service::{CatalogSource, SqliteCatalog},
    layout::KeyLayout,
    notification::{LogNotifier, Notifier, ResendNotifier},
    object_store::{BucketStore, ObjectStore, UrlSigner},
    storage_service::StorageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        bucket = %cfg.bucket,
        storage_dir = %cfg.storage_dir,
        max_cache_workers = cfg.max_cache_workers,
        "starting studio-assets"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let shutdown = CancellationToken::new();
    let layout = KeyLayout::new(cfg.clients_folder.clone(), cfg.home_folder.clone());
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone());
    let signer = UrlSigner::new(cfg.url_signing_secret.clone(), cfg.public_base_url.clone());
    let store: Arc<dyn ObjectStore> = Arc::new(BucketStore::new(
        storage.clone(),
        cfg.bucket.clone(),
        cfg.region.clone(),
        signer.clone(),
    ));
    let catalog: Arc<dyn CatalogSource> = Arc::new(SqliteCatalog::new(db.clone()));

    let cache_builder = Arc::new(CacheBuilder::new(
        store.clone(),
        catalog.clone(),
        layout.clone(),
        cfg.max_cache_workers,
        shutdown.child_token(),
    ));
    cache_builder
        .ensure_bucket()
        .await
        .with_context(|| format!("provisioning bucket `{}`", cfg.bucket))?;

    let notifier: Arc<dyn Notifier> = if cfg.email_api_key.is_empty() {
        tracing::warn!("STUDIO_EMAIL_API_KEY not set, download notifications are only logged");
        Arc::new(LogNotifier)
    } else {
        Arc::new(ResendNotifier::new(
            cfg.email_api_key.clone(),
            cfg.from_name.clone(),
            cfg.from_email.clone(),
        )?)
    };

    let archives = ArchiveService::new(
        store.clone(),
        notifier,
        layout.clone(),
        cfg.public_base_url.clone(),
        cfg.download_expiration_days,
        shutdown.child_token(),
    );

    let janitor = Arc::new(ArchiveJanitor::new(
        store.clone(),
        catalog.clone(),
        layout.clone(),
        cfg.download_expiration_days,
    ));
    janitor.start(cfg.cleanup_interval);

    let schedule = spawn_cache_schedule(cache_builder, cfg.cache_interval, shutdown.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state::AppState {
        storage,
        bucket: cfg.bucket.clone(),
        store: store.clone(),
        catalog,
        archives: archives.clone(),
        signer,
        layout,
    });

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Drain background work ---
    tracing::info!("shutting down background tasks");
    shutdown.cancel();
    janitor.stop().await;
    if let Err(e) = schedule.await {
        tracing::error!(error = %e, "cache schedule task failed");
    }
    archives.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
