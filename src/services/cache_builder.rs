//! Derived-asset cache builder.
//!
//! One sweep walks the home-page originals and every album of every client,
//! compares each source's timestamp with its derived asset and queues a
//! regeneration on a bounded `WorkerPool` when the derived asset is missing
//! or older. Sweeps keep no state between runs.

use super::{
    catalog_service::CatalogSource,
    layout::{AlbumSection, KeyLayout},
    object_store::{ListOptions, ObjectStore},
    transcoder,
    worker_pool::WorkerPool,
};
use crate::{
    errors::{PipelineError, PipelineResult},
    models::{album::Album, client::Client, object::ObjectEntry},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{io::AsyncReadExt, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extensions of album originals that get thumbnails.
pub const ORIGINAL_EXTENSIONS: [&str; 2] = [".jpg", ".jpeg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedKind {
    Thumbnail,
    HeroBanner,
    HomePreview,
}

impl DerivedKind {
    pub fn max_edge(self) -> u32 {
        match self {
            DerivedKind::Thumbnail => transcoder::THUMBNAIL_EDGE,
            DerivedKind::HeroBanner => transcoder::HERO_BANNER_EDGE,
            DerivedKind::HomePreview => transcoder::HOME_PREVIEW_EDGE,
        }
    }
}

impl fmt::Display for DerivedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DerivedKind::Thumbnail => "thumbnail",
            DerivedKind::HeroBanner => "hero-banner",
            DerivedKind::HomePreview => "home-preview",
        })
    }
}

/// A derived asset is fresh when it exists and is not older than its source.
/// Equal timestamps count as fresh.
pub fn is_fresh(source_modified: DateTime<Utc>, derived: Option<&ObjectEntry>) -> bool {
    derived.is_some_and(|d| d.last_modified >= source_modified)
}

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Source/derived pairs compared.
    pub checked: usize,
    pub fresh: usize,
    /// Pairs skipped because a stat failed or the source is missing.
    pub skipped: usize,
    pub submitted: usize,
    pub regenerated: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct CacheBuilder {
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn CatalogSource>,
    layout: KeyLayout,
    max_workers: usize,
    shutdown: CancellationToken,
}

impl CacheBuilder {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn CatalogSource>,
        layout: KeyLayout,
        max_workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            catalog,
            layout,
            max_workers,
            shutdown,
        }
    }

    /// Create the bucket when missing. Any failure is a configuration error.
    pub async fn ensure_bucket(&self) -> PipelineResult<()> {
        let bucket = self.store.bucket().to_string();
        let exists = self.store.bucket_exists().await.map_err(|e| {
            PipelineError::Config(format!("checking bucket `{bucket}` exists: {e}"))
        })?;
        if exists {
            return Ok(());
        }

        info!(bucket = %bucket, "creating bucket");
        self.store
            .create_bucket()
            .await
            .map_err(|e| PipelineError::Config(format!("creating bucket `{bucket}`: {e}")))
    }

    /// Run one full sweep and wait for every queued regeneration.
    ///
    /// Only a bucket provisioning failure is returned as an error; every
    /// other failure is logged and confined to its image, album or client.
    pub async fn run_sweep(&self) -> PipelineResult<SweepReport> {
        info!("starting cache sweep...");
        self.ensure_bucket().await?;

        let mut pool = WorkerPool::new(self.max_workers, self.shutdown.child_token());
        let mut report = SweepReport::default();

        if let Err(e) = self.scan_home_page(&mut pool, &mut report).await {
            error!(error = %e, "error updating home page cache");
        }

        match self.catalog.list_clients().await {
            Ok(clients) => {
                info!(num_clients = clients.len(), "creating cache for clients...");
                for client in &clients {
                    if self.shutdown.is_cancelled() {
                        info!("shutdown requested, no further albums will be scanned");
                        break;
                    }
                    self.scan_client(client, &mut pool, &mut report).await;
                }
            }
            Err(e) => error!(error = %e, "error retrieving clients"),
        }

        report.submitted = pool.queued();
        let pool_report = pool.drain().await;
        report.regenerated = pool_report.completed;
        report.failed = pool_report.failed;
        report.cancelled = pool_report.cancelled;

        info!(
            checked = report.checked,
            fresh = report.fresh,
            skipped = report.skipped,
            submitted = report.submitted,
            regenerated = report.regenerated,
            failed = report.failed,
            cancelled = report.cancelled,
            "cache sweep finished"
        );
        Ok(report)
    }

    async fn scan_home_page(
        &self,
        pool: &mut WorkerPool,
        report: &mut SweepReport,
    ) -> PipelineResult<()> {
        let prefix = self.layout.home_originals_prefix();
        let originals = self.store.list(&prefix, &ListOptions::default()).await?;

        info!(num_images = originals.len(), path = %prefix, "checking for updated home page images...");

        for original in &originals {
            let target = self.layout.home_thumbnail_key(original.file_name());
            self.check_and_submit(pool, report, DerivedKind::HomePreview, original, target)
                .await;
        }
        Ok(())
    }

    async fn scan_client(&self, client: &Client, pool: &mut WorkerPool, report: &mut SweepReport) {
        let albums = match self.catalog.list_albums(client.id).await {
            Ok(albums) => albums,
            Err(e) => {
                error!(client_id = client.id, error = %e, "error retrieving albums, skipping client");
                return;
            }
        };

        for album in &albums {
            self.scan_hero_banner(album, pool, report).await;

            if let Err(e) = self.scan_thumbnails(album, pool, report).await {
                error!(
                    client_id = client.id,
                    album_id = album.id,
                    error = %e,
                    "error retrieving image listing for album"
                );
            }
        }
    }

    async fn scan_hero_banner(&self, album: &Album, pool: &mut WorkerPool, report: &mut SweepReport) {
        if album.poster_image_path.is_empty() {
            debug!(album_id = album.id, "album has no poster image");
            return;
        }

        let source_key =
            self.layout
                .album_key(album, AlbumSection::Originals, &album.poster_image_path);
        let source = match self.store.stat(&source_key).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                warn!(album_id = album.id, key = %source_key, "poster image missing, no hero banner");
                report.skipped += 1;
                return;
            }
            Err(e) => {
                error!(key = %source_key, error = %e, "error retrieving metadata for poster image");
                report.skipped += 1;
                return;
            }
        };

        let target =
            self.layout
                .album_key(album, AlbumSection::HeroBanner, &album.poster_image_path);
        self.check_and_submit(pool, report, DerivedKind::HeroBanner, &source, target)
            .await;
    }

    async fn scan_thumbnails(
        &self,
        album: &Album,
        pool: &mut WorkerPool,
        report: &mut SweepReport,
    ) -> PipelineResult<()> {
        let prefix = self
            .layout
            .album_section_prefix(album, AlbumSection::Originals);
        let originals = self
            .store
            .list(&prefix, &ListOptions::with_extensions(&ORIGINAL_EXTENSIONS))
            .await?;

        for original in &originals {
            let target =
                self.layout
                    .album_key(album, AlbumSection::Thumbnails, original.file_name());
            self.check_and_submit(pool, report, DerivedKind::Thumbnail, original, target)
                .await;
        }
        Ok(())
    }

    /// Stat `target` and queue a regeneration when it is not fresh.
    async fn check_and_submit(
        &self,
        pool: &mut WorkerPool,
        report: &mut SweepReport,
        kind: DerivedKind,
        source: &ObjectEntry,
        target: String,
    ) {
        report.checked += 1;

        let derived = match self.store.stat(&target).await {
            Ok(derived) => derived,
            Err(e) => {
                error!(key = %target, error = %e, "error retrieving metadata for {kind}");
                report.skipped += 1;
                return;
            }
        };

        if is_fresh(source.last_modified, derived.as_ref()) {
            report.fresh += 1;
            return;
        }

        debug!(source = %source.key, target = %target, "queueing {kind} regeneration");
        let store = self.store.clone();
        let source_key = source.key.clone();
        pool.submit(
            format!("{kind} {target}"),
            regenerate(store, source_key, target, kind),
        );
    }
}

/// Fetch `source_key`, resize it for `kind` and store it at `target_key`.
async fn regenerate(
    store: Arc<dyn ObjectStore>,
    source_key: String,
    target_key: String,
    kind: DerivedKind,
) -> PipelineResult<()> {
    let mut reader = store.get(&source_key).await?;
    let mut source = Vec::new();
    reader.read_to_end(&mut source).await?;

    let max_edge = kind.max_edge();
    let encoded =
        tokio::task::spawn_blocking(move || transcoder::resize(&source, max_edge)).await??;

    store
        .put(&target_key, Bytes::from(encoded), "image/jpeg")
        .await?;

    info!(source = %source_key, target = %target_key, "updated {kind}");
    Ok(())
}

/// Run a sweep now and then every `interval` until `shutdown` fires.
///
/// A tick that lands while the previous sweep is still running is skipped.
/// On shutdown the in-flight sweep is awaited before the task returns.
pub fn spawn_cache_schedule(
    builder: Arc<CacheBuilder>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let running = Arc::new(AtomicBool::new(false));
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if running.swap(true, Ordering::SeqCst) {
                        info!("cache sweep already running, skipping...");
                        continue;
                    }

                    let builder = builder.clone();
                    let guard = SweepRunning(running.clone());
                    in_flight = Some(tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = builder.run_sweep().await {
                            error!(error = %e, "cache sweep aborted");
                        }
                    }));
                }
            }
        }

        if let Some(handle) = in_flight {
            let _ = handle.await;
        }
        info!("cache schedule stopped");
    })
}

/// Clears the schedule's running flag when a sweep ends, panics included.
struct SweepRunning(Arc<AtomicBool>);

impl Drop for SweepRunning {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
