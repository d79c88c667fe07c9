//! Periodic removal of expired album archives.

use super::{
    catalog_service::CatalogSource,
    layout::{AlbumSection, KeyLayout},
    object_store::{ListOptions, ObjectStore},
};
use crate::models::album::Album;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const ARCHIVE_SUFFIX: &str = ".zip";

/// Deletes archives older than the retention window on a timer.
pub struct ArchiveJanitor {
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn CatalogSource>,
    layout: KeyLayout,
    retention_days: i64,
    state: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ArchiveJanitor {
    /// A `retention_days` of zero or less falls back to seven days.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn CatalogSource>,
        layout: KeyLayout,
        retention_days: i64,
    ) -> Self {
        Self {
            store,
            catalog,
            layout,
            retention_days: if retention_days <= 0 { 7 } else { retention_days },
            state: Mutex::new(None),
        }
    }

    /// Start sweeping every `interval`. The first sweep runs one interval
    /// from now. Starting a running janitor does nothing.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut state = self.state.lock();
        if state.is_some() {
            warn!("archive janitor already running");
            return;
        }

        let interval = interval.max(Duration::from_millis(1));
        let token = CancellationToken::new();
        let janitor = self.clone();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        janitor.cleanup_expired_archives().await;
                    }
                }
            }
        });

        *state = Some((token, handle));
        info!(interval_secs = interval.as_secs(), "archive cleanup routine started");
    }

    /// Stop the timer and wait for a sweep in progress. No-op when stopped.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.state.lock().take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "archive janitor task failed");
        }
        info!("archive cleanup routine stopped");
    }

    /// Run one sweep against the current time. Returns the number of
    /// archives removed.
    pub async fn cleanup_expired_archives(&self) -> usize {
        self.cleanup_expired_archives_at(Utc::now()).await
    }

    /// Delete every archive last modified strictly before
    /// `now - retention_days`.
    pub async fn cleanup_expired_archives_at(&self, now: DateTime<Utc>) -> usize {
        info!("starting cleanup of expired archives");
        let cutoff = now - chrono::Duration::days(self.retention_days);

        let clients = match self.catalog.list_clients().await {
            Ok(clients) => clients,
            Err(e) => {
                error!(error = %e, "error retrieving clients");
                return 0;
            }
        };

        let mut removed = 0;
        for client in &clients {
            let albums = match self.catalog.list_albums(client.id).await {
                Ok(albums) => albums,
                Err(e) => {
                    error!(client_id = client.id, error = %e, "error retrieving albums");
                    continue;
                }
            };

            for album in &albums {
                removed += self.cleanup_album(album, cutoff).await;
            }
        }

        info!(removed, "completed cleanup of expired archives");
        removed
    }

    async fn cleanup_album(&self, album: &Album, cutoff: DateTime<Utc>) -> usize {
        let prefix = self
            .layout
            .album_section_prefix(album, AlbumSection::Downloads);
        let entries = match self.store.list(&prefix, &ListOptions::default()).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(path = %prefix, error = %e, "failed to list downloads");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries {
            if !entry.key.to_ascii_lowercase().ends_with(ARCHIVE_SUFFIX) {
                continue;
            }
            if entry.last_modified >= cutoff {
                continue;
            }

            info!(path = %entry.key, modified = %entry.last_modified, "removing expired archive");
            match self.store.delete(std::slice::from_ref(&entry.key)).await {
                Ok(n) => removed += n,
                Err(e) => {
                    error!(path = %entry.key, error = %e, "failed to remove expired archive");
                    break;
                }
            }
        }
        removed
    }
}
