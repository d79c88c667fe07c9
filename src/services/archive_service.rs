//! On-demand album archives.
//!
//! `create_archive_async` answers immediately with a job id. The archive is
//! built in a detached task that feeds the originals one at a time through a
//! zip encoder straight into a streaming upload; the archive itself is never
//! held in memory. The upload is aborted on any failure, so a partial
//! archive never appears under its final key.

use super::{
    layout::{AlbumSection, KeyLayout},
    notification::{ArchiveReady, Notifier},
    object_store::{ListOptions, ObjectStore, ObjectWriter, StreamingUpload},
};
use crate::{
    errors::{PipelineError, PipelineResult},
    models::{
        album::Album,
        client::Client,
        object::{ObjectEntry, base_name},
    },
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    io::{BufWriter, Write},
    sync::Arc,
};
use tokio::{io::AsyncReadExt, runtime::Handle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";
const ARCHIVE_EXTENSION: &str = ".zip";
const ZIP_BUFFER_SIZE: usize = 64 * 1024;

/// `{album name with spaces as hyphens}-{album id}`.
pub fn job_id(album: &Album) -> String {
    format!("{}-{}", album.name.replace(' ', "-"), album.id)
}

/// Stored file name of an album's archive. A `/` in the job id is
/// percent-encoded so the archive stays a single key segment.
pub fn archive_file_name(album: &Album) -> String {
    format!("{}{ARCHIVE_EXTENSION}", job_id(album).replace('/', "%2F"))
}

/// Recover the album id from an archive file name such as
/// `Spring-Shoot-7.zip`.
///
/// Only the base name is considered. The text after the last `-` (before an
/// optional `.zip`) must be a positive integer.
pub fn parse_album_id(file_name: &str) -> Option<i64> {
    let name = base_name(file_name);
    let stem = match name.len().checked_sub(ARCHIVE_EXTENSION.len()) {
        Some(split)
            if name.is_char_boundary(split)
                && name[split..].eq_ignore_ascii_case(ARCHIVE_EXTENSION) =>
        {
            &name[..split]
        }
        _ => name,
    };

    let (_, tail) = stem.rsplit_once('-')?;
    if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    tail.parse::<i64>().ok().filter(|id| *id > 0)
}

/// Builds, stores and announces album archives.
#[derive(Clone)]
pub struct ArchiveService {
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn Notifier>,
    layout: KeyLayout,
    public_base_url: String,
    expiration_days: i64,
    tasks: TaskTracker,
    in_flight: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
}

impl ArchiveService {
    /// An `expiration_days` of zero or less falls back to seven days.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
        layout: KeyLayout,
        public_base_url: impl Into<String>,
        expiration_days: i64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            notifier,
            layout,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            expiration_days: if expiration_days <= 0 { 7 } else { expiration_days },
            tasks: TaskTracker::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// Object key of an album's archive, under the requesting client's tree.
    pub fn archive_key(&self, album: &Album, client: &Client) -> String {
        format!(
            "{}{}",
            self.layout
                .section_prefix(client.id, album.id, AlbumSection::Downloads),
            archive_file_name(album)
        )
    }

    /// Link served by the archive download route. The path segment decodes
    /// back to `archive_file_name`.
    pub fn download_url(&self, client: &Client, album: &Album) -> String {
        format!(
            "{}/clients/{}/downloads/{}",
            self.public_base_url,
            client.id,
            urlencoding::encode(&archive_file_name(album))
        )
    }

    /// Start building the archive of `album` and return its job id.
    ///
    /// When the archive already exists only the notification is re-sent,
    /// synchronously. A request for an archive that is still being built
    /// returns the job id without starting a second build.
    pub async fn create_archive_async(
        &self,
        album: &Album,
        client: &Client,
    ) -> PipelineResult<String> {
        let job = job_id(album);
        let key = self.archive_key(album, client);

        if !self.in_flight.lock().insert(job.clone()) {
            info!(job_id = %job, "archive already being built");
            return Ok(job);
        }
        let guard = InFlight {
            set: self.in_flight.clone(),
            job: job.clone(),
        };

        match self.store.stat(&key).await {
            Ok(Some(_)) => {
                drop(guard);
                info!(key = %key, album_id = album.id, "archive already exists, sending notification only");
                self.notify(album, client).await?;
                return Ok(job);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "cannot stat archive, rebuilding");
            }
        }

        let service = self.clone();
        let album = album.clone();
        let client = client.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            service.process_archive(key, album, client).await;
        });

        Ok(job)
    }

    /// Wait for every detached build started so far.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    async fn process_archive(&self, key: String, album: Album, client: Client) {
        info!(album_id = album.id, key = %key, "starting archive creation");

        match self.build_archive(&key, &album).await {
            Ok(entry) => {
                info!(key = %key, size_bytes = entry.size_bytes, "finished uploading archive");
            }
            Err(e) => {
                error!(album_id = album.id, key = %key, error = %e, "archive build failed");
                return;
            }
        }

        match self.notify(&album, &client).await {
            Ok(()) => info!(album_id = album.id, "archive creation completed successfully"),
            Err(e) => error!(email = %client.email, error = %e, "failed to send archive notification"),
        }
    }

    /// Stream every original of `album` into a zip stored at `key`.
    pub async fn build_archive(&self, key: &str, album: &Album) -> PipelineResult<ObjectEntry> {
        let prefix = self.layout.album_section_prefix(album, AlbumSection::Originals);
        let originals: Vec<String> = self
            .store
            .list(&prefix, &ListOptions::default())
            .await?
            .into_iter()
            .map(|entry| entry.key)
            .collect();

        let StreamingUpload { writer, handle } = self.store.put_stream(key, ARCHIVE_CONTENT_TYPE);

        let store = self.store.clone();
        let runtime = Handle::current();
        let shutdown = self.shutdown.clone();
        let written = tokio::task::spawn_blocking(move || {
            write_zip(writer, store.as_ref(), &runtime, &originals, &shutdown)
        })
        .await
        .map_err(PipelineError::from)
        .and_then(|res| res);

        match written {
            Ok(added) => {
                let entry = handle.finish().await?;
                info!(key = %key, entries = added, "archive committed");
                Ok(entry)
            }
            Err(e) => {
                if let Err(abort_err) = handle.abort(&e.to_string()).await {
                    error!(key = %key, error = %abort_err, "failed to abort archive upload");
                }
                Err(e)
            }
        }
    }

    async fn notify(&self, album: &Album, client: &Client) -> PipelineResult<()> {
        let message = ArchiveReady {
            to_name: client.name.clone(),
            to_email: client.email.clone(),
            album_name: album.name.clone(),
            download_url: self.download_url(client, album),
            expiration_days: self.expiration_days,
        };
        self.notifier.send(&message).await
    }
}

/// Removes a job from the in-flight set when its build ends.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    job: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.job);
    }
}

fn zip_error(err: zip::result::ZipError) -> PipelineError {
    PipelineError::Io(std::io::Error::other(err))
}

/// Runs on a blocking thread. Originals that cannot be fetched are skipped;
/// any write failure ends the archive.
fn write_zip(
    writer: ObjectWriter,
    store: &dyn ObjectStore,
    runtime: &Handle,
    keys: &[String],
    shutdown: &CancellationToken,
) -> PipelineResult<usize> {
    let mut zip = ZipWriter::new_stream(BufWriter::with_capacity(ZIP_BUFFER_SIZE, writer));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut added = 0;

    for key in keys {
        if shutdown.is_cancelled() {
            return Err(PipelineError::Task("archive build cancelled by shutdown".into()));
        }

        let name = base_name(key);
        let body = match runtime.block_on(read_object(store, key)) {
            Ok(body) => body,
            Err(e) => {
                error!(image = %key, error = %e, "failed to add image to archive");
                continue;
            }
        };

        zip.start_file(name, options).map_err(zip_error)?;
        zip.write_all(&body)?;
        added += 1;
    }

    let mut inner = zip.finish().map_err(zip_error)?;
    inner.flush()?;
    Ok(added)
}

async fn read_object(store: &dyn ObjectStore, key: &str) -> PipelineResult<Vec<u8>> {
    let mut reader = store.get(key).await?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    Ok(body)
}
