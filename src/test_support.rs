//! Shared fixtures for unit tests: an in-memory catalog and object store on
//! a temporary directory, plus fake collaborators.

use crate::{
    db,
    errors::{PipelineError, PipelineResult},
    models::{album::Album, client::Client, object::ObjectEntry},
    services::{
        archive_service::ArchiveService,
        catalog_service::{CatalogSource, SqliteCatalog},
        layout::{AlbumSection, KeyLayout},
        notification::{ArchiveReady, Notifier},
        object_store::{
            BucketStore, ListOptions, ObjectReader, ObjectStore, StreamingUpload, UrlSigner,
        },
        storage_service::{StorageError, StorageResult, StorageService},
        transcoder,
    },
    state::AppState,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

pub const TEST_BUCKET: &str = "studio-photos";

pub struct TestEnv {
    pub db: Arc<SqlitePool>,
    pub storage: StorageService,
    pub store: Arc<BucketStore>,
    pub catalog: Arc<SqliteCatalog>,
    pub bucket: String,
    pub layout: KeyLayout,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let env = Self::without_bucket().await;
        env.storage.create_bucket(TEST_BUCKET, "local").await.unwrap();
        env
    }

    pub async fn without_bucket() -> Self {
        // One connection, never recycled: every handle sees the same
        // in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let db = Arc::new(pool);

        let dir = tempfile::tempdir().unwrap();
        let storage = StorageService::new(db.clone(), dir.path().join("objects"));
        let store = Arc::new(BucketStore::new(
            storage.clone(),
            TEST_BUCKET,
            "local",
            UrlSigner::new("test-secret", "http://localhost:3000"),
        ));

        Self {
            catalog: Arc::new(SqliteCatalog::new(db.clone())),
            db,
            storage,
            store,
            bucket: TEST_BUCKET.to_string(),
            layout: KeyLayout::new("clients", "home-page"),
            _dir: dir,
        }
    }

    /// HTTP state over this environment. Notifications are recorded and
    /// dropped.
    pub fn app_state(&self) -> AppState {
        AppState {
            storage: self.storage.clone(),
            bucket: self.bucket.clone(),
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            archives: ArchiveService::new(
                self.store.clone(),
                Arc::new(RecordingNotifier::default()),
                self.layout.clone(),
                "http://localhost:3000",
                7,
                CancellationToken::new(),
            ),
            signer: UrlSigner::new("test-secret", "http://localhost:3000"),
            layout: self.layout.clone(),
        }
    }

    pub async fn add_client(&self, name: &str, email: &str) -> Client {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO clients (password, name, email) VALUES ('', ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(email)
        .fetch_one(&*self.db)
        .await
        .unwrap();

        Client {
            id,
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    pub async fn add_album(&self, client: &Client, name: &str, poster: &str) -> Album {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO albums (client_id, name, poster_image_path) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(client.id)
        .bind(name)
        .bind(poster)
        .fetch_one(&*self.db)
        .await
        .unwrap();

        Album {
            id,
            client_id: client.id,
            name: name.to_string(),
            poster_image_path: poster.to_string(),
            shoot_date: None,
        }
    }

    pub async fn put_object(&self, key: &str, body: Vec<u8>) {
        self.store
            .put(key, Bytes::from(body), "application/octet-stream")
            .await
            .unwrap();
    }

    /// Store an album original and return its key.
    pub async fn put_original(&self, album: &Album, name: &str, body: Vec<u8>) -> String {
        let key = self.layout.album_key(album, AlbumSection::Originals, name);
        self.store
            .put(&key, Bytes::from(body), "image/jpeg")
            .await
            .unwrap();
        key
    }

    pub async fn read_object(&self, key: &str) -> Vec<u8> {
        let mut body = Vec::new();
        self.store
            .get(key)
            .await
            .unwrap()
            .read_to_end(&mut body)
            .await
            .unwrap();
        body
    }

    pub async fn set_last_modified(&self, key: &str, at: DateTime<Utc>) {
        sqlx::query("UPDATE objects SET last_modified = ? WHERE key = ?")
            .bind(at)
            .bind(key)
            .execute(&*self.db)
            .await
            .unwrap();
    }

    /// Delete the payload on disk but keep the metadata row, so the object
    /// lists fine but cannot be read.
    pub async fn remove_payload(&self, key: &str) {
        let path = self.storage.object_path(&self.bucket, key);
        tokio::fs::remove_file(path).await.unwrap();
    }
}

/// Deterministic JPEG of the given size.
pub fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    transcoder::encode_jpeg(&DynamicImage::ImageRgb8(img)).unwrap()
}

/// Captures notifications instead of sending them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<ArchiveReady>>,
    fail_next: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<ArchiveReady> {
        self.sent.lock().clone()
    }

    /// Make the next `send` fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &ArchiveReady) -> PipelineResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::Notify("mail provider unavailable".into()));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

/// Catalog whose album listing fails for one client.
pub struct FailingAlbumsCatalog {
    inner: Arc<SqliteCatalog>,
    failing_client: i64,
}

impl FailingAlbumsCatalog {
    pub fn new(inner: Arc<SqliteCatalog>, failing_client: i64) -> Self {
        Self {
            inner,
            failing_client,
        }
    }
}

#[async_trait]
impl CatalogSource for FailingAlbumsCatalog {
    async fn list_clients(&self) -> PipelineResult<Vec<Client>> {
        self.inner.list_clients().await
    }

    async fn list_albums(&self, client_id: i64) -> PipelineResult<Vec<Album>> {
        if client_id == self.failing_client {
            return Err(PipelineError::Timeout("listing albums"));
        }
        self.inner.list_albums(client_id).await
    }

    async fn get_client(&self, client_id: i64) -> PipelineResult<Client> {
        self.inner.get_client(client_id).await
    }

    async fn get_album(&self, client_id: i64, album_id: i64) -> PipelineResult<Album> {
        self.inner.get_album(client_id, album_id).await
    }

    async fn list_favorite_keys(
        &self,
        client_id: i64,
        album_id: i64,
    ) -> PipelineResult<Vec<String>> {
        self.inner.list_favorite_keys(client_id, album_id).await
    }

    async fn toggle_favorite(
        &self,
        client_id: i64,
        album_id: i64,
        key: &str,
    ) -> PipelineResult<bool> {
        self.inner.toggle_favorite(client_id, album_id, key).await
    }
}

/// Store whose deletes fail for keys under one prefix.
pub struct FailingDeleteStore {
    inner: Arc<BucketStore>,
    failing_prefix: String,
}

impl FailingDeleteStore {
    pub fn new(inner: Arc<BucketStore>, failing_prefix: impl Into<String>) -> Self {
        Self {
            inner,
            failing_prefix: failing_prefix.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for FailingDeleteStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn bucket_exists(&self) -> StorageResult<bool> {
        self.inner.bucket_exists().await
    }

    async fn create_bucket(&self) -> StorageResult<()> {
        self.inner.create_bucket().await
    }

    async fn list(&self, prefix: &str, options: &ListOptions) -> StorageResult<Vec<ObjectEntry>> {
        self.inner.list(prefix, options).await
    }

    async fn stat(&self, key: &str) -> StorageResult<Option<ObjectEntry>> {
        self.inner.stat(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<ObjectReader> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StorageResult<ObjectEntry> {
        self.inner.put(key, body, content_type).await
    }

    fn put_stream(&self, key: &str, content_type: &str) -> StreamingUpload {
        self.inner.put_stream(key, content_type)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<usize> {
        if keys.iter().any(|k| k.starts_with(&self.failing_prefix)) {
            return Err(StorageError::Io(std::io::Error::other("disk unavailable")));
        }
        self.inner.delete(keys).await
    }

    fn presigned_url(&self, key: &str, ttl: Duration) -> String {
        self.inner.presigned_url(key, ttl)
    }
}
