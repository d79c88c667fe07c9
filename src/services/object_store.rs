//! Object store gateway used by the asset pipeline.
//!
//! `ObjectStore` is bound to a single bucket. `BucketStore` implements it on
//! top of the local `StorageService`; tests run against the same
//! implementation with an in-memory database.

use super::storage_service::{StorageError, StorageResult, StorageService};
use crate::models::object::{Object, ObjectEntry};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::{
    io::{self, Write},
    time::Duration,
};
use tokio::{io::AsyncRead, sync::mpsc, task::JoinHandle};
use tracing::debug;

/// Async byte stream of an object's payload.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Chunks buffered between a streaming writer and the upload task.
const UPLOAD_CHANNEL_CAPACITY: usize = 8;

/// Filters and extras for `ObjectStore::list`.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Lower-case extensions with the leading dot. Empty accepts every key.
    pub extensions: Vec<String>,
    /// When set, every entry carries a pre-signed URL valid this long.
    pub url_ttl: Option<Duration>,
}

impl ListOptions {
    pub fn with_extensions(extensions: &[&str]) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            url_ttl: None,
        }
    }

    pub fn with_urls(mut self, ttl: Duration) -> Self {
        self.url_ttl = Some(ttl);
        self
    }

    fn accepts(&self, key: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let key = key.to_ascii_lowercase();
        self.extensions.iter().any(|ext| key.ends_with(ext.as_str()))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket this store is bound to.
    fn bucket(&self) -> &str;

    async fn bucket_exists(&self) -> StorageResult<bool>;

    /// Create the bucket. Succeeds when it already exists.
    async fn create_bucket(&self) -> StorageResult<()>;

    /// Every object whose key starts with `prefix`, in lexical key order.
    async fn list(&self, prefix: &str, options: &ListOptions) -> StorageResult<Vec<ObjectEntry>>;

    /// Metadata of `key`, `None` when absent.
    async fn stat(&self, key: &str) -> StorageResult<Option<ObjectEntry>>;

    async fn get(&self, key: &str) -> StorageResult<ObjectReader>;

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StorageResult<ObjectEntry>;

    /// Start a streaming upload. Must be called from within a tokio runtime.
    fn put_stream(&self, key: &str, content_type: &str) -> StreamingUpload;

    /// Delete `keys` one at a time, returning how many existed and were
    /// removed. Missing keys are skipped.
    async fn delete(&self, keys: &[String]) -> StorageResult<usize>;

    fn presigned_url(&self, key: &str, ttl: Duration) -> String;
}

/// A streaming upload in progress: a blocking `Write` half and the handle
/// that commits or aborts it.
pub struct StreamingUpload {
    pub writer: ObjectWriter,
    pub handle: UploadHandle,
}

impl StreamingUpload {
    /// Wire a channel-fed upload task around `upload`.
    ///
    /// `upload` receives the chunk stream and must commit only when the
    /// stream ends without an `Err` item.
    pub fn spawn<F, Fut>(key: &str, upload: F) -> Self
    where
        F: FnOnce(futures::stream::BoxStream<'static, io::Result<Bytes>>) -> Fut,
        Fut: Future<Output = StorageResult<Object>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(UPLOAD_CHANNEL_CAPACITY);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let task = tokio::spawn(upload(Box::pin(stream)));

        Self {
            writer: ObjectWriter { tx: tx.clone() },
            handle: UploadHandle {
                key: key.to_string(),
                control: tx,
                task,
            },
        }
    }
}

/// Synchronous writer feeding a streaming upload.
///
/// Blocks when the upload falls behind, so it must only be used from a
/// blocking context (`spawn_blocking`), never on an async worker thread.
pub struct ObjectWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload stream closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Completion side of a streaming upload.
///
/// The upload only ends once both this handle and its `ObjectWriter` are
/// gone: drop the writer before calling `finish`.
pub struct UploadHandle {
    key: String,
    control: mpsc::Sender<io::Result<Bytes>>,
    task: JoinHandle<StorageResult<Object>>,
}

impl UploadHandle {
    /// Close the stream and wait for the store to acknowledge the object.
    pub async fn finish(self) -> StorageResult<ObjectEntry> {
        drop(self.control);
        let object = self.task.await.map_err(join_error)??;
        Ok(object.into())
    }

    /// Poison the stream so the store discards everything written so far.
    pub async fn abort(self, reason: &str) -> StorageResult<()> {
        let _ = self.control.send(Err(io::Error::other(reason.to_string()))).await;
        drop(self.control);
        match self.task.await.map_err(join_error)? {
            Ok(_) => Err(StorageError::Io(io::Error::other(format!(
                "upload of `{}` committed despite abort",
                self.key
            )))),
            Err(StorageError::UploadAborted { .. }) => Ok(()),
            Err(other) => Err(other),
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::Io(io::Error::other(err))
}

/// Signs and verifies time-limited object URLs.
#[derive(Clone, Debug)]
pub struct UrlSigner {
    secret: String,
    base_url: String,
}

impl UrlSigner {
    pub fn new(secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn digest(&self, bucket: &str, key: &str, expires: i64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(format!("{bucket}/{key}:{expires}").as_bytes());
        hasher.finalize().into()
    }

    fn signature(&self, bucket: &str, key: &str, expires: i64) -> String {
        hex::encode(self.digest(bucket, key, expires))
    }

    pub fn sign(&self, bucket: &str, key: &str, expires: DateTime<Utc>) -> String {
        let expires = expires.timestamp();
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/objects/{}/{}?expires={}&signature={}",
            self.base_url,
            bucket,
            encoded_key,
            expires,
            self.signature(bucket, key, expires)
        )
    }

    /// True when `signature` matches and `expires` is still in the future.
    pub fn verify(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if expires <= now.timestamp() {
            return false;
        }
        let Ok(given) = hex::decode(signature) else {
            return false;
        };
        constant_time_eq(&self.digest(bucket, key, expires), &given)
    }
}

/// Compares every byte regardless of where the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `ObjectStore` over the local `StorageService`, bound to one bucket.
#[derive(Clone)]
pub struct BucketStore {
    storage: StorageService,
    bucket: String,
    region: String,
    signer: UrlSigner,
}

impl BucketStore {
    pub fn new(
        storage: StorageService,
        bucket: impl Into<String>,
        region: impl Into<String>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            region: region.into(),
            signer,
        }
    }
}

#[async_trait]
impl ObjectStore for BucketStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> StorageResult<bool> {
        self.storage.bucket_exists(&self.bucket).await
    }

    async fn create_bucket(&self) -> StorageResult<()> {
        match self.storage.create_bucket(&self.bucket, &self.region).await {
            Ok(_) | Err(StorageError::BucketAlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list(&self, prefix: &str, options: &ListOptions) -> StorageResult<Vec<ObjectEntry>> {
        let objects = self.storage.list_all(&self.bucket, prefix).await?;
        let now = Utc::now();

        Ok(objects
            .into_iter()
            .filter(|obj| options.accepts(&obj.key))
            .map(|obj| {
                let mut entry = ObjectEntry::from(obj);
                if let Some(ttl) = options.url_ttl {
                    let expires = now + chrono::Duration::from_std(ttl).unwrap_or_default();
                    entry.url = Some(self.signer.sign(&self.bucket, &entry.key, expires));
                }
                entry
            })
            .collect())
    }

    async fn stat(&self, key: &str) -> StorageResult<Option<ObjectEntry>> {
        match self.storage.get_object_metadata(&self.bucket, key).await {
            Ok(obj) => Ok(Some(obj.into())),
            Err(StorageError::ObjectNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get(&self, key: &str) -> StorageResult<ObjectReader> {
        let (_, file) = self.storage.get_object_reader(&self.bucket, key).await?;
        Ok(Box::new(file))
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StorageResult<ObjectEntry> {
        let stream = futures::stream::iter(std::iter::once(Ok(body)));
        let object = self
            .storage
            .upload_object_stream(&self.bucket, key, Some(content_type.to_string()), stream)
            .await?;
        Ok(object.into())
    }

    fn put_stream(&self, key: &str, content_type: &str) -> StreamingUpload {
        let storage = self.storage.clone();
        let bucket = self.bucket.clone();
        let owned_key = key.to_string();
        let content_type = content_type.to_string();

        StreamingUpload::spawn(key, move |stream| async move {
            storage
                .upload_object_stream(&bucket, &owned_key, Some(content_type), stream)
                .await
        })
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<usize> {
        let mut removed = 0;
        for key in keys {
            match self.storage.delete_object(&self.bucket, key).await {
                Ok(_) => removed += 1,
                Err(StorageError::ObjectNotFound { .. }) => {
                    debug!(key = %key, "delete skipped, object already gone");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    fn presigned_url(&self, key: &str, ttl: Duration) -> String {
        let expires = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.signer.sign(&self.bucket, key, expires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;
    use tokio::io::AsyncReadExt;

    #[test]
    fn list_options_filter_extensions_case_insensitively() {
        let options = ListOptions::with_extensions(&[".jpg", ".jpeg"]);
        assert!(options.accepts("a/IMG_1.JPG"));
        assert!(options.accepts("a/b.jpeg"));
        assert!(!options.accepts("a/b.png"));
        assert!(!options.accepts("a/jpg"));
        assert!(ListOptions::default().accepts("anything"));
    }

    #[test]
    fn signed_urls_verify_until_expiry() {
        let signer = UrlSigner::new("secret", "http://localhost:3000/");
        let now = Utc::now();
        let expires = now + chrono::Duration::minutes(30);
        let url = signer.sign("studio-photos", "home page/a.jpg", expires);
        assert!(url.starts_with("http://localhost:3000/objects/studio-photos/home%20page/a.jpg?"));

        let signature = url.rsplit("signature=").next().unwrap();
        let ts = expires.timestamp();
        assert!(signer.verify("studio-photos", "home page/a.jpg", ts, signature, now));
        assert!(!signer.verify("studio-photos", "home page/b.jpg", ts, signature, now));
        assert!(!signer.verify(
            "studio-photos",
            "home page/a.jpg",
            ts,
            signature,
            expires + chrono::Duration::seconds(1)
        ));
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let signer = UrlSigner::new("secret", "http://localhost:3000");
        let now = Utc::now();
        let ts = (now + chrono::Duration::minutes(5)).timestamp();
        let good = signer.signature("b", "k.jpg", ts);

        assert!(signer.verify("b", "k.jpg", ts, &good, now));
        assert!(signer.verify("b", "k.jpg", ts, &good.to_uppercase(), now));
        assert!(!signer.verify("b", "k.jpg", ts, &good[..62], now));
        assert!(!signer.verify("b", "k.jpg", ts, "zz", now));
        assert!(!signer.verify("b", "k.jpg", ts, "", now));

        let mut flipped = good.into_bytes();
        flipped[63] = if flipped[63] == b'0' { b'1' } else { b'0' };
        let flipped = String::from_utf8(flipped).unwrap();
        assert!(!signer.verify("b", "k.jpg", ts, &flipped, now));
    }

    #[test]
    fn constant_time_eq_checks_length_and_content() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[tokio::test]
    async fn stat_missing_is_none_and_delete_counts_existing() {
        let env = TestEnv::new().await;
        assert!(env.store.stat("nope.jpg").await.unwrap().is_none());

        env.store
            .put("a.jpg", Bytes::from_static(b"a"), "image/jpeg")
            .await
            .unwrap();
        let removed = env
            .store
            .delete(&["a.jpg".to_string(), "nope.jpg".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(env.store.stat("a.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streaming_upload_commits_on_finish() {
        let env = TestEnv::new().await;
        let StreamingUpload { writer, handle } = env.store.put_stream("out/x.bin", "application/zip");

        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.write_all(b"hello ")?;
            writer.write_all(b"world")
        })
        .await
        .unwrap()
        .unwrap();

        let entry = handle.finish().await.unwrap();
        assert_eq!(entry.size_bytes, 11);

        let mut body = String::new();
        env.store
            .get("out/x.bin")
            .await
            .unwrap()
            .read_to_string(&mut body)
            .await
            .unwrap();
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn streaming_upload_abort_leaves_no_object() {
        let env = TestEnv::new().await;
        let StreamingUpload { writer, handle } = env.store.put_stream("out/y.zip", "application/zip");

        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.write_all(b"half an archive")
        })
        .await
        .unwrap()
        .unwrap();

        handle.abort("zip writer failed").await.unwrap();
        assert!(env.store.stat("out/y.zip").await.unwrap().is_none());
    }
}
