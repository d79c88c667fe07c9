//! Stored objects: originals, derived images and album archives alike.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row of a stored object. The payload lives on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    pub id: Uuid,

    pub bucket_id: Uuid,

    /// Full key, e.g. `clients/3/7/originals/IMG_0001.jpg`.
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    pub content_type: Option<String>,

    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: Option<String>,

    pub storage_class: String,

    /// Set when the upload is committed. Freshness of derived assets and
    /// archive expiry are both decided on this timestamp.
    pub last_modified: DateTime<Utc>,

    pub version_id: Option<String>,

    pub is_deleted: bool,
}

/// Listing / stat result handed out by an `ObjectStore`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    /// Pre-signed download URL, only filled when the listing asked for one.
    pub url: Option<String>,
}

impl ObjectEntry {
    /// Base name of the key (text after the final `/`).
    pub fn file_name(&self) -> &str {
        base_name(&self.key)
    }
}

impl From<Object> for ObjectEntry {
    fn from(obj: Object) -> Self {
        Self {
            key: obj.key,
            last_modified: obj.last_modified,
            size_bytes: obj.size_bytes,
            content_type: obj.content_type,
            url: None,
        }
    }
}

/// Text after the final `/` of a key or path.
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_takes_last_segment() {
        assert_eq!(base_name("clients/1/2/originals/a.jpg"), "a.jpg");
        assert_eq!(base_name("a.jpg"), "a.jpg");
        assert_eq!(base_name("dir/"), "");
    }
}
