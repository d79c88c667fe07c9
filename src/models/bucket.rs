//! A bucket is the top-level namespace every studio asset lives in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket row.
///
/// The pipeline works against exactly one bucket, provisioned at startup.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    pub id: Uuid,

    /// Bucket name (S3 naming rules).
    pub name: String,

    pub owner_id: Uuid,

    /// Region the bucket was created in (e.g. "local", "us-west-2").
    pub region: String,

    pub created_at: DateTime<Utc>,

    pub versioning_enabled: bool,
}
