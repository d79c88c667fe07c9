//! An album: one shoot for one client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Album row.
///
/// Objects of an album live under
/// `{clients_folder}/{client_id}/{id}/{originals|thumbnails|hero-banner|downloads}/`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Album {
    pub id: i64,

    pub client_id: i64,

    pub name: String,

    /// File name of the poster image inside `originals/`. The hero banner is
    /// stored under the same name in `hero-banner/`. Empty when unset.
    pub poster_image_path: String,

    pub shoot_date: Option<DateTime<Utc>>,
}
