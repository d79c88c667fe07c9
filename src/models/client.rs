//! A client of the studio: owns albums, receives archive notifications.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Client {
    pub id: i64,

    pub name: String,

    /// Recipient of "your download is ready" mail.
    pub email: String,
}
