//! Catalog of clients, albums and favorites.
//!
//! The pipeline only reads listings from here; favorites are exposed for the
//! HTTP layer. Every query is bounded by `QUERY_TIMEOUT`.

use crate::{
    errors::{PipelineError, PipelineResult},
    models::{album::Album, client::Client},
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// All active clients, ordered by name.
    async fn list_clients(&self) -> PipelineResult<Vec<Client>>;

    /// Active albums of a client, newest shoot first.
    async fn list_albums(&self, client_id: i64) -> PipelineResult<Vec<Album>>;

    async fn get_client(&self, client_id: i64) -> PipelineResult<Client>;

    async fn get_album(&self, client_id: i64, album_id: i64) -> PipelineResult<Album>;

    /// Keys of the images a client marked as favorite in an album.
    async fn list_favorite_keys(&self, client_id: i64, album_id: i64)
    -> PipelineResult<Vec<String>>;

    /// Flip the favorite flag of `key`. Returns true when the image is a
    /// favorite afterwards.
    async fn toggle_favorite(&self, client_id: i64, album_id: i64, key: &str)
    -> PipelineResult<bool>;
}

async fn bounded<T, F>(what: &'static str, fut: F) -> PipelineResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::time::timeout(QUERY_TIMEOUT, fut)
        .await
        .map_err(|_| PipelineError::Timeout(what))?
        .map_err(PipelineError::from)
}

fn not_found(err: sqlx::Error, what: String) -> PipelineError {
    match err {
        sqlx::Error::RowNotFound => PipelineError::NotFound(what),
        other => PipelineError::Catalog(other),
    }
}

/// `CatalogSource` backed by the SQLite tables created in `migrations/`.
#[derive(Clone)]
pub struct SqliteCatalog {
    db: Arc<SqlitePool>,
}

impl SqliteCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogSource for SqliteCatalog {
    async fn list_clients(&self) -> PipelineResult<Vec<Client>> {
        bounded(
            "listing clients",
            sqlx::query_as::<_, Client>(
                "SELECT id, name, email FROM clients WHERE deleted_at IS NULL ORDER BY name",
            )
            .fetch_all(&*self.db),
        )
        .await
    }

    async fn list_albums(&self, client_id: i64) -> PipelineResult<Vec<Album>> {
        bounded(
            "listing albums",
            sqlx::query_as::<_, Album>(
                "SELECT id, client_id, name, poster_image_path, shoot_date
                 FROM albums
                 WHERE deleted_at IS NULL AND client_id = ?
                 ORDER BY shoot_date DESC",
            )
            .bind(client_id)
            .fetch_all(&*self.db),
        )
        .await
    }

    async fn get_client(&self, client_id: i64) -> PipelineResult<Client> {
        let query = sqlx::query_as::<_, Client>(
            "SELECT id, name, email FROM clients WHERE deleted_at IS NULL AND id = ?",
        )
        .bind(client_id)
        .fetch_one(&*self.db);

        tokio::time::timeout(QUERY_TIMEOUT, query)
            .await
            .map_err(|_| PipelineError::Timeout("loading client"))?
            .map_err(|err| not_found(err, format!("client {client_id}")))
    }

    async fn get_album(&self, client_id: i64, album_id: i64) -> PipelineResult<Album> {
        let query = sqlx::query_as::<_, Album>(
            "SELECT a.id, a.client_id, a.name, a.poster_image_path, a.shoot_date
             FROM albums AS a
                INNER JOIN clients AS c ON c.id = a.client_id
             WHERE a.deleted_at IS NULL
                AND c.deleted_at IS NULL
                AND a.id = ?
                AND a.client_id = ?",
        )
        .bind(album_id)
        .bind(client_id)
        .fetch_one(&*self.db);

        tokio::time::timeout(QUERY_TIMEOUT, query)
            .await
            .map_err(|_| PipelineError::Timeout("loading album"))?
            .map_err(|err| not_found(err, format!("album {album_id} of client {client_id}")))
    }

    async fn list_favorite_keys(
        &self,
        client_id: i64,
        album_id: i64,
    ) -> PipelineResult<Vec<String>> {
        bounded(
            "listing favorites",
            sqlx::query_scalar::<_, String>(
                "SELECT image_path FROM favorites
                 WHERE client_id = ? AND album_id = ?
                 ORDER BY image_path",
            )
            .bind(client_id)
            .bind(album_id)
            .fetch_all(&*self.db),
        )
        .await
    }

    async fn toggle_favorite(
        &self,
        client_id: i64,
        album_id: i64,
        key: &str,
    ) -> PipelineResult<bool> {
        let deleted = bounded(
            "removing favorite",
            sqlx::query(
                "DELETE FROM favorites WHERE client_id = ? AND album_id = ? AND image_path = ?",
            )
            .bind(client_id)
            .bind(album_id)
            .bind(key)
            .execute(&*self.db),
        )
        .await?;

        if deleted.rows_affected() > 0 {
            return Ok(false);
        }

        bounded(
            "adding favorite",
            sqlx::query("INSERT INTO favorites (client_id, album_id, image_path) VALUES (?, ?, ?)")
                .bind(client_id)
                .bind(album_id)
                .bind(key)
                .execute(&*self.db),
        )
        .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn lists_skip_deleted_rows() {
        let env = TestEnv::new().await;
        let alice = env.add_client("Alice", "alice@example.com").await;
        let bob = env.add_client("Bob", "bob@example.com").await;
        sqlx::query("UPDATE clients SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(bob.id)
            .execute(&*env.db)
            .await
            .unwrap();

        let first = env.add_album(&alice, "First", "a.jpg").await;
        let gone = env.add_album(&alice, "Gone", "b.jpg").await;
        sqlx::query("UPDATE albums SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(gone.id)
            .execute(&*env.db)
            .await
            .unwrap();

        let clients = env.catalog.list_clients().await.unwrap();
        assert_eq!(clients, vec![alice.clone()]);

        let albums = env.catalog.list_albums(alice.id).await.unwrap();
        assert_eq!(albums, vec![first]);
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let env = TestEnv::new().await;
        let alice = env.add_client("Alice", "alice@example.com").await;

        assert!(matches!(
            env.catalog.get_client(999).await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            env.catalog.get_album(alice.id, 42).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn toggle_favorite_flips() {
        let env = TestEnv::new().await;
        let alice = env.add_client("Alice", "alice@example.com").await;
        let album = env.add_album(&alice, "Spring Shoot", "a.jpg").await;

        assert!(env.catalog.toggle_favorite(alice.id, album.id, "k/a.jpg").await.unwrap());
        assert_eq!(
            env.catalog.list_favorite_keys(alice.id, album.id).await.unwrap(),
            vec!["k/a.jpg".to_string()]
        );
        assert!(!env.catalog.toggle_favorite(alice.id, album.id, "k/a.jpg").await.unwrap());
        assert!(env
            .catalog
            .list_favorite_keys(alice.id, album.id)
            .await
            .unwrap()
            .is_empty());
    }
}
