//! HTTP routes.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Client albums**
//!   - `GET  /clients/{client_id}/albums/{album_id}` - album images with signed URLs
//!   - `POST /clients/{client_id}/albums/{album_id}/download-all` - start an archive
//!   - `GET  /clients/{client_id}/downloads/{filename}` - fetch a finished archive
//!   - `GET  /clients/{client_id}/albums/{album_id}/favorites` - list favorites
//!   - `PUT  /clients/{client_id}/albums/{album_id}/favorites?key=` - toggle one
//!
//! - **Home page**
//!   - `GET  /home/photos` - home-page previews with signed URLs
//!
//! - **Objects**
//!   - `GET  /objects/{bucket}/{*key}?expires=&signature=` - pre-signed download
//!
//! The wildcard `*key` allows nested keys like `home-page/thumbnail/a.jpg`.

use crate::{
    handlers::{
        client_handlers::{download_all, download_archive, list_favorites, toggle_favorite},
        gallery_handlers::{album_view, home_photos},
        health_handlers::{healthz, readyz},
        object_handlers::get_presigned_object,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Every handler shares `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Client album routes
        .route("/clients/{client_id}/albums/{album_id}", get(album_view))
        .route(
            "/clients/{client_id}/albums/{album_id}/download-all",
            post(download_all),
        )
        .route(
            "/clients/{client_id}/albums/{album_id}/favorites",
            get(list_favorites).put(toggle_favorite),
        )
        .route(
            "/clients/{client_id}/downloads/{filename}",
            get(download_archive),
        )
        .route("/home/photos", get(home_photos))
        // Object routes
        .route("/objects/{bucket}/{*key}", get(get_presigned_object))
}
