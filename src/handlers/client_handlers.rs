//! Client-facing album endpoints: archive requests and downloads, favorites.

use super::object_handlers::stream_object;
use crate::{
    errors::AppError,
    models::object::base_name,
    services::{archive_service::parse_album_id, layout::AlbumSection},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadStarted {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FavoritesResponse {
    pub favorites: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct FavoriteQuery {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FavoriteToggled {
    pub key: String,
    pub favorite: bool,
}

/// POST `/clients/{client_id}/albums/{album_id}/download-all`
pub async fn download_all(
    State(state): State<AppState>,
    Path((client_id, album_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let client = state.catalog.get_client(client_id).await?;
    let album = state.catalog.get_album(client_id, album_id).await?;

    let job_id = state
        .archives
        .create_archive_async(&album, &client)
        .await
        .map_err(|e| {
            error!(album_id, error = %e, "failed to start archive creation");
            AppError::internal("failed to start download preparation")
        })?;

    Ok((StatusCode::ACCEPTED, Json(DownloadStarted { job_id })))
}

/// GET `/clients/{client_id}/downloads/{filename}`
pub async fn download_archive(
    State(state): State<AppState>,
    Path((client_id, filename)): Path<(i64, String)>,
) -> Result<Response, AppError> {
    let file_name = base_name(&filename);
    let album_id =
        parse_album_id(file_name).ok_or_else(|| AppError::bad_request("invalid download link"))?;

    let key = format!(
        "{}{}",
        state
            .layout
            .section_prefix(client_id, album_id, AlbumSection::Downloads),
        file_name
    );
    info!(key = %key, client_id, "serving archive download");

    stream_object(&state, &state.bucket, &key, Some(file_name))
        .await
        .map_err(|e| match e.status {
            StatusCode::NOT_FOUND => AppError::not_found("download file not found"),
            _ => e,
        })
}

/// GET `/clients/{client_id}/albums/{album_id}/favorites`
pub async fn list_favorites(
    State(state): State<AppState>,
    Path((client_id, album_id)): Path<(i64, i64)>,
) -> Result<Json<FavoritesResponse>, AppError> {
    state.catalog.get_album(client_id, album_id).await?;
    let favorites = state
        .catalog
        .list_favorite_keys(client_id, album_id)
        .await?;
    Ok(Json(FavoritesResponse { favorites }))
}

/// PUT `/clients/{client_id}/albums/{album_id}/favorites?key=`
pub async fn toggle_favorite(
    State(state): State<AppState>,
    Path((client_id, album_id)): Path<(i64, i64)>,
    Query(q): Query<FavoriteQuery>,
) -> Result<Json<FavoriteToggled>, AppError> {
    if q.key.trim().is_empty() {
        return Err(AppError::bad_request("key is required"));
    }
    state.catalog.get_album(client_id, album_id).await?;

    let favorite = state
        .catalog
        .toggle_favorite(client_id, album_id, &q.key)
        .await?;
    Ok(Json(FavoriteToggled {
        key: q.key,
        favorite,
    }))
}
