//! Read-only gallery views: an album's images and the home-page previews,
//! each with pre-signed URLs.

use crate::{
    errors::AppError,
    models::{album::Album, object::ObjectEntry},
    services::{layout::AlbumSection, object_store::ListOptions},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tracing::error;

/// Lifetime of every URL handed out by the gallery.
pub const GALLERY_URL_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Serialize, Deserialize)]
pub struct GalleryImage {
    pub key: String,
    pub file_name: String,
    pub original_url: Option<String>,
    /// `None` until the next cache sweep has built the thumbnail.
    pub thumbnail_url: Option<String>,
    pub favorite: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlbumView {
    pub album: Album,
    pub poster_url: Option<String>,
    pub images: Vec<GalleryImage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomePhoto {
    pub file_name: String,
    pub thumbnail_url: Option<String>,
    pub original_url: Option<String>,
}

fn by_file_name(entries: Vec<ObjectEntry>) -> HashMap<String, ObjectEntry> {
    entries
        .into_iter()
        .map(|entry| (entry.file_name().to_string(), entry))
        .collect()
}

/// GET `/clients/{client_id}/albums/{album_id}`
pub async fn album_view(
    State(state): State<AppState>,
    Path((client_id, album_id)): Path<(i64, i64)>,
) -> Result<Json<AlbumView>, AppError> {
    let album = state.catalog.get_album(client_id, album_id).await?;
    let with_urls = ListOptions::default().with_urls(GALLERY_URL_TTL);

    let originals = state
        .store
        .list(
            &state.layout.album_section_prefix(&album, AlbumSection::Originals),
            &with_urls,
        )
        .await?;
    let thumbnails = match state
        .store
        .list(
            &state.layout.album_section_prefix(&album, AlbumSection::Thumbnails),
            &with_urls,
        )
        .await
    {
        Ok(entries) => by_file_name(entries),
        Err(e) => {
            error!(album_id, error = %e, "error getting thumbnail image URLs");
            HashMap::new()
        }
    };
    let favorites = state
        .catalog
        .list_favorite_keys(client_id, album_id)
        .await?;

    let images = originals
        .into_iter()
        .map(|original| {
            let file_name = original.file_name().to_string();
            GalleryImage {
                favorite: favorites.iter().any(|f| f == &original.key),
                thumbnail_url: thumbnails.get(&file_name).and_then(|t| t.url.clone()),
                original_url: original.url,
                key: original.key,
                file_name,
            }
        })
        .collect();

    let poster_url = (!album.poster_image_path.is_empty()).then(|| {
        state.store.presigned_url(
            &state
                .layout
                .album_key(&album, AlbumSection::HeroBanner, &album.poster_image_path),
            GALLERY_URL_TTL,
        )
    });

    Ok(Json(AlbumView {
        album,
        poster_url,
        images,
    }))
}

/// GET `/home/photos`
pub async fn home_photos(State(state): State<AppState>) -> Result<Json<Vec<HomePhoto>>, AppError> {
    let with_urls = ListOptions::default().with_urls(GALLERY_URL_TTL);
    let originals = state
        .store
        .list(&state.layout.home_originals_prefix(), &with_urls)
        .await?;
    let thumbnails = by_file_name(
        state
            .store
            .list(&state.layout.home_thumbnails_prefix(), &with_urls)
            .await?,
    );

    Ok(Json(
        originals
            .into_iter()
            .map(|original| {
                let file_name = original.file_name().to_string();
                HomePhoto {
                    thumbnail_url: thumbnails.get(&file_name).and_then(|t| t.url.clone()),
                    original_url: original.url,
                    file_name,
                }
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::catalog_service::CatalogSource,
        test_support::{TestEnv, jpeg_fixture},
    };

    #[tokio::test]
    async fn album_view_pairs_thumbnails_by_name() {
        let env = TestEnv::new().await;
        let client = env.add_client("Casey", "casey@example.com").await;
        let album = env.add_album(&client, "Spring Shoot", "b.jpg").await;
        let a = env.put_original(&album, "a.jpg", jpeg_fixture(8, 8)).await;
        env.put_original(&album, "b.jpg", jpeg_fixture(8, 8)).await;
        env.put_object(
            &env.layout.album_key(&album, AlbumSection::Thumbnails, "b.jpg"),
            jpeg_fixture(4, 4),
        )
        .await;
        env.catalog
            .toggle_favorite(client.id, album.id, &a)
            .await
            .unwrap();

        let Json(view) = album_view(State(env.app_state()), Path((client.id, album.id)))
            .await
            .unwrap();

        assert_eq!(view.images.len(), 2);
        let a_img = &view.images[0];
        let b_img = &view.images[1];
        assert_eq!(a_img.file_name, "a.jpg");
        assert!(a_img.favorite);
        assert!(a_img.thumbnail_url.is_none());
        assert!(a_img.original_url.as_deref().unwrap().contains("signature="));
        assert!(!b_img.favorite);
        assert!(b_img.thumbnail_url.as_deref().unwrap().contains("/thumbnails/b.jpg?"));
        assert!(view.poster_url.unwrap().contains("/hero-banner/b.jpg?"));
    }

    #[tokio::test]
    async fn home_photos_lists_originals() {
        let env = TestEnv::new().await;
        env.put_object("home-page/original/x.jpg", jpeg_fixture(8, 8)).await;
        env.put_object("home-page/thumbnail/x.jpg", jpeg_fixture(4, 4)).await;

        let Json(photos) = home_photos(State(env.app_state())).await.unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].file_name, "x.jpg");
        assert!(photos[0].thumbnail_url.is_some());
    }
}
