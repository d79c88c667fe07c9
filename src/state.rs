//! Shared state handed to every HTTP handler.

use crate::services::{
    archive_service::ArchiveService,
    catalog_service::CatalogSource,
    layout::KeyLayout,
    object_store::{ObjectStore, UrlSigner},
    storage_service::StorageService,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub bucket: String,
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn CatalogSource>,
    pub archives: ArchiveService,
    pub signer: UrlSigner,
    pub layout: KeyLayout,
}
