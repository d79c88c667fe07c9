//! Object key conventions.
//!
//! Album objects: `{clients_folder}/{client_id}/{album_id}/{section}/{file}`.
//! Home-page previews: `{home_folder}/{original|thumbnail}/{file}`.

use crate::models::album::Album;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumSection {
    Originals,
    Thumbnails,
    HeroBanner,
    Downloads,
}

impl AlbumSection {
    pub fn as_str(self) -> &'static str {
        match self {
            AlbumSection::Originals => "originals",
            AlbumSection::Thumbnails => "thumbnails",
            AlbumSection::HeroBanner => "hero-banner",
            AlbumSection::Downloads => "downloads",
        }
    }
}

impl fmt::Display for AlbumSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub clients_folder: String,
    pub home_folder: String,
}

impl KeyLayout {
    pub fn new(clients_folder: impl Into<String>, home_folder: impl Into<String>) -> Self {
        Self {
            clients_folder: clients_folder.into().trim_matches('/').to_string(),
            home_folder: home_folder.into().trim_matches('/').to_string(),
        }
    }

    /// Listing prefix of one section, with a trailing `/` so album 7 never
    /// matches album 70.
    pub fn section_prefix(&self, client_id: i64, album_id: i64, section: AlbumSection) -> String {
        format!(
            "{}/{}/{}/{}/",
            self.clients_folder, client_id, album_id, section
        )
    }

    pub fn album_section_prefix(&self, album: &Album, section: AlbumSection) -> String {
        self.section_prefix(album.client_id, album.id, section)
    }

    pub fn album_key(&self, album: &Album, section: AlbumSection, file_name: &str) -> String {
        format!("{}{}", self.album_section_prefix(album, section), file_name)
    }

    pub fn home_originals_prefix(&self) -> String {
        format!("{}/original/", self.home_folder)
    }

    pub fn home_thumbnails_prefix(&self) -> String {
        format!("{}/thumbnail/", self.home_folder)
    }

    pub fn home_thumbnail_key(&self, file_name: &str) -> String {
        format!("{}{}", self.home_thumbnails_prefix(), file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album() -> Album {
        Album {
            id: 7,
            client_id: 3,
            name: "Spring Shoot".into(),
            poster_image_path: "p.jpg".into(),
            shoot_date: None,
        }
    }

    #[test]
    fn album_keys() {
        let layout = KeyLayout::new("clients/", "home-page");
        assert_eq!(
            layout.album_key(&album(), AlbumSection::HeroBanner, "p.jpg"),
            "clients/3/7/hero-banner/p.jpg"
        );
        assert_eq!(
            layout.album_section_prefix(&album(), AlbumSection::Originals),
            "clients/3/7/originals/"
        );
    }

    #[test]
    fn home_keys() {
        let layout = KeyLayout::new("clients", "/home-page/");
        assert_eq!(layout.home_originals_prefix(), "home-page/original/");
        assert_eq!(layout.home_thumbnail_key("a.jpg"), "home-page/thumbnail/a.jpg");
    }
}
