//! Image transcoder: decode, scale the longest edge to a target, re-encode
//! as JPEG.
//!
//! Pure and synchronous. Callers on the async runtime wrap it in
//! `spawn_blocking`.

use crate::errors::{PipelineError, PipelineResult};
use image::{DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};

/// JPEG quality of every derived asset.
pub const JPEG_QUALITY: u8 = 85;

/// Longest edge of album thumbnails.
pub const THUMBNAIL_EDGE: u32 = 400;
/// Longest edge of album hero banners.
pub const HERO_BANNER_EDGE: u32 = 400;
/// Longest edge of home-page previews.
pub const HOME_PREVIEW_EDGE: u32 = 300;

/// Target dimensions so that the longer side equals `max_edge`.
///
/// Landscape images pin the width, portrait and square images the height.
/// Smaller sources are scaled up.
pub fn target_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width > height {
        let scaled = (height as f64 * (max_edge as f64 / width as f64)) as u32;
        (max_edge, scaled.max(1))
    } else {
        let scaled = (width as f64 * (max_edge as f64 / height.max(1) as f64)) as u32;
        (scaled.max(1), max_edge)
    }
}

/// Decode `source`, resize to `max_edge` with Lanczos3 and encode as JPEG.
pub fn resize(source: &[u8], max_edge: u32) -> PipelineResult<Vec<u8>> {
    let img = image::load_from_memory(source).map_err(|e| PipelineError::Decode(e.to_string()))?;
    let resized = resize_image(&img, max_edge);
    encode_jpeg(&resized)
}

fn resize_image(img: &DynamicImage, max_edge: u32) -> DynamicImage {
    let (width, height) = target_dimensions(img.width(), img.height(), max_edge);
    img.resize_exact(width, height, FilterType::Lanczos3)
}

/// JPEG has no alpha channel, so everything is flattened to RGB8 first.
pub fn encode_jpeg(img: &DynamicImage) -> PipelineResult<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| PipelineError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::jpeg_fixture;

    #[test]
    fn landscape_pins_width() {
        assert_eq!(target_dimensions(800, 600, 400), (400, 300));
    }

    #[test]
    fn portrait_and_square_pin_height() {
        assert_eq!(target_dimensions(600, 900, 300), (200, 300));
        assert_eq!(target_dimensions(500, 500, 400), (400, 400));
    }

    #[test]
    fn small_sources_are_upscaled() {
        assert_eq!(target_dimensions(100, 50, 400), (400, 200));
    }

    #[test]
    fn extreme_aspect_never_hits_zero() {
        assert_eq!(target_dimensions(10_000, 1, 400), (400, 1));
    }

    #[test]
    fn resize_produces_jpeg_of_target_size() {
        let source = jpeg_fixture(800, 600);
        let out = resize(&source, THUMBNAIL_EDGE).unwrap();

        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 300));
        assert_eq!(
            image::guess_format(&out).unwrap(),
            image::ImageFormat::Jpeg
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = resize(b"definitely not an image", 400).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }
}
