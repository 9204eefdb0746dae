//! Thumbnail generation for image uploads.
//!
//! Thumbnails are 200×200 centre-cropped PNGs under `uploads/thumbs/`,
//! keyed by the file's identifier. Generation is fire-and-forget: a failed
//! thumbnail logs a warning and leaves nothing behind, and the file itself
//! is unaffected.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;

use crate::services::paths::Paths;

const THUMB_SIZE: u32 = 200;

/// Extensions the `image` crate can decode reliably enough to thumbnail.
const THUMBNAILABLE: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".tiff", ".tif",
];

pub fn supports(extension: &str) -> bool {
    let ext = extension.to_ascii_lowercase();
    THUMBNAILABLE.contains(&ext.as_str())
}

/// Schedules thumbnail generation for a committed file. Decoding and
/// resizing are CPU-bound, so the work runs on the blocking pool.
pub fn schedule(paths: &Paths, name: &str, identifier: &str) {
    let src = paths.file(name);
    let dest = paths.thumb(identifier);
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || generate(&src, &dest)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("thumbnail generation failed: {e}"),
            Err(e) => tracing::warn!("thumbnail task panicked: {e}"),
        }
    });
}

/// Produces the thumbnail synchronously. Writes to a scratch path first so
/// a failed encode never leaves a truncated PNG at the final location.
pub fn generate(src: &Path, dest: &Path) -> Result<(), String> {
    let img = image::open(src).map_err(|e| format!("decode {}: {e}", src.display()))?;

    let thumb = img.resize_to_fill(THUMB_SIZE, THUMB_SIZE, FilterType::Triangle);

    let scratch: PathBuf = dest.with_extension("png.tmp");
    thumb
        .save_with_format(&scratch, image::ImageFormat::Png)
        .map_err(|e| format!("encode {}: {e}", scratch.display()))?;
    std::fs::rename(&scratch, dest).map_err(|e| {
        let _ = std::fs::remove_file(&scratch);
        format!("rename {}: {e}", dest.display())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_support_is_case_insensitive() {
        assert!(supports(".png"));
        assert!(supports(".JPG"));
        assert!(!supports(".mp4"));
        assert!(!supports(".exe"));
        assert!(!supports(""));
    }

    #[test]
    fn generates_a_square_png() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.png");
        let dest = dir.path().join("out.png");

        // 300×100 solid-colour source.
        let img = image::RgbImage::from_pixel(300, 100, image::Rgb([120, 10, 200]));
        img.save(&src).unwrap();

        generate(&src, &dest).unwrap();

        let thumb = image::open(&dest).unwrap();
        assert_eq!(thumb.width(), THUMB_SIZE);
        assert_eq!(thumb.height(), THUMB_SIZE);
    }

    #[test]
    fn failed_decode_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("junk.png");
        let dest = dir.path().join("out.png");
        std::fs::write(&src, b"not an image").unwrap();

        assert!(generate(&src, &dest).is_err());
        assert!(!dest.exists());
    }
}
