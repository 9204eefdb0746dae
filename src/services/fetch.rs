//! Remote URL intake.
//!
//! A remote upload downloads the target into the normal upload pipeline.
//! HEAD and GET share one fixed time budget: the HEAD round-trip is
//! subtracted from what the GET may spend, because upstream proxies evict
//! idle sockets well before a generous separate GET timeout would fire.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// A remote file staged on disk, not yet committed.
#[derive(Debug)]
pub struct FetchedUrl {
    pub tmp_path: PathBuf,
    pub size: u64,
    pub hash: String,
    /// Derived from Content-Disposition or the URL path, lowercased, with
    /// leading dot (may be empty).
    pub extension: String,
    pub mimetype: String,
    /// Filename reported by the remote side, for the `original` column.
    pub original: String,
}

/// Downloads `url` into `<staging_dir>/<provisional>.tmp`, hashing while it
/// streams. The caller owns renaming the staged file once the extension
/// filter has passed.
pub async fn fetch_to_disk(
    client: &reqwest::Client,
    config: &Config,
    url: &str,
    staging_dir: &std::path::Path,
    provisional: &str,
) -> AppResult<FetchedUrl> {
    let target = match &config.url_proxy {
        Some(template) => template.replace("{url}", &urlencoding::encode(url)),
        None => url.to_string(),
    };

    let budget = Duration::from_secs(config.url_fetch_timeout_secs);
    let started = Instant::now();
    let max_size = config.url_max_size_bytes();

    // HEAD first: a Content-Length over the cap fails before any transfer.
    let head = client
        .head(&target)
        .timeout(budget)
        .send()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to reach the URL: {e}")))?;

    if let Some(length) = head.content_length() {
        if length > max_size {
            return Err(AppError::EntityTooLarge(format!(
                "Remote file is {length} bytes, over the {max_size} byte limit"
            )));
        }
    }

    let remaining = budget
        .checked_sub(started.elapsed())
        .ok_or_else(|| AppError::BadRequest("Fetch timed out during HEAD".into()))?;

    let response = client
        .get(&target)
        .timeout(remaining)
        .send()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to fetch the URL: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::BadRequest(format!(
            "Remote server answered with status {}",
            response.status()
        )));
    }

    let mimetype = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "application/octet-stream".into());

    let disposition_name = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition);

    let original = disposition_name
        .or_else(|| filename_from_url(url))
        .unwrap_or_default();
    let extension = extension_of(&original);

    let tmp_path = staging_dir.join(format!("{provisional}.tmp"));
    let mut writer = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| AppError::Internal(format!("staging create failed: {e}")))?;

    let mut hasher = blake3::Hasher::new();
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                remove_staged(&tmp_path).await;
                return Err(AppError::BadRequest(format!("Transfer failed: {e}")));
            }
        };
        written += chunk.len() as u64;
        // The cap still applies when Content-Length lied or was absent.
        if written > max_size {
            remove_staged(&tmp_path).await;
            return Err(AppError::EntityTooLarge(format!(
                "Remote file exceeded the {max_size} byte limit during transfer"
            )));
        }
        hasher.update(&chunk);
        if let Err(e) = writer.write_all(&chunk).await {
            remove_staged(&tmp_path).await;
            return Err(AppError::Internal(format!("staging write failed: {e}")));
        }
    }

    if let Err(e) = writer.flush().await {
        remove_staged(&tmp_path).await;
        return Err(AppError::Internal(format!("staging flush failed: {e}")));
    }

    Ok(FetchedUrl {
        tmp_path,
        size: written,
        hash: hasher.finalize().to_hex().to_string(),
        extension,
        mimetype,
        original,
    })
}

async fn remove_staged(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove staged download {}: {e}", path.display());
        }
    }
}

/// Pulls `filename=` out of a Content-Disposition header. Quoted and bare
/// forms both occur in the wild.
fn filename_from_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(raw) = part.strip_prefix("filename=") {
            let name = raw.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query.rsplit('/').next()?;
    if segment.is_empty() || !segment.contains('.') {
        return None;
    }
    Some(segment.to_string())
}

/// Lowercased extension including the dot; empty when there is none.
/// Compound archive suffixes keep both parts so `x.tar.gz` round-trips.
pub fn extension_of(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let lower = name.to_ascii_lowercase();
    for compound in [".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst"] {
        if lower.ends_with(compound) {
            return compound.to_string();
        }
    }
    match lower.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) => lower[idx..].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_lowercased_and_compound_aware() {
        assert_eq!(extension_of("photo.JPG"), ".jpg");
        assert_eq!(extension_of("archive.tar.gz"), ".tar.gz");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(extension_of(".hidden"), "");
        assert_eq!(extension_of("a/b/c.png"), ".png");
    }

    #[test]
    fn disposition_filename_parsing() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"cat.png\""),
            Some("cat.png".into())
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=plain.bin"),
            Some("plain.bin".into())
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn url_filename_ignores_query_and_bare_paths() {
        assert_eq!(
            filename_from_url("https://x.test/files/img.png?token=1"),
            Some("img.png".into())
        );
        assert_eq!(filename_from_url("https://x.test/files/"), None);
        assert_eq!(filename_from_url("https://x.test/api"), None);
    }
}
