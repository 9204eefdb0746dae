//! Upload ingestion: multipart streams, chunked-session finalization, and
//! remote URL intake all converge here, staging files on disk and handing
//! them to the database writer.
//!
//! Staged files are protected by [`TempFileGuard`]s: the on-disk bytes of a
//! request that fails anywhere between first write and commit are removed
//! by the guards' `Drop`, so no error path needs its own cleanup code.

use std::path::PathBuf;

use axum::extract::Multipart;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::Config;
use crate::db::models::{UploadedFile, User};
use crate::error::{AppError, AppResult};
use crate::services::chunks::ChunkCoordinator;
use crate::services::fetch::{self, extension_of};
use crate::services::scan::{aggregate_verdicts, ScanVerdict};
use crate::services::store;
use crate::AppState;

/// Per-request upload parameters, resolved from headers before the body is
/// consumed.
#[derive(Debug, Default)]
pub struct UploadContext {
    pub user: Option<User>,
    pub ip: String,
    pub albumid: Option<i64>,
    pub age: Option<f64>,
    pub filelength: Option<usize>,
    pub strip_tags: bool,
}

impl UploadContext {
    pub fn rank(&self) -> Option<i64> {
        self.user.as_ref().map(|u| u.permission)
    }

    pub fn userid(&self) -> Option<i64> {
        self.user.as_ref().map(|u| u.id)
    }
}

/// A file written to its final path but not yet present in the database.
pub struct StagedFile {
    pub guard: TempFileGuard,
    /// Reservation for the public identifier; released when the staged file
    /// is committed (or abandoned).
    _held: Option<crate::services::ids::HeldIdentifier>,
    pub name: String,
    pub original: String,
    pub mimetype: String,
    pub size: i64,
    pub hash: String,
    pub albumid: Option<i64>,
    pub age: Option<f64>,
    pub verdict: Option<ScanVerdict>,
}

/// Removes the file at `path` on drop unless disarmed. Dropping the guard
/// is how every failure path between staging and commit cleans up.
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
impl StagedFile {
    /// Bare staged file for exercising the commit stage directly.
    pub fn for_tests(
        guard: TempFileGuard,
        name: String,
        size: i64,
        hash: String,
        albumid: Option<i64>,
    ) -> Self {
        Self {
            guard,
            _held: None,
            original: name.clone(),
            name,
            mimetype: "application/octet-stream".into(),
            size,
            hash,
            albumid,
            age: None,
            verdict: None,
        }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove staged file {}: {e}", self.path.display());
                }
            }
        }
    }
}

// ─── Multipart intake ─────────────────────────────────────────────────────────

/// Drives one multipart upload request.
///
/// When the request carries a chunk UUID, file fields append to the chunk
/// session and the returned list is empty — rows are only written at
/// `finishchunks`. Otherwise every file field is streamed to disk, hashed,
/// optionally scanned inline, and committed.
pub async fn process_multipart(
    state: &AppState,
    mut ctx: UploadContext,
    mut multipart: Multipart,
) -> AppResult<Vec<UploadedFile>> {
    let age = resolve_age(state, ctx.rank(), ctx.age)?;
    ctx.age = age;

    let mut staged: Vec<StagedFile> = Vec::new();
    let mut chunk_uuid: Option<String> = None;
    let mut field_count = 0usize;
    let mut file_count = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let raw_name = field.name().unwrap_or("").to_string();
        // Dropzone-style clients prefix their auxiliary fields with "dz".
        let key = raw_name.strip_prefix("dz").unwrap_or(&raw_name).to_string();

        if key == "files[]" || key == "files" {
            file_count += 1;
            if file_count > state.config.max_files_per_upload {
                return Err(AppError::BadRequest(format!(
                    "Maximum of {} files per upload",
                    state.config.max_files_per_upload
                )));
            }

            match &chunk_uuid {
                Some(uuid) => append_chunk(state, &ctx, uuid, field).await?,
                None => staged.push(stage_stream_field(state, &ctx, field).await?),
            }
        } else {
            field_count += 1;
            if field_count > state.config.max_fields_per_upload {
                return Err(AppError::BadRequest(format!(
                    "Maximum of {} fields per upload",
                    state.config.max_fields_per_upload
                )));
            }

            let value = field
                .text()
                .await
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            match key.as_str() {
                // Must arrive before its file field; chunk-mode selection
                // depends on it.
                "uuid" => chunk_uuid = Some(value),
                // Chunks may arrive out of order; the index is accepted but
                // the session appends in arrival order.
                "chunkindex" | "chunkbyteoffset" | "totalchunkcount" | "totalfilesize" => {}
                _ => {}
            }
        }
    }

    if chunk_uuid.is_some() {
        // Chunk posts answer with a bare success; the files appear in the
        // finishchunks response.
        return Ok(Vec::new());
    }

    if staged.is_empty() {
        return Err(AppError::BadRequest("No files to upload".into()));
    }

    run_scan_gate(state, &ctx, &mut staged).await?;
    strip_tags_if_requested(state, &ctx, &mut staged).await?;
    store::commit_files(state, &ctx, staged).await
}

/// Buffers one HTTP chunk body and appends it to the session. The buffer is
/// bounded by the advertised chunk size; the session's total is enforced at
/// finalize.
async fn append_chunk(
    state: &AppState,
    ctx: &UploadContext,
    uuid: &str,
    mut field: axum::extract::multipart::Field<'_>,
) -> AppResult<()> {
    let cap = state.config.chunk_size_bytes() as usize;
    let mut buf: Vec<u8> = Vec::new();

    while let Some(bytes) = field
        .chunk()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        if buf.len() + bytes.len() > cap {
            return Err(AppError::EntityTooLarge(format!(
                "Chunk exceeds the advertised {cap} byte chunk size"
            )));
        }
        buf.extend_from_slice(&bytes);
    }

    let key = ChunkCoordinator::session_key(&ctx.ip, uuid);
    state.chunks.append(&key, &buf).await
}

/// Streams one multipart file field to its final path, hashing as a side
/// tap and scanning inline when the scanner allows passthrough for this
/// caller. Resolves only when the writer has flushed *and* the scanner has
/// produced a verdict.
async fn stage_stream_field(
    state: &AppState,
    ctx: &UploadContext,
    mut field: axum::extract::multipart::Field<'_>,
) -> AppResult<StagedFile> {
    let original = field.file_name().unwrap_or("").to_string();
    let extension = extension_of(&original);

    if !extension_allowed(&state.config, &extension, false) {
        return Err(AppError::BadRequest(format!(
            "{} files are not permitted",
            display_extension(&extension)
        )));
    }

    let mimetype = field
        .content_type()
        .map(|s| s.to_string())
        .unwrap_or_else(|| fallback_mimetype(&state.config, &extension));

    let length = state.config.clamp_identifier_length(ctx.filelength);
    let held = state
        .ids
        .reserve_file_identifier(&state.db, length, &extension)
        .await?;
    let name = format!("{}{}", held.as_str(), extension);
    let path = state.paths.file(&name);

    let mut writer = tokio::fs::File::create(&path)
        .await
        .map_err(|e| AppError::Internal(format!("upload create failed: {e}")))?;
    let guard = TempFileGuard::new(path.clone());

    // Passthrough scanning is decided per file: the size-based bypass can
    // only apply post-hoc because nothing is known about the size yet.
    let mut scan_stream = match &state.scanner {
        Some(scanner) if !scanner.should_bypass(ctx.rank(), &extension, 0) => {
            Some(scanner.begin_stream().await?)
        }
        _ => None,
    };

    let mut hasher = blake3::Hasher::new();
    let mut size: u64 = 0;
    let max_size = state.config.max_size_bytes();

    while let Some(bytes) = field
        .chunk()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        size += bytes.len() as u64;
        if size > max_size {
            return Err(AppError::EntityTooLarge(format!(
                "File too large: limit is {} MB",
                state.config.max_size_mb
            )));
        }
        hasher.update(&bytes);
        if let Some(scan) = scan_stream.as_mut() {
            scan.update(&bytes).await?;
        }
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| AppError::Internal(format!("upload write failed: {e}")))?;
    }

    // Both units must land: the writer's flush and the scanner's verdict.
    let verdict = match scan_stream.take() {
        Some(scan) => {
            let (flushed, verdict) = tokio::join!(writer.flush(), scan.finish());
            flushed.map_err(|e| AppError::Internal(format!("upload flush failed: {e}")))?;
            Some(verdict?)
        }
        None => {
            writer
                .flush()
                .await
                .map_err(|e| AppError::Internal(format!("upload flush failed: {e}")))?;
            None
        }
    };

    if size == 0 && state.config.filter_empty_file {
        return Err(AppError::BadRequest("Empty files are not allowed".into()));
    }

    Ok(StagedFile {
        guard,
        _held: Some(held),
        original: if original.is_empty() { name.clone() } else { original },
        name,
        mimetype,
        size: size as i64,
        hash: hasher.finalize().to_hex().to_string(),
        albumid: ctx.albumid,
        age: ctx.age,
        verdict,
    })
}

// ─── Chunked-session finalization ─────────────────────────────────────────────

/// Turns finished chunk sessions into committed rows. Every entry names a
/// session by client UUID; a failure on any entry fails the whole request
/// and the guards discard the files finalized so far.
pub async fn finish_chunks(
    state: &AppState,
    ctx: &UploadContext,
    entries: Vec<crate::db::models::FinishChunksEntry>,
) -> AppResult<Vec<UploadedFile>> {
    if entries.is_empty() {
        return Err(AppError::BadRequest("No files to finalize".into()));
    }
    if entries.len() > state.config.max_files_per_upload {
        return Err(AppError::BadRequest(format!(
            "Maximum of {} files per upload",
            state.config.max_files_per_upload
        )));
    }

    let mut staged: Vec<StagedFile> = Vec::new();

    for entry in entries {
        let original = entry.original.clone().unwrap_or_default();
        let extension = extension_of(&original);

        if !extension_allowed(&state.config, &extension, false) {
            return Err(AppError::BadRequest(format!(
                "{} files are not permitted",
                display_extension(&extension)
            )));
        }

        let age = resolve_age(state, ctx.rank(), entry.age.or(ctx.age))?;

        let length = state.config.clamp_identifier_length(entry.filelength.or(ctx.filelength));
        let held = state
            .ids
            .reserve_file_identifier(&state.db, length, &extension)
            .await?;
        let name = format!("{}{}", held.as_str(), extension);
        let path = state.paths.file(&name);

        let key = ChunkCoordinator::session_key(&ctx.ip, &entry.uuid);
        let expected = entry.size.and_then(|s| u64::try_from(s).ok());
        let finished = state.chunks.finalize(&key, expected, &path).await?;
        let guard = TempFileGuard::new(path);

        if finished.size == 0 && state.config.filter_empty_file {
            return Err(AppError::BadRequest("Empty files are not allowed".into()));
        }

        let mimetype = entry
            .mimetype
            .clone()
            .unwrap_or_else(|| fallback_mimetype(&state.config, &extension));

        staged.push(StagedFile {
            guard,
            _held: Some(held),
            original: if original.is_empty() { name.clone() } else { original },
            name,
            mimetype,
            size: finished.size as i64,
            hash: finished.hash,
            albumid: entry.albumid.or(ctx.albumid),
            age,
            verdict: None,
        });
    }

    run_scan_gate(state, ctx, &mut staged).await?;
    strip_tags_if_requested(state, ctx, &mut staged).await?;
    store::commit_files(state, ctx, staged).await
}

// ─── URL intake ───────────────────────────────────────────────────────────────

pub async fn process_urls(
    state: &AppState,
    ctx: &UploadContext,
    urls: Vec<String>,
) -> AppResult<Vec<UploadedFile>> {
    if !state.config.url_uploads_enabled {
        return Err(AppError::Forbidden);
    }
    if urls.is_empty() {
        return Err(AppError::BadRequest("No URLs to upload".into()));
    }
    if urls.len() > state.config.max_files_per_upload {
        return Err(AppError::BadRequest(format!(
            "Maximum of {} files per upload",
            state.config.max_files_per_upload
        )));
    }

    let age = resolve_age(state, ctx.rank(), ctx.age)?;
    let mut staged: Vec<StagedFile> = Vec::new();

    for url in urls {
        let length = state.config.clamp_identifier_length(ctx.filelength);
        let held = state
            .ids
            .reserve_file_identifier(&state.db, length, "")
            .await?;

        let fetched = fetch::fetch_to_disk(
            &state.http_client,
            &state.config,
            &url,
            state.paths.uploads(),
            held.as_str(),
        )
        .await?;

        // The real extension is only known after the transfer; re-check the
        // filter with the URL-specific lists before the file gets a name.
        let mut tmp_guard = TempFileGuard::new(fetched.tmp_path.clone());
        if !extension_allowed(&state.config, &fetched.extension, true) {
            return Err(AppError::BadRequest(format!(
                "{} files are not permitted for URL uploads",
                display_extension(&fetched.extension)
            )));
        }

        if fetched.size == 0 && state.config.filter_empty_file {
            return Err(AppError::BadRequest("Empty files are not allowed".into()));
        }

        let name = format!("{}{}", held.as_str(), fetched.extension);
        let path = state.paths.file(&name);
        tokio::fs::rename(&fetched.tmp_path, &path)
            .await
            .map_err(|e| AppError::Internal(format!("staging rename failed: {e}")))?;
        tmp_guard.disarm();

        staged.push(StagedFile {
            guard: TempFileGuard::new(path),
            _held: Some(held),
            original: if fetched.original.is_empty() { name.clone() } else { fetched.original },
            name,
            mimetype: fetched.mimetype,
            size: fetched.size as i64,
            hash: fetched.hash,
            albumid: ctx.albumid,
            age,
            verdict: None,
        });
    }

    run_scan_gate(state, ctx, &mut staged).await?;
    strip_tags_if_requested(state, ctx, &mut staged).await?;
    store::commit_files(state, ctx, staged).await
}

// ─── Shared post-stream stages ────────────────────────────────────────────────

/// Applies the scanner gate: files without a passthrough verdict are
/// scanned from disk, then all verdicts aggregate into a single rejection
/// when anything is infected or unscannable.
async fn run_scan_gate(
    state: &AppState,
    ctx: &UploadContext,
    staged: &mut [StagedFile],
) -> AppResult<()> {
    let scanner = match &state.scanner {
        Some(scanner) => scanner,
        None => return Ok(()),
    };

    let mut results: Vec<(String, ScanVerdict)> = Vec::new();
    for file in staged.iter_mut() {
        let verdict = match file.verdict.take() {
            Some(verdict) => verdict,
            None => {
                let ext = extension_of(&file.name);
                if scanner.should_bypass(ctx.rank(), &ext, file.size as u64) {
                    continue;
                }
                scanner.scan_path(file.guard.path()).await?
            }
        };
        results.push((file.original.clone(), verdict));
    }

    if let Some(message) = aggregate_verdicts(&results) {
        // Guards on the staged files remove everything on return.
        return Err(AppError::BadRequest(message));
    }
    Ok(())
}

/// Rewrites image files in place to shed their metadata. A decode/re-encode
/// cycle drops EXIF, XMP and ancillary chunks; hash and size are refreshed
/// afterwards so the committed row matches the bytes on disk.
async fn strip_tags_if_requested(
    state: &AppState,
    ctx: &UploadContext,
    staged: &mut [StagedFile],
) -> AppResult<()> {
    if !ctx.strip_tags || !state.config.strip_tags_enabled {
        return Ok(());
    }

    for file in staged.iter_mut() {
        let extension = extension_of(&file.name);
        if !strippable(&state.config, &extension) {
            continue;
        }

        let path = file.guard.path().to_path_buf();
        let rewrite = tokio::task::spawn_blocking(move || strip_file_metadata(&path))
            .await
            .map_err(|e| AppError::Internal(format!("strip task panicked: {e}")))?;
        if let Err(e) = rewrite {
            tracing::error!("tag strip failed for {}: {e}", file.name);
            return Err(AppError::StripFailed);
        }

        let (size, hash) = rehash_file(file.guard.path()).await?;
        file.size = size as i64;
        file.hash = hash;
    }
    Ok(())
}

fn strippable(config: &Config, extension: &str) -> bool {
    const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".tiff"];
    let ext = extension.to_ascii_lowercase();
    IMAGE_EXTS.contains(&ext.as_str())
        && !config
            .strip_tags_blacklist
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&ext))
}

fn strip_file_metadata(path: &std::path::Path) -> Result<(), String> {
    let format = image::ImageFormat::from_path(path).map_err(|e| e.to_string())?;
    let img = image::open(path).map_err(|e| e.to_string())?;
    let scratch = path.with_extension("strip.tmp");
    img.save_with_format(&scratch, format)
        .map_err(|e| e.to_string())?;
    std::fs::rename(&scratch, path).map_err(|e| {
        let _ = std::fs::remove_file(&scratch);
        e.to_string()
    })
}

async fn rehash_file(path: &std::path::Path) -> AppResult<(u64, String)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AppError::Internal(format!("rehash open failed: {e}")))?;
    let mut hasher = blake3::Hasher::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| AppError::Internal(format!("rehash read failed: {e}")))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, hasher.finalize().to_hex().to_string()))
}

// ─── Small shared helpers ─────────────────────────────────────────────────────

/// Validates and resolves the effective retention age. `None` means
/// permanent; an explicit 0 also means permanent.
pub fn resolve_age(
    state: &AppState,
    rank: Option<i64>,
    requested: Option<f64>,
) -> AppResult<Option<f64>> {
    let age = match requested {
        Some(age) => {
            if !state.retention.validate(rank, age) {
                return Err(AppError::BadRequest("Invalid temporary upload age".into()));
            }
            age
        }
        None => state.retention.default_for(rank).unwrap_or(0.0),
    };
    Ok(if age > 0.0 { Some(age) } else { None })
}

pub fn extension_allowed(config: &Config, extension: &str, url_mode: bool) -> bool {
    let mode = if url_mode {
        config
            .url_extension_filter_mode
            .as_deref()
            .unwrap_or(&config.extension_filter_mode)
    } else {
        &config.extension_filter_mode
    };
    let list = if url_mode {
        config
            .url_extension_filter
            .as_ref()
            .unwrap_or(&config.extension_filter)
    } else {
        &config.extension_filter
    };

    let listed = list.iter().any(|e| e.eq_ignore_ascii_case(extension));
    match mode {
        "whitelist" => listed,
        _ => !listed,
    }
}

fn display_extension(extension: &str) -> &str {
    if extension.is_empty() {
        "Extensionless"
    } else {
        extension
    }
}

/// Minimal extension→MIME table for the `mime_from_extension` option.
fn fallback_mimetype(config: &Config, extension: &str) -> String {
    if config.mime_from_extension {
        let known = match extension.to_ascii_lowercase().as_str() {
            ".png" => Some("image/png"),
            ".jpg" | ".jpeg" => Some("image/jpeg"),
            ".gif" => Some("image/gif"),
            ".webp" => Some("image/webp"),
            ".mp4" => Some("video/mp4"),
            ".webm" => Some("video/webm"),
            ".mp3" => Some("audio/mpeg"),
            ".ogg" => Some("audio/ogg"),
            ".txt" => Some("text/plain"),
            ".pdf" => Some("application/pdf"),
            ".zip" => Some("application/zip"),
            _ => None,
        };
        if let Some(mime) = known {
            return mime.to_string();
        }
    }
    "application/octet-stream".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_file_guard_removes_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();

        let removed = dir.path().join("a.bin");
        std::fs::write(&removed, b"x").unwrap();
        drop(TempFileGuard::new(removed.clone()));
        assert!(!removed.exists());

        let kept = dir.path().join("b.bin");
        std::fs::write(&kept, b"x").unwrap();
        let mut guard = TempFileGuard::new(kept.clone());
        guard.disarm();
        drop(guard);
        assert!(kept.exists());
    }

    #[test]
    fn blacklist_rejects_listed_extensions() {
        let config = Config::test_defaults();
        assert!(!extension_allowed(&config, ".exe", false));
        assert!(!extension_allowed(&config, ".EXE", false));
        assert!(extension_allowed(&config, ".png", false));
        assert!(extension_allowed(&config, "", false));
    }

    #[test]
    fn whitelist_only_accepts_listed_extensions() {
        let mut config = Config::test_defaults();
        config.extension_filter_mode = "whitelist".into();
        config.extension_filter = vec![".png".into(), ".jpg".into()];
        assert!(extension_allowed(&config, ".png", false));
        assert!(!extension_allowed(&config, ".exe", false));
        assert!(!extension_allowed(&config, "", false));
    }

    #[test]
    fn url_filter_falls_back_to_main_filter() {
        let mut config = Config::test_defaults();
        assert!(!extension_allowed(&config, ".exe", true));

        config.url_extension_filter_mode = Some("whitelist".into());
        config.url_extension_filter = Some(vec![".png".into()]);
        assert!(extension_allowed(&config, ".png", true));
        assert!(!extension_allowed(&config, ".gif", true));
        // The main filter is untouched.
        assert!(extension_allowed(&config, ".gif", false));
    }

    #[test]
    fn mime_fallback_honours_config_flag() {
        let mut config = Config::test_defaults();
        assert_eq!(fallback_mimetype(&config, ".png"), "application/octet-stream");
        config.mime_from_extension = true;
        assert_eq!(fallback_mimetype(&config, ".png"), "image/png");
        assert_eq!(fallback_mimetype(&config, ".xyz"), "application/octet-stream");
    }

    #[test]
    fn strippable_respects_blacklist() {
        let mut config = Config::test_defaults();
        assert!(strippable(&config, ".jpg"));
        assert!(!strippable(&config, ".mp4"));
        config.strip_tags_blacklist = vec![".gif".into()];
        assert!(!strippable(&config, ".gif"));
        assert!(strippable(&config, ".png"));
    }
}
