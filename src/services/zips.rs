//! Album ZIP archives with single-flight generation.
//!
//! Concurrent download requests for the same album coalesce onto one
//! build: the first requester spawns the builder and everyone (including
//! the first) awaits the broadcast result. The on-disk archive is reusable
//! while `zipGeneratedAt > editedAt`; any album mutation flips that
//! predicate and the next request rebuilds.
//!
//! Archives are assembled at a scratch path and renamed into place, so a
//! failed build never leaves a partial ZIP where the server would serve it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::db::models::Album;
use crate::error::{AppError, AppResult};
use crate::AppState;

type BuildResult = Option<Result<(), String>>;

#[derive(Default)]
pub struct AlbumZipper {
    inflight: Mutex<HashMap<String, watch::Receiver<BuildResult>>>,
    builds: AtomicUsize,
}

impl AlbumZipper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total builds performed since startup.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

/// Returns the path of a ZIP covering the album's current contents,
/// building it if the cached one is stale or missing.
pub async fn archive_for(state: &AppState, album: &Album) -> AppResult<PathBuf> {
    let path = state.paths.zip(&album.identifier);

    if album.zip_is_fresh() && tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(path);
    }

    // The size guard runs before the single-flight gate so an oversized
    // album is a client error, not a failed build broadcast to waiters.
    let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM files WHERE albumid = ?")
        .bind(album.id)
        .fetch_one(&state.db)
        .await?;
    if total as u64 > state.config.zip_max_total_size_bytes() {
        return Err(AppError::EntityTooLarge(
            "Album is above the download size limit".into(),
        ));
    }

    let mut rx = {
        let mut inflight = state.zips.inflight.lock();
        match inflight.get(&album.identifier) {
            Some(rx) => rx.clone(),
            None => {
                let (tx, rx) = watch::channel(None);
                inflight.insert(album.identifier.clone(), rx.clone());

                // The build runs detached so a disconnecting requester
                // cannot cancel it for the others.
                let state = state.clone();
                let album = album.clone();
                tokio::spawn(async move {
                    let result = build_archive(&state, &album).await;
                    state.zips.inflight.lock().remove(&album.identifier);
                    if let Err(e) = &result {
                        tracing::error!(album = %album.identifier, "zip build failed: {e}");
                    }
                    // Send after clearing the slot: late arrivals start a
                    // fresh build instead of adopting a finished one.
                    let _ = tx.send(Some(result));
                });
                rx
            }
        }
    };

    loop {
        let outcome = rx.borrow_and_update().clone();
        match outcome {
            Some(Ok(())) => return Ok(path),
            Some(Err(_)) => return Err(AppError::ZipFailed),
            None => {
                if rx.changed().await.is_err() {
                    // Builder dropped without a verdict.
                    return Err(AppError::ZipFailed);
                }
            }
        }
    }
}

async fn build_archive(state: &AppState, album: &Album) -> Result<(), String> {
    state.zips.builds.fetch_add(1, Ordering::Relaxed);

    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM files WHERE albumid = ?")
        .bind(album.id)
        .fetch_all(&state.db)
        .await
        .map_err(|e| format!("listing album files: {e}"))?;

    let final_path = state.paths.zip(&album.identifier);
    let scratch = final_path.with_extension("zip.tmp");
    let entries: Vec<(String, PathBuf)> = names
        .iter()
        .map(|name| (name.clone(), state.paths.file(name)))
        .collect();

    let scratch_for_build = scratch.clone();
    tokio::task::spawn_blocking(move || write_zip(&scratch_for_build, &entries))
        .await
        .map_err(|e| format!("zip task panicked: {e}"))??;

    tokio::fs::rename(&scratch, &final_path)
        .await
        .map_err(|e| format!("zip rename: {e}"))?;

    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE albums SET zipGeneratedAt = ? WHERE id = ?")
        .bind(now)
        .bind(album.id)
        .execute(&state.db)
        .await
        .map_err(|e| format!("zip timestamp update: {e}"))?;

    tracing::info!(album = %album.identifier, files = names.len(), "generated album archive");
    Ok(())
}

/// Writes all entries into one archive. Members are stored uncompressed —
/// uploads are mostly already-compressed media and the archive exists for
/// bundling, not shrinking. Files deleted mid-build are skipped.
fn write_zip(path: &std::path::Path, entries: &[(String, PathBuf)]) -> Result<(), String> {
    let file = std::fs::File::create(path).map_err(|e| format!("zip create: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .large_file(true);

    for (name, source) in entries {
        let mut src = match std::fs::File::open(source) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("skipping vanished album member {name}");
                continue;
            }
            Err(e) => return Err(format!("zip member open {name}: {e}")),
        };
        zip.start_file(name.clone(), options)
            .map_err(|e| format!("zip member start {name}: {e}"))?;
        std::io::copy(&mut src, &mut zip).map_err(|e| format!("zip member copy {name}: {e}"))?;
    }

    zip.finish().map_err(|e| format!("zip finish: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_album(state: &AppState, identifier: &str, edited_at: i64) -> Album {
        sqlx::query(
            "INSERT INTO albums (name, identifier, userid, enabled, public, download, description, timestamp, editedAt, zipGeneratedAt) \
             VALUES ('al', ?, 1, 1, 1, 1, '', 0, ?, 0)",
        )
        .bind(identifier)
        .bind(edited_at)
        .execute(&state.db)
        .await
        .unwrap();
        fetch_album(state, identifier).await
    }

    async fn fetch_album(state: &AppState, identifier: &str) -> Album {
        sqlx::query_as::<_, Album>(
            "SELECT id, name, identifier, userid, enabled, public, download, description, timestamp, editedAt, zipGeneratedAt \
             FROM albums WHERE identifier = ?",
        )
        .bind(identifier)
        .fetch_one(&state.db)
        .await
        .unwrap()
    }

    async fn seed_member(state: &AppState, album: &Album, name: &str, bytes: &[u8]) {
        std::fs::write(state.paths.file(name), bytes).unwrap();
        sqlx::query(
            "INSERT INTO files (name, original, type, size, hash, albumid, timestamp) \
             VALUES (?, ?, 'application/octet-stream', ?, '', ?, 0)",
        )
        .bind(name)
        .bind(name)
        .bind(bytes.len() as i64)
        .bind(album.id)
        .execute(&state.db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn builds_archive_with_all_members() {
        let (state, _dir) = AppState::for_tests().await;
        let album = seed_album(&state, "zipalbum", 100).await;
        seed_member(&state, &album, "one.bin", b"first").await;
        seed_member(&state, &album, "two.bin", b"second").await;

        let path = archive_for(&state, &album).await.unwrap();
        assert!(path.exists());
        assert_eq!(state.zips.build_count(), 1);

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("one.bin").unwrap(), &mut content)
            .unwrap();
        assert_eq!(content, "first");

        // The freshness predicate holds after the build.
        let refreshed = fetch_album(&state, "zipalbum").await;
        assert!(refreshed.zip_is_fresh());
    }

    #[tokio::test]
    async fn fresh_archive_is_reused_without_rebuilding() {
        let (state, _dir) = AppState::for_tests().await;
        let album = seed_album(&state, "reuse001", 100).await;
        seed_member(&state, &album, "only.bin", b"bytes").await;

        archive_for(&state, &album).await.unwrap();
        assert_eq!(state.zips.build_count(), 1);

        let refreshed = fetch_album(&state, "reuse001").await;
        archive_for(&state, &refreshed).await.unwrap();
        assert_eq!(state.zips.build_count(), 1, "fresh zip served from disk");

        // An edit invalidates the cached archive.
        sqlx::query("UPDATE albums SET editedAt = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp() + 10)
            .bind(album.id)
            .execute(&state.db)
            .await
            .unwrap();
        let edited = fetch_album(&state, "reuse001").await;
        archive_for(&state, &edited).await.unwrap();
        assert_eq!(state.zips.build_count(), 2);
    }

    #[tokio::test]
    async fn inflight_build_is_awaited_not_duplicated() {
        let (state, _dir) = AppState::for_tests().await;
        let album = seed_album(&state, "waiters1", 100).await;
        seed_member(&state, &album, "w.bin", b"w").await;

        // Pre-register an in-flight build; the request must await it
        // instead of building.
        let (tx, rx) = watch::channel(None);
        state
            .zips
            .inflight
            .lock()
            .insert("waiters1".to_string(), rx);

        let waiter = {
            let state = state.clone();
            let album = album.clone();
            tokio::spawn(async move { archive_for(&state, &album).await })
        };

        // Resolve the fake build successfully after the waiter subscribed.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        std::fs::write(state.paths.zip("waiters1"), b"fake").unwrap();
        state.zips.inflight.lock().remove("waiters1");
        tx.send(Some(Ok(()))).unwrap();

        let path = waiter.await.unwrap().unwrap();
        assert_eq!(path, state.paths.zip("waiters1"));
        assert_eq!(state.zips.build_count(), 0, "no build of our own");
    }

    #[tokio::test]
    async fn build_failure_propagates_to_waiters() {
        let (state, _dir) = AppState::for_tests().await;
        let album = seed_album(&state, "failing1", 100).await;

        let (tx, rx) = watch::channel(None);
        state
            .zips
            .inflight
            .lock()
            .insert("failing1".to_string(), rx);

        let waiter = {
            let state = state.clone();
            let album = album.clone();
            tokio::spawn(async move { archive_for(&state, &album).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        state.zips.inflight.lock().remove("failing1");
        tx.send(Some(Err("disk full".into()))).unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::ZipFailed));
    }

    #[tokio::test]
    async fn oversized_albums_are_rejected_before_building() {
        let (state, _dir) = AppState::for_tests().await;
        let album = seed_album(&state, "toobig01", 100).await;
        sqlx::query(
            "INSERT INTO files (name, original, type, size, hash, albumid, timestamp) \
             VALUES ('big.bin', 'big.bin', 'application/octet-stream', ?, '', ?, 0)",
        )
        .bind((600u64 * 1024 * 1024) as i64)
        .bind(album.id)
        .execute(&state.db)
        .await
        .unwrap();

        let err = archive_for(&state, &album).await.unwrap_err();
        assert!(matches!(err, AppError::EntityTooLarge(_)));
        assert_eq!(state.zips.build_count(), 0);
    }
}
