//! Chunked upload sessions.
//!
//! One logical file arrives as several HTTP requests sharing a client UUID.
//! Every chunk is appended to a single `tmp` object under
//! `uploads/chunks/<ip>_<uuid>/`; the session keys are namespaced with the
//! client IP so two clients reusing a UUID cannot touch each other's data.
//!
//! Writes per session are serialized end-to-end by the `processing` flag:
//! a chunk arriving while another is being written is rejected outright
//! instead of queued. The appending worker takes the writer and hasher out
//! of the entry, performs its I/O without the table lock, and puts them
//! back — so the table lock is only ever held for map bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, AppResult};
use crate::services::paths::Paths;

pub struct ChunkCoordinator {
    sessions: Mutex<HashMap<String, ChunkSession>>,
    paths: Paths,
    max_size: u64,
    max_chunks: u32,
    timeout: Duration,
}

struct ChunkSession {
    root: PathBuf,
    tmp_path: PathBuf,
    chunks: u32,
    writer: Option<tokio::fs::File>,
    hasher: Option<blake3::Hasher>,
    processing: bool,
    last_activity: Instant,
}

/// What finalize hands back to the ingest pipeline.
#[derive(Debug)]
pub struct FinishedChunks {
    pub size: u64,
    pub hash: String,
}

impl ChunkCoordinator {
    pub fn new(paths: Paths, max_size: u64, max_chunks: u32, timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            paths,
            max_size,
            max_chunks,
            timeout,
        }
    }

    /// Builds the namespaced session key. Path separators and anything else
    /// hostile in a path segment (IPv6 colons, backslashes) are flattened,
    /// so the key is always a single literal directory name.
    pub fn session_key(ip: &str, uuid: &str) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
                .collect()
        };
        format!("{}_{}", sanitize(ip), sanitize(uuid))
    }

    /// Appends one chunk to the session, creating it on first use.
    ///
    /// Returns `Conflict` when another chunk for the same session is still
    /// being written — parallel chunk uploads per UUID are a client error,
    /// not something to wait out.
    pub async fn append(&self, key: &str, data: &[u8]) -> AppResult<()> {
        let root = self.paths.chunk_dir(key);
        let tmp_path = root.join("tmp");

        let (mut writer, mut hasher) = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(key) {
                Some(session) => {
                    if session.processing {
                        return Err(AppError::Conflict(
                            "Previous chunk for this upload is still being processed".into(),
                        ));
                    }
                    session.processing = true;
                    session.last_activity = Instant::now();
                    (session.writer.take(), session.hasher.take())
                }
                None => {
                    sessions.insert(
                        key.to_string(),
                        ChunkSession {
                            root: root.clone(),
                            tmp_path: tmp_path.clone(),
                            chunks: 0,
                            writer: None,
                            hasher: None,
                            processing: true,
                            last_activity: Instant::now(),
                        },
                    );
                    (None, None)
                }
            }
        };

        // First chunk of a fresh session: create the directory and the
        // append writer outside the table lock.
        if writer.is_none() {
            if let Err(e) = tokio::fs::create_dir_all(&root).await {
                self.cleanup(key).await;
                return Err(AppError::Internal(format!("chunk dir create failed: {e}")));
            }
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&tmp_path)
                .await
            {
                Ok(file) => {
                    writer = Some(file);
                    hasher.get_or_insert_with(blake3::Hasher::new);
                }
                Err(e) => {
                    self.cleanup(key).await;
                    return Err(AppError::Internal(format!("chunk writer open failed: {e}")));
                }
            }
        }

        let mut writer = match writer {
            Some(w) => w,
            // Cleanup raced us and destroyed the session while we were
            // marked as processing.
            None => {
                return Err(AppError::BadRequest("Chunk session no longer exists".into()));
            }
        };

        let write_result = writer.write_all(data).await;
        if let Some(h) = hasher.as_mut() {
            h.update(data);
        }

        let missing = {
            let mut sessions = self.sessions.lock();
            sessions.get_mut(key).is_none()
        };
        if missing {
            // Cleanup raced the write; drop the writer and make sure the
            // directory it may have re-created is gone too.
            drop(writer);
            remove_dir_best_effort(&root).await;
            return Err(AppError::BadRequest("Chunk session no longer exists".into()));
        }

        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(key).expect("checked above");
        session.writer = Some(writer);
        session.hasher = hasher;
        session.processing = false;
        session.last_activity = Instant::now();

        match write_result {
            Ok(()) => {
                session.chunks += 1;
                Ok(())
            }
            Err(e) => {
                drop(sessions);
                self.cleanup(key).await;
                Err(AppError::Internal(format!("chunk write failed: {e}")))
            }
        }
    }

    /// Closes the session and moves the assembled file to `final_path`.
    ///
    /// The session is destroyed on every outcome; a failed finalize does not
    /// leave a resumable session behind.
    pub async fn finalize(
        &self,
        key: &str,
        expected_size: Option<u64>,
        final_path: &Path,
    ) -> AppResult<FinishedChunks> {
        let session = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get(key)
                .ok_or_else(|| AppError::BadRequest("Invalid chunk session".into()))?;
            if session.processing {
                return Err(AppError::Conflict(
                    "A chunk for this upload is still being processed".into(),
                ));
            }
            let invalid_count = session.chunks < 2 || session.chunks > self.max_chunks;
            let session = sessions.remove(key).expect("checked above");
            if invalid_count {
                drop(sessions);
                remove_dir_best_effort(&session.root).await;
                return Err(AppError::BadRequest("Invalid chunks count".into()));
            }
            session
        };

        let root = session.root.clone();
        let result = Self::finish_session(session, expected_size, self.max_size, final_path).await;
        remove_dir_best_effort(&root).await;
        result
    }

    async fn finish_session(
        mut session: ChunkSession,
        expected_size: Option<u64>,
        max_size: u64,
        final_path: &Path,
    ) -> AppResult<FinishedChunks> {
        // Close the writer before touching the file; an open append handle
        // may still have buffered bytes.
        if let Some(mut writer) = session.writer.take() {
            writer
                .flush()
                .await
                .map_err(|e| AppError::Internal(format!("chunk flush failed: {e}")))?;
        }

        let meta = tokio::fs::metadata(&session.tmp_path)
            .await
            .map_err(|e| AppError::Internal(format!("chunk stat failed: {e}")))?;
        let size = meta.len();

        if let Some(expected) = expected_size {
            if size != expected {
                return Err(AppError::BadRequest(format!(
                    "Chunked upload size mismatch: expected {expected} bytes, got {size}"
                )));
            }
        }
        if size > max_size {
            return Err(AppError::EntityTooLarge(format!(
                "File too large: {size} bytes exceeds the {max_size} byte limit"
            )));
        }

        let hash = session
            .hasher
            .take()
            .map(|h| h.finalize().to_hex().to_string())
            .unwrap_or_default();

        move_file(&session.tmp_path, final_path)
            .await
            .map_err(|e| AppError::Internal(format!("chunk move failed: {e}")))?;

        Ok(FinishedChunks { size, hash })
    }

    /// Destroys a session from any state: writer, hasher, directory, entry.
    pub async fn cleanup(&self, key: &str) {
        let session = self.sessions.lock().remove(key);
        if let Some(session) = session {
            let root = session.root.clone();
            drop(session);
            remove_dir_best_effort(&root).await;
        }
    }

    /// Removes sessions idle past the timeout. Called from the background
    /// janitor tick. A session still flagged `processing` after a full
    /// timeout had its append cancelled mid-write (client disconnect) and
    /// is unrecoverable, so staleness alone decides.
    pub async fn sweep_idle(&self) -> usize {
        let stale: Vec<String> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, s)| s.last_activity.elapsed() > self.timeout)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &stale {
            tracing::info!(session = %key, "discarding idle chunk session");
            self.cleanup(key).await;
        }
        stale.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    #[cfg(test)]
    fn force_processing(&self, key: &str) {
        if let Some(s) = self.sessions.lock().get_mut(key) {
            s.processing = true;
        }
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, by: Duration) {
        if let Some(s) = self.sessions.lock().get_mut(key) {
            s.last_activity = Instant::now() - by;
        }
    }
}

async fn remove_dir_best_effort(root: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(root).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove chunk dir {}: {e}", root.display());
        }
    }
}

/// Rename with a copy-then-remove fallback. The fallback handles the
/// cross-filesystem case (uploads root on a different mount than the chunk
/// staging area); if the copy fails too, that error is the real one.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(dir: &Path) -> ChunkCoordinator {
        let paths = Paths::new(dir.join("uploads"));
        paths.init().unwrap();
        ChunkCoordinator::new(paths, 1024 * 1024, 8, Duration::from_secs(1800))
    }

    #[test]
    fn session_keys_are_namespaced_and_sanitized() {
        assert_eq!(ChunkCoordinator::session_key("1.2.3.4", "abc"), "1.2.3.4_abc");
        assert_eq!(
            ChunkCoordinator::session_key("::1", "../../etc"),
            "__1_.._.._etc"
        );
    }

    #[tokio::test]
    async fn chunks_append_and_finalize_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        let key = "ip_abc";

        coord.append(key, b"hello ").await.unwrap();
        coord.append(key, b"world").await.unwrap();

        let final_path = dir.path().join("uploads").join("dest.bin");
        let finished = coord.finalize(key, Some(11), &final_path).await.unwrap();

        assert_eq!(finished.size, 11);
        assert_eq!(finished.hash, blake3::hash(b"hello world").to_hex().to_string());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"hello world");
        // Session and its directory are both gone.
        assert_eq!(coord.active_sessions(), 0);
        assert!(!dir.path().join("uploads/chunks/ip_abc").exists());
    }

    #[tokio::test]
    async fn parallel_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        let key = "ip_busy";

        coord.append(key, b"one").await.unwrap();
        coord.force_processing(key);

        let err = coord.append(key, b"two").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn single_chunk_finalize_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        let key = "ip_one";

        coord.append(key, b"only").await.unwrap();
        let final_path = dir.path().join("uploads").join("x.bin");
        let err = coord.finalize(key, None, &final_path).await.unwrap_err();

        match err {
            AppError::BadRequest(msg) => assert!(msg.contains("Invalid chunks count")),
            other => panic!("unexpected error: {other:?}"),
        }
        // The failed finalize destroyed the session.
        assert_eq!(coord.active_sessions(), 0);
    }

    #[tokio::test]
    async fn size_mismatch_fails_and_destroys_session() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        let key = "ip_sz";

        coord.append(key, b"abc").await.unwrap();
        coord.append(key, b"def").await.unwrap();

        let final_path = dir.path().join("uploads").join("y.bin");
        let err = coord.finalize(key, Some(999), &final_path).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(!final_path.exists());
        assert_eq!(coord.active_sessions(), 0);
    }

    #[tokio::test]
    async fn idle_sessions_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());

        coord.append("ip_idle", b"zzz").await.unwrap();
        coord.append("ip_live", b"zzz").await.unwrap();
        coord.backdate("ip_idle", Duration::from_secs(3600));

        assert_eq!(coord.sweep_idle().await, 1);
        assert_eq!(coord.active_sessions(), 1);
        assert!(!dir.path().join("uploads/chunks/ip_idle").exists());
        assert!(dir.path().join("uploads/chunks/ip_live").exists());
    }

    #[tokio::test]
    async fn stuck_processing_sessions_are_swept_too() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());

        coord.append("ip_stuck", b"zzz").await.unwrap();
        coord.force_processing("ip_stuck");
        coord.backdate("ip_stuck", Duration::from_secs(3600));

        assert_eq!(coord.sweep_idle().await, 1);
        assert_eq!(coord.active_sessions(), 0);
    }

    #[tokio::test]
    async fn cleanup_is_safe_from_any_state() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());

        // Unknown key is a no-op.
        coord.cleanup("ip_missing").await;

        coord.append("ip_gone", b"data").await.unwrap();
        coord.cleanup("ip_gone").await;
        assert_eq!(coord.active_sessions(), 0);
        assert!(!dir.path().join("uploads/chunks/ip_gone").exists());
    }
}
