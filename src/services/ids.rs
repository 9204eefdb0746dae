//! Collision-free public identifier allocation.
//!
//! Two uploads racing for the same random string are arbitrated by a
//! process-wide "on hold" set: a candidate enters the set before the
//! persistence probe and leaves it when the owning request finishes. The
//! release is the `Drop` impl of [`HeldIdentifier`], so it runs on every
//! exit path, including panics and early `?` returns.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct IdStore {
    on_hold: Arc<Mutex<HashSet<String>>>,
    max_tries: u32,
    /// Probe the uploads directory instead of the database. The database
    /// probe also catches collisions between different extensions of one
    /// identifier, which is what keeps thumbnail names unique.
    filesystem_check: bool,
    uploads_root: PathBuf,
}

/// A reserved identifier. Dropping the value releases the reservation.
pub struct HeldIdentifier {
    value: String,
    on_hold: Arc<Mutex<HashSet<String>>>,
}

impl HeldIdentifier {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl Drop for HeldIdentifier {
    fn drop(&mut self) {
        self.on_hold.lock().remove(&self.value);
    }
}

impl IdStore {
    pub fn new(max_tries: u32, filesystem_check: bool, uploads_root: impl Into<PathBuf>) -> Self {
        Self {
            on_hold: Arc::new(Mutex::new(HashSet::new())),
            max_tries,
            filesystem_check,
            uploads_root: uploads_root.into(),
        }
    }

    /// Reserves a public name for a file about to be written as
    /// `<identifier><extension>`. The reservation lives until the returned
    /// guard is dropped; the database row (or its absence) is authoritative
    /// after that.
    pub async fn reserve_file_identifier(
        &self,
        pool: &SqlitePool,
        length: usize,
        extension: &str,
    ) -> AppResult<HeldIdentifier> {
        for _ in 0..self.max_tries {
            let candidate = random_identifier(length);

            {
                let mut held = self.on_hold.lock();
                if !held.insert(candidate.clone()) {
                    continue;
                }
            }

            let taken = if self.filesystem_check {
                self.file_exists_on_disk(&candidate, extension).await?
            } else {
                file_identifier_in_db(pool, &candidate).await?
            };

            if taken {
                self.on_hold.lock().remove(&candidate);
                continue;
            }

            return Ok(HeldIdentifier {
                value: candidate,
                on_hold: Arc::clone(&self.on_hold),
            });
        }

        Err(AppError::IdentifierExhausted)
    }

    /// Reserves a public album identifier. Albums always use the database
    /// probe; they have no on-disk presence until a ZIP is generated.
    pub async fn reserve_album_identifier(
        &self,
        pool: &SqlitePool,
        length: usize,
    ) -> AppResult<HeldIdentifier> {
        for _ in 0..self.max_tries {
            let candidate = random_identifier(length);

            {
                let mut held = self.on_hold.lock();
                if !held.insert(candidate.clone()) {
                    continue;
                }
            }

            let taken =
                sqlx::query_scalar::<_, i64>("SELECT EXISTS(SELECT 1 FROM albums WHERE identifier = ?)")
                    .bind(&candidate)
                    .fetch_one(pool)
                    .await?
                    != 0;

            if taken {
                self.on_hold.lock().remove(&candidate);
                continue;
            }

            return Ok(HeldIdentifier {
                value: candidate,
                on_hold: Arc::clone(&self.on_hold),
            });
        }

        Err(AppError::IdentifierExhausted)
    }

    async fn file_exists_on_disk(&self, identifier: &str, extension: &str) -> AppResult<bool> {
        let path = self.uploads_root.join(format!("{identifier}{extension}"));
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            // A missing file means the identifier is free; anything else is
            // a real filesystem problem and must propagate.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::Internal(format!(
                "identifier probe failed for {}: {e}",
                path.display()
            ))),
        }
    }

    #[cfg(test)]
    pub fn on_hold_len(&self) -> usize {
        self.on_hold.lock().len()
    }
}

/// Any extension of the identifier counts as a collision, so `abcd.png`
/// blocks `abcd.webm` — their thumbnails would otherwise overwrite each
/// other.
async fn file_identifier_in_db(pool: &SqlitePool, identifier: &str) -> AppResult<bool> {
    let pattern = format!("{identifier}.%");
    let exists = sqlx::query_scalar::<_, i64>(
        "SELECT EXISTS(SELECT 1 FROM files WHERE name = ? OR name LIKE ?)",
    )
    .bind(identifier)
    .bind(&pattern)
    .fetch_one(pool)
    .await?;
    Ok(exists != 0)
}

fn random_identifier(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn random_identifiers_are_alphanumeric() {
        let id = random_identifier(32);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn reservation_released_on_drop() {
        let pool = test_pool().await;
        let store = IdStore::new(16, false, "uploads");

        let held = store.reserve_file_identifier(&pool, 8, ".bin").await.unwrap();
        assert_eq!(store.on_hold_len(), 1);
        drop(held);
        assert_eq!(store.on_hold_len(), 0);
    }

    #[tokio::test]
    async fn database_collision_forces_retry() {
        let pool = test_pool().await;
        let store = IdStore::new(256, false, "uploads");

        sqlx::query(
            "INSERT INTO files (name, original, type, size, hash, timestamp) \
             VALUES ('aa.bin', 'a', 'application/octet-stream', 1, '', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        // Identifiers of length 1 give a small space; every reservation must
        // still avoid the `aa` prefix row and every other live hold.
        let held = store.reserve_file_identifier(&pool, 2, ".bin").await.unwrap();
        assert_ne!(held.as_str(), "aa");
    }

    #[tokio::test]
    async fn exhaustion_after_max_tries() {
        let pool = test_pool().await;
        let store = IdStore::new(2000, false, "uploads");

        // Hold the entire length-1 identifier space (62 alphanumerics)…
        let mut guards = Vec::new();
        for _ in 0..62 {
            guards.push(store.reserve_file_identifier(&pool, 1, ".bin").await.unwrap());
        }
        assert_eq!(store.on_hold_len(), 62);

        // …then the next reservation can only fail.
        let short_store = IdStore {
            on_hold: Arc::clone(&store.on_hold),
            max_tries: 100,
            filesystem_check: false,
            uploads_root: "uploads".into(),
        };
        let err = short_store
            .reserve_file_identifier(&pool, 1, ".bin")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IdentifierExhausted));
    }

    #[tokio::test]
    async fn filesystem_probe_treats_missing_as_free() {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let store = IdStore::new(16, true, dir.path());

        let held = store.reserve_file_identifier(&pool, 8, ".png").await.unwrap();

        // Writing the file makes the same identifier collide next time.
        std::fs::write(dir.path().join(format!("{}.png", held.as_str())), b"x").unwrap();
        assert!(store
            .file_exists_on_disk(held.as_str(), ".png")
            .await
            .unwrap());
    }
}
