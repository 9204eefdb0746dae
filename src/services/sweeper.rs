//! Periodic deletion of expired uploads.
//!
//! A single flag keeps sweeps from overlapping: if a tick fires while the
//! previous sweep is still deleting, it is skipped entirely rather than
//! queued. Failures are logged and the ticker carries on.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::db::models::{perms, User};
use crate::error::AppResult;
use crate::services::deleter::{self, DeleteField};
use crate::AppState;

#[derive(Default)]
pub struct RetentionSweeper {
    in_progress: AtomicBool,
}

impl RetentionSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one sweep unless another is still in flight. Returns the number
    /// of expired rows handed to the deleter, or `None` when skipped.
    pub async fn tick(&self, state: &AppState) -> Option<usize> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            tracing::debug!("retention sweep already in progress, skipping tick");
            return None;
        }

        let result = self.sweep(state).await;
        self.in_progress.store(false, Ordering::SeqCst);

        match result {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::error!("retention sweep failed: {e}");
                Some(0)
            }
        }
    }

    async fn sweep(&self, state: &AppState) -> AppResult<usize> {
        let now = chrono::Utc::now().timestamp();
        let expired: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM files WHERE expirydate IS NOT NULL AND expirydate <= ?",
        )
        .bind(now)
        .fetch_all(&state.db)
        .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        // Expiry is enforced server-side, so the sweep acts as root and is
        // never scoped to an owner.
        let root = User {
            id: 0,
            username: "root".into(),
            password: String::new(),
            token: String::new(),
            enabled: true,
            permission: perms::SUPERADMIN,
            timestamp: 0,
            registration: 0,
        };

        let count = expired.len();
        let values: Vec<Value> = expired.into_iter().map(Value::from).collect();
        let failed = deleter::bulk_delete(state, DeleteField::Id, values, &root).await?;

        tracing::info!(
            expired = count,
            failed = failed.len(),
            "retention sweep deleted expired uploads"
        );
        Ok(count)
    }
}
