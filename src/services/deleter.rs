//! Bulk file deletion.
//!
//! Deletion spans the database, the uploads tree, thumbnails, in-memory
//! caches, album timestamps, and the CDN cache. It deliberately runs
//! without a wrapping transaction: unlinking files is not rollbackable, so
//! partial progress is reported to the caller through the `failed` list
//! instead of being rolled back.

use std::collections::HashSet;

use futures::future::join_all;
use serde_json::Value;

use crate::db::models::{FileRow, User};
use crate::error::{AppError, AppResult};
use crate::services::fetch::extension_of;
use crate::services::{store, thumbs};
use crate::AppState;

/// SQLite's default bind-parameter ceiling; chunks stay under it.
pub const MAX_SQL_VARS: usize = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteField {
    Id,
    Name,
}

impl DeleteField {
    pub fn parse(field: &str) -> AppResult<Self> {
        match field {
            "id" => Ok(Self::Id),
            "name" => Ok(Self::Name),
            other => Err(AppError::BadRequest(format!(
                "Cannot bulk delete by \"{other}\""
            ))),
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
        }
    }
}

struct ChunkOutcome {
    failed: Vec<Value>,
    deleted_names: Vec<String>,
    album_ids: HashSet<i64>,
}

/// Deletes the requested files, scoped to the actor unless they moderate.
///
/// Returns the subset of `values` that could not be deleted: unknown ids,
/// rows owned by someone else, or filesystem failures. The caller's values
/// are echoed back verbatim so clients can retry precisely.
pub async fn bulk_delete(
    state: &AppState,
    field: DeleteField,
    values: Vec<Value>,
    actor: &User,
) -> AppResult<Vec<Value>> {
    if values.is_empty() {
        return Err(AppError::BadRequest("No files to delete".into()));
    }

    let mut failed: Vec<Value> = Vec::new();

    // Pre-validate the value types so a chunk never mixes representations.
    let mut usable: Vec<Value> = Vec::new();
    for value in values {
        let ok = match field {
            DeleteField::Id => value.as_i64().is_some(),
            DeleteField::Name => value.as_str().is_some(),
        };
        if ok {
            usable.push(value);
        } else {
            failed.push(value);
        }
    }

    let chunks: Vec<&[Value]> = usable.chunks(MAX_SQL_VARS).collect();
    let outcomes = join_all(
        chunks
            .into_iter()
            .map(|chunk| process_chunk(state, field, chunk, actor)),
    )
    .await;

    let mut deleted_names: Vec<String> = Vec::new();
    let mut album_ids: HashSet<i64> = HashSet::new();
    for outcome in outcomes {
        let outcome = outcome?;
        failed.extend(outcome.failed);
        deleted_names.extend(outcome.deleted_names);
        album_ids.extend(outcome.album_ids);
    }

    cascade_album_edits(state, &album_ids).await?;
    schedule_cdn_purge(state, &deleted_names);

    Ok(failed)
}

async fn process_chunk(
    state: &AppState,
    field: DeleteField,
    chunk: &[Value],
    actor: &User,
) -> AppResult<ChunkOutcome> {
    let placeholders = vec!["?"; chunk.len()].join(", ");
    let scope = if actor.is_moderator() { "" } else { " AND userid = ?" };
    let sql = format!(
        "SELECT id, name, original, type, size, hash, ip, userid, albumid, timestamp, expirydate \
         FROM files WHERE {} IN ({placeholders}){scope}",
        field.column()
    );

    let mut query = sqlx::query_as::<_, FileRow>(&sql);
    for value in chunk {
        query = match field {
            DeleteField::Id => query.bind(value.as_i64().expect("pre-validated")),
            DeleteField::Name => query.bind(value.as_str().expect("pre-validated")),
        };
    }
    if !actor.is_moderator() {
        query = query.bind(actor.id);
    }
    let rows = query.fetch_all(&state.db).await?;

    let mut outcome = ChunkOutcome {
        failed: Vec::new(),
        deleted_names: Vec::new(),
        album_ids: HashSet::new(),
    };

    // Requested values the select did not return: missing or not ours.
    for value in chunk {
        let found = rows.iter().any(|row| match field {
            DeleteField::Id => Some(row.id) == value.as_i64(),
            DeleteField::Name => Some(row.name.as_str()) == value.as_str(),
        });
        if !found {
            outcome.failed.push(value.clone());
        }
    }

    // Unlink first; a row whose bytes cannot be removed is kept so the
    // failure stays visible and retryable.
    let mut deletable: Vec<&FileRow> = Vec::new();
    for row in &rows {
        let path = state.paths.file(&row.name);
        if let Err(e) = state.paths.remove_scoped(&path).await {
            tracing::error!("failed to unlink {}: {e}", row.name);
            outcome.failed.push(match field {
                DeleteField::Id => Value::from(row.id),
                DeleteField::Name => Value::from(row.name.clone()),
            });
            continue;
        }

        let extension = extension_of(&row.name);
        if thumbs::supports(&extension) {
            let thumb = state.paths.thumb(row.identifier());
            if let Err(e) = state.paths.remove_scoped(&thumb).await {
                tracing::warn!("failed to unlink thumbnail for {}: {e}", row.name);
            }
        }

        deletable.push(row);
    }

    if !deletable.is_empty() {
        let placeholders = vec!["?"; deletable.len()].join(", ");
        let delete_sql = format!("DELETE FROM files WHERE id IN ({placeholders})");
        let mut delete = sqlx::query(&delete_sql);
        for row in &deletable {
            delete = delete.bind(row.id);
        }
        delete.execute(&state.db).await?;
    }

    for row in deletable {
        state.disposition_cache.delete(&row.name);
        if let Some(albumid) = row.albumid {
            outcome.album_ids.insert(albumid);
        }
        outcome.deleted_names.push(row.name.clone());
    }

    Ok(outcome)
}

/// Bumps `editedAt` on every album that lost files and drops their cached
/// public renders.
async fn cascade_album_edits(state: &AppState, album_ids: &HashSet<i64>) -> AppResult<()> {
    if album_ids.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().timestamp();
    let ids: Vec<i64> = album_ids.iter().copied().collect();

    for chunk in ids.chunks(MAX_SQL_VARS) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let update_sql = format!("UPDATE albums SET editedAt = ? WHERE id IN ({placeholders})");
        let mut update = sqlx::query(&update_sql).bind(now);
        for id in chunk {
            update = update.bind(id);
        }
        update.execute(&state.db).await?;

        let select_sql = format!("SELECT identifier FROM albums WHERE id IN ({placeholders})");
        let mut select = sqlx::query_scalar::<_, String>(&select_sql);
        for id in chunk {
            select = select.bind(id);
        }
        for identifier in select.fetch_all(&state.db).await? {
            state.render_cache.delete(&identifier);
        }
    }
    Ok(())
}

/// Fire-and-forget CDN purge of deleted file URLs and their thumbnails.
fn schedule_cdn_purge(state: &AppState, deleted_names: &[String]) {
    let purger = match &state.cdn {
        Some(purger) => purger,
        None => return,
    };
    if deleted_names.is_empty() {
        return;
    }

    let mut urls: Vec<String> = Vec::with_capacity(deleted_names.len());
    for name in deleted_names {
        urls.push(store::file_url(state, name));
        let extension = extension_of(name);
        if thumbs::supports(&extension) {
            let identifier = name.split('.').next().unwrap_or(name);
            urls.push(format!(
                "{}/thumbs/{identifier}.png",
                state.config.domain.trim_end_matches('/')
            ));
        }
    }
    purger.enqueue(urls);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::perms;

    async fn seed_file(state: &AppState, name: &str, userid: Option<i64>, albumid: Option<i64>) -> i64 {
        std::fs::write(state.paths.file(name), b"data").unwrap();
        sqlx::query(
            "INSERT INTO files (name, original, type, size, hash, userid, albumid, timestamp) \
             VALUES (?, ?, 'application/octet-stream', 4, '', ?, ?, 0)",
        )
        .bind(name)
        .bind(name)
        .bind(userid)
        .bind(albumid)
        .execute(&state.db)
        .await
        .unwrap();
        sqlx::query_scalar::<_, i64>("SELECT id FROM files WHERE name = ?")
            .bind(name)
            .fetch_one(&state.db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn owner_scope_reports_foreign_rows_as_failed() {
        let (state, _dir) = AppState::for_tests().await;
        let mine = seed_file(&state, "mine.bin", Some(1), None).await;
        let theirs = seed_file(&state, "theirs.bin", Some(2), None).await;

        let actor = User::test_user(1, perms::USER);
        let failed = bulk_delete(
            &state,
            DeleteField::Id,
            vec![Value::from(mine), Value::from(theirs), Value::from(99999)],
            &actor,
        )
        .await
        .unwrap();

        // failed + deleted covers exactly the request.
        assert_eq!(failed, vec![Value::from(theirs), Value::from(99999)]);
        assert!(!state.paths.file("mine.bin").exists());
        assert!(state.paths.file("theirs.bin").exists());

        let remaining = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn moderators_delete_anyones_files_by_name() {
        let (state, _dir) = AppState::for_tests().await;
        seed_file(&state, "other.bin", Some(5), None).await;

        let actor = User::test_user(1, perms::MODERATOR);
        let failed = bulk_delete(
            &state,
            DeleteField::Name,
            vec![Value::from("other.bin")],
            &actor,
        )
        .await
        .unwrap();

        assert!(failed.is_empty());
        assert!(!state.paths.file("other.bin").exists());
    }

    #[tokio::test]
    async fn thumbnails_and_album_timestamps_cascade() {
        let (state, _dir) = AppState::for_tests().await;
        sqlx::query(
            "INSERT INTO albums (name, identifier, userid, enabled, public, download, description, timestamp, editedAt) \
             VALUES ('al', 'abc12345', 1, 1, 1, 1, '', 5, 5)",
        )
        .execute(&state.db)
        .await
        .unwrap();
        let albumid = sqlx::query_scalar::<_, i64>("SELECT id FROM albums")
            .fetch_one(&state.db)
            .await
            .unwrap();

        let id = seed_file(&state, "pic1.png", Some(1), Some(albumid)).await;
        std::fs::write(state.paths.thumb("pic1"), b"thumb").unwrap();

        let actor = User::test_user(1, perms::USER);
        let failed = bulk_delete(&state, DeleteField::Id, vec![Value::from(id)], &actor)
            .await
            .unwrap();

        assert!(failed.is_empty());
        assert!(!state.paths.file("pic1.png").exists());
        assert!(!state.paths.thumb("pic1").exists());

        let edited: i64 = sqlx::query_scalar("SELECT editedAt FROM albums WHERE id = ?")
            .bind(albumid)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert!(edited > 5);
    }

    #[tokio::test]
    async fn malformed_values_fail_without_touching_rows() {
        let (state, _dir) = AppState::for_tests().await;
        let id = seed_file(&state, "keep.bin", Some(1), None).await;

        let actor = User::test_user(1, perms::USER);
        let failed = bulk_delete(
            &state,
            DeleteField::Id,
            vec![Value::from("not-a-number"), Value::from(id)],
            &actor,
        )
        .await
        .unwrap();

        assert_eq!(failed, vec![Value::from("not-a-number")]);
        assert!(!state.paths.file("keep.bin").exists());
    }

    #[test]
    fn field_parsing_rejects_unknown_columns() {
        assert!(DeleteField::parse("id").is_ok());
        assert!(DeleteField::parse("name").is_ok());
        assert!(DeleteField::parse("hash").is_err());
    }
}
