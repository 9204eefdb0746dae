//! Database commit stage of the upload pipeline.
//!
//! Every staged file either deduplicates against an existing row or becomes
//! a new row. Row insertion and album timestamp updates happen in one
//! transaction per ingest call; filesystem effects (discarding duplicate
//! bytes, thumbnails) happen after the transaction lands.

use std::collections::{HashMap, HashSet};

use crate::db::models::{FileRow, UploadedFile};
use crate::error::AppResult;
use crate::services::fetch::extension_of;
use crate::services::ingest::{StagedFile, UploadContext};
use crate::services::thumbs;
use crate::AppState;

/// Commits staged files, returning response entries in staging order.
///
/// Duplicates (same owner, hash, and size) are not re-inserted: the staged
/// bytes are discarded and the response references the existing row with
/// `repeated = true`.
pub async fn commit_files(
    state: &AppState,
    ctx: &UploadContext,
    mut staged: Vec<StagedFile>,
) -> AppResult<Vec<UploadedFile>> {
    let now = chrono::Utc::now().timestamp();
    let userid = ctx.userid();

    // Albums the uploader may actually write to. Anonymous uploads never
    // carry an album; unauthorized album ids are stripped, not rejected.
    let allowed_albums = allowed_albums(state, userid, &staged).await?;

    let mut tx = state.db.begin().await?;
    let mut results: Vec<UploadedFile> = Vec::new();
    let mut inserted: Vec<usize> = Vec::new();
    let mut touched_albums: HashSet<i64> = HashSet::new();

    for (idx, file) in staged.iter_mut().enumerate() {
        let albumid = file.albumid.filter(|id| allowed_albums.contains_key(id));

        // An empty hash means hashing was disabled for this file; those
        // never deduplicate.
        if !file.hash.is_empty() {
            let existing = sqlx::query_as::<_, FileRow>(
                "SELECT id, name, original, type, size, hash, ip, userid, albumid, timestamp, expirydate \
                 FROM files WHERE hash = ? AND size = ? AND userid IS ?",
            )
            .bind(&file.hash)
            .bind(file.size)
            .bind(userid)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(existing) = existing {
                // The staged guard stays armed; the freshly-written
                // duplicate bytes are removed when `staged` drops.
                results.push(UploadedFile {
                    url: file_url(state, &existing.name),
                    name: existing.name,
                    original: file.original.clone(),
                    mimetype: existing.mimetype,
                    size: existing.size,
                    hash: existing.hash,
                    expirydate: existing.expirydate,
                    albumid: existing.albumid,
                    repeated: Some(true),
                });
                continue;
            }
        }

        let expirydate = file.age.map(|age| now + (age * 3600.0) as i64);
        let ip = state.config.store_ip.then(|| ctx.ip.clone());

        sqlx::query(
            "INSERT INTO files (name, original, type, size, hash, ip, userid, albumid, timestamp, expirydate) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&file.name)
        .bind(&file.original)
        .bind(&file.mimetype)
        .bind(file.size)
        .bind(&file.hash)
        .bind(&ip)
        .bind(userid)
        .bind(albumid)
        .bind(now)
        .bind(expirydate)
        .execute(&mut *tx)
        .await?;

        if let Some(albumid) = albumid {
            touched_albums.insert(albumid);
        }
        inserted.push(idx);

        results.push(UploadedFile {
            url: file_url(state, &file.name),
            name: file.name.clone(),
            original: file.original.clone(),
            mimetype: file.mimetype.clone(),
            size: file.size,
            hash: file.hash.clone(),
            expirydate,
            albumid,
            repeated: None,
        });
    }

    if !touched_albums.is_empty() {
        let ids: Vec<i64> = touched_albums.iter().copied().collect();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let update_sql = format!("UPDATE albums SET editedAt = ? WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&update_sql).bind(now);
        for id in &ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;
    }

    tx.commit().await?;

    // The rows exist; now the files are permanent and side effects run.
    for idx in inserted {
        let file = &mut staged[idx];
        file.guard.disarm();

        let extension = extension_of(&file.name);
        if state.config.thumbnails_enabled && thumbs::supports(&extension) {
            let identifier = file.name.split('.').next().unwrap_or(&file.name);
            thumbs::schedule(&state.paths, &file.name, identifier);
        }
    }

    for albumid in &touched_albums {
        if let Some(identifier) = allowed_albums.get(albumid) {
            state.render_cache.delete(identifier);
        }
    }

    // `staged` drops here: armed guards (duplicates, or everything on an
    // earlier error return) remove their files.
    Ok(results)
}

/// Maps requested album ids to identifiers for the albums this user owns
/// and that are still enabled.
async fn allowed_albums(
    state: &AppState,
    userid: Option<i64>,
    staged: &[StagedFile],
) -> AppResult<HashMap<i64, String>> {
    let userid = match userid {
        Some(id) => id,
        None => return Ok(HashMap::new()),
    };
    let requested: HashSet<i64> = staged.iter().filter_map(|f| f.albumid).collect();
    if requested.is_empty() {
        return Ok(HashMap::new());
    }

    let ids: Vec<i64> = requested.into_iter().collect();
    let placeholders = vec!["?"; ids.len()].join(", ");
    let select_sql = format!(
        "SELECT id, identifier FROM albums WHERE userid = ? AND enabled = 1 AND id IN ({placeholders})"
    );
    let mut query = sqlx::query_as::<_, (i64, String)>(&select_sql).bind(userid);
    for id in &ids {
        query = query.bind(id);
    }

    let rows = query.fetch_all(&state.db).await?;
    Ok(rows.into_iter().collect())
}

pub fn file_url(state: &AppState, name: &str) -> String {
    format!("{}/{}", state.config.domain.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ingest::TempFileGuard;

    async fn seed_user(state: &AppState) -> i64 {
        sqlx::query("INSERT INTO users (username, password, token, enabled, permission, timestamp, registration) VALUES ('u', 'h', 't0', 1, 0, 0, 0)")
            .execute(&state.db)
            .await
            .unwrap();
        sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE username = 'u'")
            .fetch_one(&state.db)
            .await
            .unwrap()
    }

    async fn seed_album(state: &AppState, userid: i64, identifier: &str) -> i64 {
        sqlx::query(
            "INSERT INTO albums (name, identifier, userid, enabled, public, download, description, timestamp, editedAt) \
             VALUES ('al', ?, ?, 1, 1, 1, '', 10, 10)",
        )
        .bind(identifier)
        .bind(userid)
        .execute(&state.db)
        .await
        .unwrap();
        sqlx::query_scalar::<_, i64>("SELECT id FROM albums WHERE identifier = ?")
            .bind(identifier)
            .fetch_one(&state.db)
            .await
            .unwrap()
    }

    fn stage(state: &AppState, name: &str, bytes: &[u8], albumid: Option<i64>) -> StagedFile {
        let path = state.paths.file(name);
        std::fs::write(&path, bytes).unwrap();
        StagedFile::for_tests(
            TempFileGuard::new(path),
            name.to_string(),
            bytes.len() as i64,
            blake3::hash(bytes).to_hex().to_string(),
            albumid,
        )
    }

    #[tokio::test]
    async fn insert_then_duplicate_is_marked_repeated() {
        let (state, _dir) = AppState::for_tests().await;
        let userid = seed_user(&state).await;
        let ctx = UploadContext {
            user: crate::db::models::User::test_user(userid, 0).into(),
            ip: "1.2.3.4".into(),
            ..Default::default()
        };

        let first = commit_files(&state, &ctx, vec![stage(&state, "aaaa.bin", b"hello", None)])
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].repeated, None);
        assert!(state.paths.file("aaaa.bin").exists());

        let second = commit_files(&state, &ctx, vec![stage(&state, "bbbb.bin", b"hello", None)])
            .await
            .unwrap();
        assert_eq!(second[0].repeated, Some(true));
        assert_eq!(second[0].name, "aaaa.bin");
        // The duplicate's staged bytes were discarded.
        assert!(!state.paths.file("bbbb.bin").exists());

        let rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn anonymous_duplicates_scope_to_null_userid() {
        let (state, _dir) = AppState::for_tests().await;
        let userid = seed_user(&state).await;

        let anon_ctx = UploadContext {
            ip: "1.1.1.1".into(),
            ..Default::default()
        };
        let user_ctx = UploadContext {
            user: crate::db::models::User::test_user(userid, 0).into(),
            ip: "1.1.1.1".into(),
            ..Default::default()
        };

        let anon = commit_files(&state, &anon_ctx, vec![stage(&state, "anon.bin", b"same", None)])
            .await
            .unwrap();
        assert_eq!(anon[0].repeated, None);

        // Same bytes, different owner: not a duplicate.
        let owned = commit_files(&state, &user_ctx, vec![stage(&state, "own0.bin", b"same", None)])
            .await
            .unwrap();
        assert_eq!(owned[0].repeated, None);

        // Same bytes, anonymous again: duplicate of the anonymous row.
        let again = commit_files(&state, &anon_ctx, vec![stage(&state, "anon2.bin", b"same", None)])
            .await
            .unwrap();
        assert_eq!(again[0].repeated, Some(true));
        assert_eq!(again[0].name, "anon.bin");
    }

    #[tokio::test]
    async fn authorized_album_gets_timestamp_bump_and_unauthorized_is_stripped() {
        let (state, _dir) = AppState::for_tests().await;
        let userid = seed_user(&state).await;
        let own_album = seed_album(&state, userid, "mine0001").await;
        let foreign_album = seed_album(&state, userid + 1000, "their001").await;

        let ctx = UploadContext {
            user: crate::db::models::User::test_user(userid, 0).into(),
            ip: "1.2.3.4".into(),
            ..Default::default()
        };

        let results = commit_files(
            &state,
            &ctx,
            vec![
                stage(&state, "ina0.bin", b"one", Some(own_album)),
                stage(&state, "inb0.bin", b"two", Some(foreign_album)),
            ],
        )
        .await
        .unwrap();

        assert_eq!(results[0].albumid, Some(own_album));
        assert_eq!(results[1].albumid, None, "foreign album stripped");

        let edited: i64 = sqlx::query_scalar("SELECT editedAt FROM albums WHERE id = ?")
            .bind(own_album)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert!(edited > 10, "editedAt bumped past seed value");

        let foreign_edited: i64 = sqlx::query_scalar("SELECT editedAt FROM albums WHERE id = ?")
            .bind(foreign_album)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(foreign_edited, 10, "foreign album untouched");
    }

    #[tokio::test]
    async fn expiry_is_timestamp_plus_age_hours() {
        let (state, _dir) = AppState::for_tests().await;
        let ctx = UploadContext {
            ip: "9.9.9.9".into(),
            ..Default::default()
        };

        let mut staged = stage(&state, "ttl0.bin", b"ephemeral", None);
        staged.age = Some(2.0);
        let results = commit_files(&state, &ctx, vec![staged]).await.unwrap();

        let expiry = results[0].expirydate.expect("expiry set");
        let row: (i64, Option<i64>) =
            sqlx::query_as("SELECT timestamp, expirydate FROM files WHERE name = 'ttl0.bin'")
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(row.1, Some(expiry));
        assert_eq!(expiry - row.0, 2 * 3600);
    }
}
