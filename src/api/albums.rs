//! Album endpoints.
//!
//! Route map (registered in main.rs):
//!
//!   Authenticated:
//!     GET  /api/albums[/{page}]    — the caller's enabled albums
//!     POST /api/albums             — create
//!     POST /api/albums/edit        — mutate name/description/flags
//!     POST /api/albums/rename      — name-only sugar over edit
//!     POST /api/albums/disable     — soft delete (enabled = 0)
//!     POST /api/albums/delete      — disable, optionally purging files
//!     POST /api/albums/addfiles    — move files into/out of an album
//!
//!   Public:
//!     GET  /api/album/get/{identifier} — album with its file list
//!     GET  /api/album/zip/{identifier} — download the album archive
//!
//! Every mutation bumps `editedAt`, which is what invalidates cached
//! renders and on-disk ZIPs.

use axum::{
    body::Body,
    extract::{Extension, Path, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tower::util::ServiceExt;
use tower_http::services::ServeFile;

use crate::db::models::{
    AddFilesBody, Album, CreateAlbumBody, DeleteAlbumBody, EditAlbumBody, User,
};
use crate::error::{AppError, AppResult};
use crate::services::deleter::{self, DeleteField};
use crate::services::zips;
use crate::AppState;

const ALBUM_COLS: &str = "id, name, identifier, userid, enabled, public, download, description, \
                          timestamp, editedAt, zipGeneratedAt";

async fn owned_album(state: &AppState, user: &User, id: i64) -> AppResult<Album> {
    let mut sql = format!("SELECT {ALBUM_COLS} FROM albums WHERE id = ? AND enabled = 1");
    if !user.is_moderator() {
        sql.push_str(" AND userid = ?");
    }
    let mut query = sqlx::query_as::<_, Album>(&sql).bind(id);
    if !user.is_moderator() {
        query = query.bind(user.id);
    }
    query
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)
}

async fn name_taken(state: &AppState, userid: i64, name: &str, exclude: Option<i64>) -> AppResult<bool> {
    // Uniqueness only applies among the user's enabled albums; a disabled
    // album frees its name.
    let taken = sqlx::query_scalar::<_, i64>(
        "SELECT EXISTS(SELECT 1 FROM albums WHERE userid = ? AND enabled = 1 AND name = ? AND id != ?)",
    )
    .bind(userid)
    .bind(name)
    .bind(exclude.unwrap_or(0))
    .fetch_one(&state.db)
    .await?;
    Ok(taken != 0)
}

/// `GET /api/albums` and `/api/albums/{page}`
pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<serde_json::Value>> {
    list_page_inner(state, user, 0).await
}

pub async fn list_page(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(page): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    list_page_inner(state, user, page.max(0)).await
}

async fn list_page_inner(
    state: AppState,
    user: User,
    page: i64,
) -> AppResult<Json<serde_json::Value>> {
    let page_size = state.config.page_size as i64;
    let albums = sqlx::query_as::<_, Album>(&format!(
        "SELECT {ALBUM_COLS} FROM albums WHERE userid = ? AND enabled = 1 \
         ORDER BY id DESC LIMIT ? OFFSET ?"
    ))
    .bind(user.id)
    .bind(page_size)
    .bind(page * page_size)
    .fetch_all(&state.db)
    .await?;

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM albums WHERE userid = ? AND enabled = 1")
            .bind(user.id)
            .fetch_one(&state.db)
            .await?;

    Ok(Json(json!({ "success": true, "albums": albums, "count": count })))
}

/// `POST /api/albums`
pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<CreateAlbumBody>,
) -> AppResult<Json<serde_json::Value>> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("Album name is required".into()));
    }
    if name_taken(&state, user.id, &name, None).await? {
        return Err(AppError::Conflict("An album with that name already exists".into()));
    }

    let held = state
        .ids
        .reserve_album_identifier(&state.db, state.config.album_identifier_length)
        .await?;
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO albums (name, identifier, userid, enabled, public, download, description, timestamp, editedAt) \
         VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?)",
    )
    .bind(&name)
    .bind(held.as_str())
    .bind(user.id)
    .bind(body.public.unwrap_or(true))
    .bind(body.download.unwrap_or(true))
    .bind(body.description.unwrap_or_default().trim())
    .bind(now)
    .bind(now)
    .execute(&state.db)
    .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM albums WHERE identifier = ?")
        .bind(held.as_str())
        .fetch_one(&state.db)
        .await?;

    Ok(Json(json!({ "success": true, "id": id, "identifier": held.as_str() })))
}

/// `POST /api/albums/edit` (also backs `/api/albums/rename`)
pub async fn edit(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<EditAlbumBody>,
) -> AppResult<Json<serde_json::Value>> {
    let album = owned_album(&state, &user, body.id).await?;

    let name = match &body.name {
        Some(name) => {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(AppError::BadRequest("Album name is required".into()));
            }
            if name != album.name && name_taken(&state, album.userid, &name, Some(album.id)).await? {
                return Err(AppError::Conflict(
                    "An album with that name already exists".into(),
                ));
            }
            name
        }
        None => album.name.clone(),
    };

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE albums SET name = ?, description = ?, public = ?, download = ?, editedAt = ? \
         WHERE id = ?",
    )
    .bind(&name)
    .bind(body.description.as_deref().unwrap_or(&album.description).trim())
    .bind(body.public.unwrap_or(album.public))
    .bind(body.download.unwrap_or(album.download))
    .bind(now)
    .bind(album.id)
    .execute(&state.db)
    .await?;

    state.render_cache.delete(&album.identifier);
    Ok(Json(json!({ "success": true })))
}

/// `POST /api/albums/disable` — soft delete. The row and its files stay;
/// the name becomes reusable and the archive is dropped.
pub async fn disable(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<DeleteAlbumBody>,
) -> AppResult<Json<serde_json::Value>> {
    let album = owned_album(&state, &user, body.id).await?;
    let now = chrono::Utc::now().timestamp();

    sqlx::query("UPDATE albums SET enabled = 0, editedAt = ? WHERE id = ?")
        .bind(now)
        .bind(album.id)
        .execute(&state.db)
        .await?;

    let zip_path = state.paths.zip(&album.identifier);
    if let Err(e) = state.paths.remove_scoped(&zip_path).await {
        tracing::warn!("failed to remove archive for {}: {e}", album.identifier);
    }
    state.render_cache.delete(&album.identifier);

    Ok(Json(json!({ "success": true })))
}

/// `POST /api/albums/delete` — hard delete. With `purge`, the album's
/// files owned by the caller are bulk-deleted first and any that could not
/// be deleted are reported in `failed`.
pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<DeleteAlbumBody>,
) -> AppResult<Json<serde_json::Value>> {
    let album = owned_album(&state, &user, body.id).await?;

    let mut failed: Vec<serde_json::Value> = Vec::new();
    if body.purge {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM files WHERE albumid = ?")
            .bind(album.id)
            .fetch_all(&state.db)
            .await?;
        if !ids.is_empty() {
            let values = ids.into_iter().map(serde_json::Value::from).collect();
            failed = deleter::bulk_delete(&state, DeleteField::Id, values, &user).await?;
        }
    }

    // Surviving files lose their album reference instead of cascading.
    sqlx::query("UPDATE files SET albumid = NULL WHERE albumid = ?")
        .bind(album.id)
        .execute(&state.db)
        .await?;
    sqlx::query("DELETE FROM albums WHERE id = ?")
        .bind(album.id)
        .execute(&state.db)
        .await?;

    let zip_path = state.paths.zip(&album.identifier);
    if let Err(e) = state.paths.remove_scoped(&zip_path).await {
        tracing::warn!("failed to remove archive for {}: {e}", album.identifier);
    }
    state.render_cache.delete(&album.identifier);

    Ok(Json(json!({ "success": true, "failed": failed })))
}

/// `POST /api/albums/addfiles`
///
/// Moves the caller's files into `albumid`, or out of any album when
/// `albumid` is null. Both the source and target albums get their
/// `editedAt` bumped.
pub async fn add_files(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<AddFilesBody>,
) -> AppResult<Json<serde_json::Value>> {
    if body.ids.is_empty() {
        return Err(AppError::BadRequest("No files to move".into()));
    }

    let target = match body.albumid {
        Some(albumid) => Some(owned_album(&state, &user, albumid).await?),
        None => None,
    };

    // Albums losing files here need their timestamps bumped too.
    let placeholders = vec!["?"; body.ids.len()].join(", ");
    let sources_sql = format!(
        "SELECT DISTINCT albumid FROM files WHERE albumid IS NOT NULL AND id IN ({placeholders})"
    );
    let mut sources = sqlx::query_scalar::<_, i64>(&sources_sql);
    for id in &body.ids {
        sources = sources.bind(id);
    }
    let mut touched: Vec<i64> = sources.fetch_all(&state.db).await?;

    let scope = if user.is_moderator() { "" } else { " AND userid = ?" };
    let update_sql = format!("UPDATE files SET albumid = ? WHERE id IN ({placeholders}){scope}");
    let mut update = sqlx::query(&update_sql).bind(target.as_ref().map(|a| a.id));
    for id in &body.ids {
        update = update.bind(id);
    }
    if !user.is_moderator() {
        update = update.bind(user.id);
    }
    let moved = update.execute(&state.db).await?.rows_affected();

    if let Some(target) = &target {
        touched.push(target.id);
    }
    if !touched.is_empty() {
        let now = chrono::Utc::now().timestamp();
        let placeholders = vec!["?"; touched.len()].join(", ");
        let bump_sql = format!("UPDATE albums SET editedAt = ? WHERE id IN ({placeholders})");
        let mut bump = sqlx::query(&bump_sql).bind(now);
        for id in &touched {
            bump = bump.bind(id);
        }
        bump.execute(&state.db).await?;

        let identifiers_sql = format!("SELECT identifier FROM albums WHERE id IN ({placeholders})");
        let mut identifiers = sqlx::query_scalar::<_, String>(&identifiers_sql);
        for id in &touched {
            identifiers = identifiers.bind(id);
        }
        for identifier in identifiers.fetch_all(&state.db).await? {
            state.render_cache.delete(&identifier);
        }
    }

    Ok(Json(json!({ "success": true, "moved": moved })))
}

/// `GET /api/album/get/{identifier}` — public album view, cached until the
/// album is edited.
pub async fn get_public(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    if let Some(render) = state.render_cache.get(&identifier) {
        return Ok(Json(render));
    }

    // A hold keeps a burst of cold requests down to one DB round trip; the
    // losers just render without caching.
    let holding = state.render_cache.hold(&identifier);

    let result = render_album(&state, &identifier).await;
    match &result {
        Ok(render) if holding => state.render_cache.put(&identifier, render.clone()),
        _ if holding => state.render_cache.release(&identifier),
        _ => {}
    }

    result.map(Json)
}

async fn render_album(state: &AppState, identifier: &str) -> AppResult<serde_json::Value> {
    let album = sqlx::query_as::<_, Album>(&format!(
        "SELECT {ALBUM_COLS} FROM albums WHERE identifier = ? AND enabled = 1"
    ))
    .bind(identifier)
    .fetch_optional(&state.db)
    .await?
    .ok_or(AppError::NotFound)?;

    if !album.public {
        return Err(AppError::Forbidden);
    }

    let files = sqlx::query_as::<_, (String, i64)>(
        "SELECT name, size FROM files WHERE albumid = ? ORDER BY id DESC",
    )
    .bind(album.id)
    .fetch_all(&state.db)
    .await?;

    let files: Vec<serde_json::Value> = files
        .into_iter()
        .map(|(name, size)| {
            json!({
                "name": name,
                "size": size,
                "url": crate::services::store::file_url(state, &name),
            })
        })
        .collect();

    Ok(json!({
        "success": true,
        "album": {
            "name": album.name,
            "identifier": album.identifier,
            "description": album.description,
            "download": album.download,
            "editedAt": album.edited_at,
            "files": files,
        },
    }))
}

/// `GET /api/album/zip/{identifier}` — builds (or reuses) the archive and
/// streams it with a download disposition.
pub async fn download_zip(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> AppResult<Response> {
    let album = sqlx::query_as::<_, Album>(&format!(
        "SELECT {ALBUM_COLS} FROM albums WHERE identifier = ? AND enabled = 1"
    ))
    .bind(&identifier)
    .fetch_optional(&state.db)
    .await?
    .ok_or(AppError::NotFound)?;

    if !album.public {
        return Err(AppError::Forbidden);
    }
    if !album.download {
        return Err(AppError::Forbidden);
    }

    let path = zips::archive_for(&state, &album).await?;

    // ServeFile handles range requests and streaming; we only add the
    // download filename on top.
    let request = Request::builder()
        .body(Body::empty())
        .map_err(|e| AppError::Internal(format!("archive request build failed: {e}")))?;
    let mut response = ServeFile::new(&path)
        .oneshot(request)
        .await
        .map_err(|e| AppError::Internal(format!("archive serve failed: {e}")))?
        .map(Body::new)
        .into_response();

    if response.status() == StatusCode::OK {
        let filename = format!("{}.zip", album.name.replace('"', ""));
        if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }

    Ok(response)
}
