//! Upload listing and retrieval.
//!
//! Route map (registered in main.rs, all behind `require_auth`):
//!
//!   GET /api/uploads[/{page}]               — the caller's uploads
//!   GET /api/album/{albumid}[/{page}]       — uploads inside one album
//!   GET /api/upload/get/{identifier}        — a single record
//!
//! Listing headers: `all` (moderators list every upload), `filters` (the
//! search expression compiled by services::query), `minoffset` (client
//! timezone offset in minutes, used by the date grammar).

use axum::{
    extract::{Extension, Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;

use crate::db::models::{FileRow, User};
use crate::error::{AppError, AppResult};
use crate::services::query::{self, CompiledQuery, Param, QueryOptions};
use crate::AppState;

const FILE_COLS: &str =
    "id, name, original, type, size, hash, ip, userid, albumid, timestamp, expirydate";

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

async fn list_common(
    state: &AppState,
    user: &User,
    headers: &HeaderMap,
    album_scope: Option<i64>,
    page: i64,
) -> AppResult<Json<serde_json::Value>> {
    let list_all = matches!(header_string(headers, "all").as_deref(), Some("1") | Some("true"));
    if list_all && !user.is_moderator() {
        return Err(AppError::Forbidden);
    }

    // An album listing is only valid for the album's owner (or a
    // moderator); everyone else sees it as absent.
    if let Some(albumid) = album_scope {
        let owner: Option<i64> =
            sqlx::query_scalar("SELECT userid FROM albums WHERE id = ? AND enabled = 1")
                .bind(albumid)
                .fetch_optional(&state.db)
                .await?;
        match owner {
            Some(owner) if owner == user.id || user.is_moderator() => {}
            _ => return Err(AppError::NotFound),
        }
    }

    let opts = QueryOptions {
        moderator_all: list_all && user.is_moderator(),
        userid: Some(user.id),
        album_scope,
        tz_offset_minutes: header_string(headers, "minoffset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        now: chrono::Utc::now().timestamp(),
    };

    let filters = header_string(headers, "filters").unwrap_or_default();
    let compiled = query::compile(&filters, &opts)?;

    let total = count_files(state, &compiled).await?;
    let page_size = state.config.page_size;
    let page = query::resolve_page(page, total, page_size);
    let offset = page * page_size as i64;

    let sql = format!(
        "SELECT {FILE_COLS} FROM files {} {} LIMIT ? OFFSET ?",
        compiled.where_sql, compiled.order_sql
    );
    let mut rows_query = sqlx::query_as::<_, FileRow>(&sql);
    for param in &compiled.params {
        rows_query = match param {
            Param::Text(v) => rows_query.bind(v),
            Param::Int(v) => rows_query.bind(v),
        };
    }
    let files = rows_query
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(&state.db)
        .await?;

    Ok(Json(json!({
        "success": true,
        "files": files,
        "count": total,
        "page": page,
    })))
}

async fn count_files(state: &AppState, compiled: &CompiledQuery) -> AppResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM files {}", compiled.where_sql);
    let mut count_query = sqlx::query_scalar::<_, i64>(&sql);
    for param in &compiled.params {
        count_query = match param {
            Param::Text(v) => count_query.bind(v),
            Param::Int(v) => count_query.bind(v),
        };
    }
    Ok(count_query.fetch_one(&state.db).await?)
}

pub async fn list_uploads(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    list_common(&state, &user, &headers, None, 0).await
}

pub async fn list_uploads_page(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(page): Path<i64>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    list_common(&state, &user, &headers, None, page).await
}

pub async fn list_album_uploads(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(albumid): Path<i64>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    list_common(&state, &user, &headers, Some(albumid), 0).await
}

pub async fn list_album_uploads_page(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path((albumid, page)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    list_common(&state, &user, &headers, Some(albumid), page).await
}

/// `GET /api/upload/get/{identifier}`
///
/// The identifier is the public name without extension; owners see their
/// own rows, moderators see everything.
pub async fn get_upload(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(identifier): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pattern = format!("{identifier}.%");
    let mut sql = format!(
        "SELECT {FILE_COLS} FROM files WHERE (name = ? OR name LIKE ?)"
    );
    if !user.is_moderator() {
        sql.push_str(" AND userid = ?");
    }

    let mut file_query = sqlx::query_as::<_, FileRow>(&sql).bind(&identifier).bind(&pattern);
    if !user.is_moderator() {
        file_query = file_query.bind(user.id);
    }
    let file = file_query
        .fetch_optional(&state.db)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(json!({ "success": true, "file": file })))
}
