//! Upload endpoints.
//!
//! Route map (registered in main.rs):
//!
//!   Optional auth (token required only when the instance is private):
//!     POST /api/upload                 — multipart stream or `{urls: []}`
//!     POST /api/upload/{albumid}       — same, targeting an album
//!     POST /api/upload/finishchunks    — assemble chunked sessions
//!
//!   Authenticated:
//!     POST /api/upload/delete          — single id, sugar over bulkdelete
//!     POST /api/upload/bulkdelete      — `{field, values}` with failures
//!                                        reported in-band

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Extension, FromRequest, Multipart, Path, Request, State},
    http::header::CONTENT_TYPE,
    Json,
};
use serde_json::json;

use crate::auth::middleware::client_ip;
use crate::db::models::{BulkDeleteBody, FinishChunksBody, SingleDeleteBody, UrlUploadBody, User};
use crate::error::{AppError, AppResult};
use crate::services::deleter::{self, DeleteField};
use crate::services::ingest::{self, UploadContext};
use crate::AppState;

/// Builds the per-request context from the upload headers (`albumid`,
/// `age`, `filelength`, `striptags`). A path album id wins over the header.
fn upload_context(
    user: Option<User>,
    ip: String,
    headers: &axum::http::HeaderMap,
    albumid_param: Option<i64>,
) -> UploadContext {
    let header = |name: &str| -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    UploadContext {
        user,
        ip,
        albumid: albumid_param.or_else(|| header("albumid").and_then(|v| v.parse().ok())),
        age: header("age").and_then(|v| v.parse().ok()),
        filelength: header("filelength").and_then(|v| v.parse().ok()),
        strip_tags: matches!(header("striptags").as_deref(), Some("1") | Some("true")),
    }
}

pub async fn upload(
    State(state): State<AppState>,
    Extension(user): Extension<Option<User>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> AppResult<Json<serde_json::Value>> {
    upload_inner(state, user, addr, None, request).await
}

pub async fn upload_to_album(
    State(state): State<AppState>,
    Extension(user): Extension<Option<User>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(albumid): Path<i64>,
    request: Request,
) -> AppResult<Json<serde_json::Value>> {
    upload_inner(state, user, addr, Some(albumid), request).await
}

async fn upload_inner(
    state: AppState,
    user: Option<User>,
    addr: SocketAddr,
    albumid: Option<i64>,
    request: Request,
) -> AppResult<Json<serde_json::Value>> {
    if state.config.private_uploads && user.is_none() {
        return Err(AppError::InvalidToken);
    }

    let ip = client_ip(&state, request.headers(), &ConnectInfo(addr));
    let ctx = upload_context(user, ip, request.headers(), albumid);

    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let files = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        ingest::process_multipart(&state, ctx, multipart).await?
    } else {
        let Json(body): Json<UrlUploadBody> = Json::from_request(request, &state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        ingest::process_urls(&state, &ctx, body.urls).await?
    };

    Ok(Json(json!({ "success": true, "files": files })))
}

/// `POST /api/upload/finishchunks`
pub async fn finish_chunks(
    State(state): State<AppState>,
    Extension(user): Extension<Option<User>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> AppResult<Json<serde_json::Value>> {
    if state.config.private_uploads && user.is_none() {
        return Err(AppError::InvalidToken);
    }

    let ip = client_ip(&state, request.headers(), &ConnectInfo(addr));
    let ctx = upload_context(user, ip, request.headers(), None);

    let Json(body): Json<FinishChunksBody> = Json::from_request(request, &state)
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?;

    let files = ingest::finish_chunks(&state, &ctx, body.files).await?;
    Ok(Json(json!({ "success": true, "files": files })))
}

/// `POST /api/upload/delete`
pub async fn delete_single(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<SingleDeleteBody>,
) -> AppResult<Json<serde_json::Value>> {
    let failed = deleter::bulk_delete(
        &state,
        DeleteField::Id,
        vec![serde_json::Value::from(body.id)],
        &user,
    )
    .await?;
    Ok(Json(json!({ "success": true, "failed": failed })))
}

/// `POST /api/upload/bulkdelete`
pub async fn bulk_delete(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<BulkDeleteBody>,
) -> AppResult<Json<serde_json::Value>> {
    let field = DeleteField::parse(&body.field)?;
    let failed = deleter::bulk_delete(&state, field, body.values, &user).await?;
    Ok(Json(json!({ "success": true, "failed": failed })))
}
