//! Serving committed files from this process.
//!
//! When `SERVE_FILES_WITH_SERVER` is on, `GET /{name}` streams the file
//! from the uploads root with a `Content-Disposition` naming the client's
//! original filename. The name→original mapping is held in a bounded cache
//! so hot files skip the database.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use tower::util::ServiceExt;
use tower_http::services::ServeFile;

use crate::error::{AppError, AppResult};
use crate::AppState;

/// `GET /{name}`
pub async fn serve_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    // Identifiers are generated from an alphanumeric alphabet; anything
    // else in the name segment is not ours to serve.
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        || name.starts_with('.')
    {
        return Err(AppError::NotFound);
    }

    let path = state.paths.file(&name);
    let request = Request::builder()
        .body(Body::empty())
        .map_err(|e| AppError::Internal(format!("file request build failed: {e}")))?;
    let mut response = ServeFile::new(&path)
        .oneshot(request)
        .await
        .map_err(|e| AppError::Internal(format!("file serve failed: {e}")))?
        .map(Body::new)
        .into_response();

    if response.status() == StatusCode::NOT_FOUND {
        return Err(AppError::NotFound);
    }

    if response.status() == StatusCode::OK {
        if let Some(original) = original_name(&state, &name).await {
            let encoded = urlencoding::encode(&original).into_owned();
            if let Ok(value) =
                format!("inline; filename*=UTF-8''{encoded}").parse::<header::HeaderValue>()
            {
                response
                    .headers_mut()
                    .insert(header::CONTENT_DISPOSITION, value);
            }
        }
    }

    Ok(response)
}

/// Looks up the original filename, caching through the disposition store.
/// The hold marker collapses concurrent cold lookups into one query.
async fn original_name(state: &AppState, name: &str) -> Option<String> {
    if let Some(original) = state.disposition_cache.get(name) {
        return Some(original);
    }

    let holding = state.disposition_cache.hold(name);
    let original = sqlx::query_scalar::<_, String>("SELECT original FROM files WHERE name = ?")
        .bind(name)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();

    if holding {
        match &original {
            Some(original) => state.disposition_cache.put(name, original.clone()),
            None => state.disposition_cache.release(name),
        }
    }
    original
}
