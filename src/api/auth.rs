//! Account and token endpoints.
//!
//! Route map (registered in main.rs):
//!
//!   Public:
//!     GET  /api/check          — server capabilities for upload clients
//!     POST /api/login          — exchange credentials for the API token
//!     POST /api/register       — create an account (when enabled)
//!     POST /api/tokens/verify  — resolve a token to its group/permissions
//!
//!   Authenticated:
//!     POST /api/password/change
//!     POST /api/tokens/change  — rotate the API token
//!
//! All credential failures go through the shared per-IP rate limiter.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Extension, State},
    Json,
};
use serde_json::json;

use crate::auth::{self, middleware::validate_token};
use crate::db::models::{ChangePasswordBody, LoginBody, User, VerifyTokenBody};
use crate::error::{AppError, AppResult};
use crate::AppState;

const USERNAME_MIN: usize = 4;
const USERNAME_MAX: usize = 32;
const PASSWORD_MIN: usize = 6;

/// `GET /api/check`
///
/// Everything an upload client needs to know before its first request.
pub async fn check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = &state.config;
    Json(json!({
        "private": config.private_uploads,
        "enableUserAccounts": config.enable_user_accounts,
        "maxSize": config.max_size_mb,
        "chunkSize": config.chunk_size_mb,
        "fileIdentifierLength": {
            "min": config.file_identifier_min,
            "max": config.file_identifier_max,
            "default": config.file_identifier_length,
        },
        "stripTags": config.strip_tags_enabled,
        "temporaryUploadAges": state.retention.periods_for(None),
        "defaultTemporaryUploadAge": state.retention.default_for(None),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /api/login`
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginBody>,
) -> AppResult<Json<serde_json::Value>> {
    let ip = addr.ip();
    state.limiter.check(ip)?;

    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, password, token, enabled, permission, timestamp, registration \
         FROM users WHERE username = ? AND enabled = 1",
    )
    .bind(&body.username)
    .fetch_optional(&state.db)
    .await?;

    let user = match user {
        Some(user) if auth::verify_password(&user.password, &body.password)? => user,
        _ => {
            state.limiter.record_failure(ip);
            return Err(AppError::BadRequest("Invalid username or password".into()));
        }
    };

    state.limiter.record_success(ip);
    Ok(Json(json!({ "success": true, "token": user.token })))
}

/// `POST /api/register`
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginBody>,
) -> AppResult<Json<serde_json::Value>> {
    if !state.config.enable_user_accounts {
        return Err(AppError::Forbidden);
    }
    let ip = addr.ip();
    state.limiter.check(ip)?;

    let username = body.username.trim().to_string();
    if username.len() < USERNAME_MIN || username.len() > USERNAME_MAX {
        return Err(AppError::BadRequest(format!(
            "Username must be {USERNAME_MIN}-{USERNAME_MAX} characters long"
        )));
    }
    if body.password.len() < PASSWORD_MIN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {PASSWORD_MIN} characters long"
        )));
    }
    // Root is bootstrapped internally and never registrable, regardless of
    // the table's case-insensitive unique index.
    if username.eq_ignore_ascii_case("root") {
        return Err(AppError::BadRequest("That username is reserved".into()));
    }

    let taken = sqlx::query_scalar::<_, i64>("SELECT EXISTS(SELECT 1 FROM users WHERE username = ?)")
        .bind(&username)
        .fetch_one(&state.db)
        .await?;
    if taken != 0 {
        state.limiter.record_failure(ip);
        return Err(AppError::Conflict("Username already exists".into()));
    }

    let hash = auth::hash_password(&body.password)?;
    let token = auth::generate_token();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO users (username, password, token, enabled, permission, timestamp, registration) \
         VALUES (?, ?, ?, 1, 0, ?, ?)",
    )
    .bind(&username)
    .bind(&hash)
    .bind(&token)
    .bind(now)
    .bind(now)
    .execute(&state.db)
    .await?;

    state.limiter.record_success(ip);
    Ok(Json(json!({ "success": true, "token": token })))
}

/// `POST /api/password/change`
pub async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<ChangePasswordBody>,
) -> AppResult<Json<serde_json::Value>> {
    if body.password.len() < PASSWORD_MIN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {PASSWORD_MIN} characters long"
        )));
    }

    let hash = auth::hash_password(&body.password)?;
    sqlx::query("UPDATE users SET password = ? WHERE id = ?")
        .bind(&hash)
        .bind(user.id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "success": true })))
}

/// `POST /api/tokens/verify`
///
/// Public: upload clients use it to test a stored token before uploading,
/// so failures count against the rate limiter.
pub async fn verify_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<VerifyTokenBody>,
) -> AppResult<Json<serde_json::Value>> {
    let ip = addr.ip();
    state.limiter.check(ip)?;

    let user = match validate_token(&state.db, &body.token).await {
        Ok(user) => user,
        Err(e) => {
            state.limiter.record_failure(ip);
            return Err(e);
        }
    };
    state.limiter.record_success(ip);

    let rank = Some(user.permission);
    Ok(Json(json!({
        "success": true,
        "username": user.username,
        "group": user.group_name(),
        "permissions": {
            "user": true,
            "moderator": user.is_moderator(),
            "admin": user.is_admin(),
        },
        "retentionPeriods": state.retention.periods_for(rank),
        "defaultRetentionPeriod": state.retention.default_for(rank),
    })))
}

/// `POST /api/tokens/change`
pub async fn change_token(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<serde_json::Value>> {
    let token = auth::generate_token();
    sqlx::query("UPDATE users SET token = ? WHERE id = ?")
        .bind(&token)
        .bind(user.id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "success": true, "token": token })))
}
