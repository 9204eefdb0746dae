//! Axum middleware for token authentication.
//!
//! Clients authenticate every API request with a `token` header matched
//! against `users.token`. The middlewares inject the resolved `User` into
//! request extensions so handlers retrieve it via `Extension<User>` without
//! a second lookup. Upload routes use `optional_auth`, which injects
//! `Option<User>` and leaves the privacy decision to the handler.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use sqlx::SqlitePool;

use crate::db::models::User;
use crate::error::{AppError, AppResult};
use crate::AppState;

/// Resolves a token to its enabled user.
pub async fn validate_token(pool: &SqlitePool, token: &str) -> AppResult<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, password, token, enabled, permission, timestamp, registration \
         FROM users WHERE token = ? AND enabled = 1",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::InvalidToken)
}

fn token_header(request: &Request) -> Option<String> {
    request
        .headers()
        .get("token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Requires a valid token; injects `User`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = token_header(&request).ok_or(AppError::InvalidToken)?;
    let user = validate_token(&state.db, &token).await?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Requires a valid token *and* moderator rank or above.
pub async fn require_moderator(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = token_header(&request).ok_or(AppError::InvalidToken)?;
    let user = validate_token(&state.db, &token).await?;
    if !user.is_moderator() {
        return Err(AppError::Forbidden);
    }
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Accepts requests with or without a token; injects `Option<User>`. A
/// *present but invalid* token is still an error — silently downgrading a
/// typo'd token to an anonymous upload would surprise the uploader.
pub async fn optional_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = match token_header(&request) {
        Some(token) => Some(validate_token(&state.db, &token).await?),
        None => None,
    };
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// The client IP used for chunk-session namespacing, rate limiting, and
/// the `ip` column. Honors the leftmost `X-Forwarded-For` entry only when
/// the deployment says the proxy is trustworthy.
pub fn client_ip(
    state: &AppState,
    headers: &HeaderMap,
    ConnectInfo(addr): &ConnectInfo<SocketAddr>,
) -> String {
    if state.config.trust_proxy {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let candidate = first.trim();
                if candidate.parse::<IpAddr>().is_ok() {
                    return candidate.to_string();
                }
            }
        }
    }
    addr.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_lookup_requires_enabled_user() {
        let (state, _dir) = crate::AppState::for_tests().await;
        sqlx::query(
            "INSERT INTO users (username, password, token, enabled, permission, timestamp, registration) \
             VALUES ('a', 'h', 'goodtoken', 1, 0, 0, 0), \
                    ('b', 'h', 'disabledtoken', 0, 0, 0, 0)",
        )
        .execute(&state.db)
        .await
        .unwrap();

        let user = validate_token(&state.db, "goodtoken").await.unwrap();
        assert_eq!(user.username, "a");

        assert!(matches!(
            validate_token(&state.db, "disabledtoken").await,
            Err(AppError::InvalidToken)
        ));
        assert!(matches!(
            validate_token(&state.db, "nosuchtoken").await,
            Err(AppError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn forwarded_header_is_only_trusted_when_configured() {
        let (state, _dir) = crate::AppState::for_tests().await;
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let info = ConnectInfo(addr);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());

        assert_eq!(client_ip(&state, &headers, &info), "127.0.0.1");

        let mut trusting = state.clone();
        let mut config = (*trusting.config).clone();
        config.trust_proxy = true;
        trusting.config = std::sync::Arc::new(config);
        assert_eq!(client_ip(&trusting, &headers, &info), "203.0.113.7");

        // Garbage in the header falls back to the socket address.
        let mut bad = HeaderMap::new();
        bad.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(client_ip(&trusting, &bad, &info), "127.0.0.1");
    }
}
