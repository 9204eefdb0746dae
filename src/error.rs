use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Domain code carried alongside 401 responses so API clients can
/// distinguish a bad token from other authorization failures.
pub const CODE_INVALID_TOKEN: u32 = 10001;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found")]
    NotFound,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Rate limit reached, try again later")]
    RateLimited,
    #[error("{0}")]
    EntityTooLarge(String),
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Identifier allocator ran out of attempts.
    #[error("Failed to allocate a unique identifier")]
    IdentifierExhausted,
    /// Scanner was configured but could not produce a verdict.
    #[error("An error occurred while scanning the uploaded files")]
    ScannerUnavailable,
    #[error("An error occurred while stripping tags from the uploaded files")]
    StripFailed,
    #[error("Failed to generate the album archive")]
    ZipFailed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::InvalidToken | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::EntityTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // 5xx descriptions reach the client sanitized; the cause is only
        // logged. The well-understood server failures keep their own
        // user-facing message and skip the stack-level log.
        let description = match &self {
            AppError::Database(e) => {
                tracing::error!("database error: {e:?}");
                "Internal server error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = match self {
            AppError::InvalidToken => {
                json!({ "success": false, "description": description, "code": CODE_INVALID_TOKEN })
            }
            _ => json!({ "success": false, "description": description }),
        };

        (
            status,
            [(header::CACHE_CONTROL, "no-store")],
            Json(body),
        )
            .into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::EntityTooLarge("too big".into()).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn server_errors_map_to_500() {
        assert_eq!(
            AppError::IdentifierExhausted.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
