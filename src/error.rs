use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Infrastructure failures of the idempotency core.
///
/// Missing-key and key-reuse rejections are protocol outcomes, not errors;
/// they are produced as bad responses by the coordinator. Everything here is
/// an infrastructure fault that must not be masked: masking a store or lock
/// failure would either silently skip deduplication or silently hang.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stored response encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to buffer request or response body: {0}")]
    Body(#[from] axum::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        tracing::error!("idempotency middleware failure: {}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "internal server error" })),
        )
            .into_response()
    }
}
