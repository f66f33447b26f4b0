//! Error-to-response mapping
//!
//! Core errors carry their own status and symbolic code; this is the one
//! place they become `{"error", "code"}` JSON envelopes. Server-side
//! failures keep their detail in the logs, not the body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reelvault_core::Error;
use serde_json::json;
use tracing::error;

/// Newtype so core errors can implement `IntoResponse`
pub struct ApiError(pub Error);

/// Handler result alias
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = if status.is_server_error() {
            error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": self.0.code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_errors_keep_their_message() {
        let response = ApiError(Error::validation("bad phase")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "bad phase");
        assert_eq!(body["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_server_errors_are_scrubbed() {
        let response = ApiError(Error::internal("connection pool exploded at 0x7f")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "internal error");
    }
}
