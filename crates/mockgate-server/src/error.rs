use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mockgate_store::StoreError;
use serde_json::json;
use thiserror::Error;

/// Failures of the REST management API, rendered as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidConfig(msg) | StoreError::Validation(msg) => Self::BadRequest(msg),
            StoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(msg) = &self {
            tracing::error!(error = %msg, "API request failed");
        }
        (self.status_code(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_status() {
        let bad: ApiError = StoreError::InvalidConfig("timeout must be 1-300 seconds".into()).into();
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(bad.to_string(), "timeout must be 1-300 seconds");

        let missing: ApiError = StoreError::NotFound("queue".into()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let io: ApiError = StoreError::Io("disk full".into()).into();
        assert_eq!(io.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn response_uses_detail_field() {
        let resp = ApiError::NotFound("response not found".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
