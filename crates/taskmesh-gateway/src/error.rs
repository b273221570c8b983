use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use taskmesh_core::TaskmeshError;
use tracing::error;

/// Error returned by route handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] TaskmeshError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

/// Result alias for route handlers.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Status code this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) | ApiError::Core(TaskmeshError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::BadRequest(_)
            | ApiError::Core(TaskmeshError::InvalidInput(_) | TaskmeshError::Json(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Core(TaskmeshError::Capacity(_)) => StatusCode::CONFLICT,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (TaskmeshError::NotFound("worker w1".into()), 404),
            (TaskmeshError::InvalidInput("empty worker id".into()), 400),
            (TaskmeshError::Capacity("Maximum worker limit (2) reached".into()), 409),
            (TaskmeshError::Handler("boom".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError::from(err).status().as_u16(), code);
        }
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_into_response_uses_mapped_status() {
        let resp = ApiError::from(TaskmeshError::Capacity("full".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
