use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::{store::StoreError, vendor::VendorError};

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(#[from] StoreError),
    #[error("{0}")]
    Upstream(#[from] VendorError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(err) => {
                error!("Store error while serving request: {}", err);
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Upstream(err) => {
                warn!("Vendor error while serving request: {}", err);
                StatusCode::BAD_GATEWAY
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::NotFound("device".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::BadRequest("range".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::ServiceUnavailable(StoreError::Unavailable(sqlx::Error::PoolClosed))
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Upstream(VendorError::AuthFailed("401".into()))
                .into_response()
                .status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
