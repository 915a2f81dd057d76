//! Transport-independent error kinds shared by the REST surface, the
//! WebSocket `op_rejected` frame, and the OAuth endpoints.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("gone")]
    Gone,
    #[error("stale base sequence")]
    StaleBase,
    #[error("not the current presenter")]
    NotPresenter,
    #[error("duplicate operation id")]
    DuplicateOpId,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("rate limited")]
    RateLimited,
    #[error("capacity exceeded")]
    CapacityExceeded,
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// The machine-readable code carried alongside the human message, on
    /// both REST error bodies and WebSocket `op_rejected` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::Conflict => "conflict",
            AppError::Gone => "gone",
            AppError::StaleBase => "stale_base",
            AppError::NotPresenter => "not_presenter",
            AppError::DuplicateOpId => "duplicate_op_id",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::RateLimited => "rate_limited",
            AppError::CapacityExceeded => "capacity_exceeded",
            AppError::InvalidGrant(_) => "invalid_grant",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::NotPresenter => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::Gone => StatusCode::GONE,
            AppError::StaleBase | AppError::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InvalidGrant(_) => StatusCode::BAD_REQUEST,
            AppError::DuplicateOpId => StatusCode::OK,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(ref e) = self {
            tracing::error!(error = %e, "internal error");
        }
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_403() {
        assert_eq!(AppError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Forbidden.code(), "forbidden");
    }

    #[test]
    fn stale_base_maps_to_422() {
        assert_eq!(
            AppError::StaleBase.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn invalid_grant_maps_to_400() {
        let err = AppError::InvalidGrant("replayed state".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_grant");
    }

    #[test]
    fn not_presenter_is_distinct_from_forbidden() {
        assert_eq!(AppError::NotPresenter.code(), "not_presenter");
        assert_eq!(AppError::Forbidden.code(), "forbidden");
        assert_eq!(AppError::NotPresenter.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        assert_eq!(
            AppError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn internal_error_preserves_source() {
        let err = AppError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.code(), "internal");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
