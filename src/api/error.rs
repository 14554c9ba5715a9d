//! Maps [`EtlError`] onto the Control API's HTTP surface. Workers never see an
//! HTTP status; this is the one place a crate error becomes one.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::EtlError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    error: String,
}

pub struct ApiError(EtlError);

impl From<EtlError> for ApiError {
    fn from(error: EtlError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EtlError::NotFound(_) => StatusCode::NOT_FOUND,
            EtlError::TenantMismatch { .. } => StatusCode::FORBIDDEN,
            EtlError::Configuration(_) | EtlError::PermanentData(_) => StatusCode::BAD_REQUEST,
            EtlError::TransientExternal(_) | EtlError::TransientInternal(_) => StatusCode::SERVICE_UNAVAILABLE,
            EtlError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiErrorBody { error: self.0.to_string() })).into_response()
    }
}
