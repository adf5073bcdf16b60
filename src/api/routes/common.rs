use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use log::{error, warn};
use serde::Serialize;

use crate::error::FormShiftError;

/// Header naming the user a request acts for; recorded as `executed_by`.
pub const EXECUTED_BY_HEADER: &str = "x-formshift-user";
pub const DEFAULT_EXECUTED_BY: &str = "system";

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offending_rows: Option<Vec<i64>>,
}

#[derive(Debug)]
pub struct ApiError(pub FormShiftError);

impl From<FormShiftError> for ApiError {
    fn from(e: FormShiftError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FormShiftError::DuplicateColumn { .. }
            | FormShiftError::FormBusy(_)
            | FormShiftError::JobNotCancellable(_)
            | FormShiftError::RestoreConflict(_) => StatusCode::CONFLICT,
            FormShiftError::NotFound(_) | FormShiftError::ColumnNotFound { .. } => StatusCode::NOT_FOUND,
            FormShiftError::UnsafeConversion { .. } | FormShiftError::NotRollbackable { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            FormShiftError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FormShiftError::QueueJobTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FormShiftError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
            offending_rows: self.0.offending_rows().map(<[i64]>::to_vec),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected ({}): {}", status, self.0);
        }
        (status, Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run database work on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, FormShiftError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(FormShiftError::Error(format!("Background task failed: {}", e))))?
        .map_err(ApiError)
}

pub fn executed_by(headers: &HeaderMap) -> String {
    headers
        .get(EXECUTED_BY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_EXECUTED_BY)
        .to_string()
}
