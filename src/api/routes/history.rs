use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::FormShiftError;
use crate::history::{HistoryEntry, MigrationHistory};

use super::common::{blocking, ApiResult};
use super::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<HistoryEntry>,
    pub total: i64,
}

impl HistoryParams {
    fn page(&self) -> Result<(i64, i64), FormShiftError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(FormShiftError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if offset < 0 {
            return Err(FormShiftError::InvalidInput("offset must not be negative".into()));
        }
        Ok((limit, offset))
    }
}

/// GET /migrations/history/{form_id}?limit=&offset=
///
/// Newest entries first. `total` counts every entry for the form.
pub async fn get_history(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<HistoryResponse> {
    let (limit, offset) = params.page()?;

    let (entries, total) = blocking(move || {
        let conn = state.db.get_connection()?;
        MigrationHistory::list_for_form(&conn, &form_id, limit, offset)
    })
    .await?;

    Ok(Json(HistoryResponse { entries, total }))
}
