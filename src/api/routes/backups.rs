use axum::{
    extract::{Path, Query, State},
    Json,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::backups::{BackupStore, BackupSummary};

use super::common::{blocking, ApiResult};
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct BackupsResponse {
    pub backups: Vec<BackupSummary>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    /// Also delete backups older than this many days, even within retention
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub deleted_backups: usize,
}

/// GET /migrations/backups/{form_id}
pub async fn list_backups(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
) -> ApiResult<BackupsResponse> {
    let backups = blocking(move || {
        let conn = state.db.get_connection()?;
        BackupStore::list_for_form(&conn, &form_id)
    })
    .await?;

    Ok(Json(BackupsResponse { backups }))
}

/// DELETE /migrations/cleanup?days=
///
/// Runs the retention sweep. Backups still needed by an unfinished rollback or
/// restore are kept.
pub async fn cleanup_backups(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> ApiResult<CleanupResponse> {
    let deleted_backups = blocking(move || {
        let conn = state.db.get_connection()?;
        let now = chrono::Utc::now().timestamp();
        state.engine.backups().sweep_expired(&conn, now, params.days)
    })
    .await?;

    info!("Cleanup via API removed {} backup(s)", deleted_backups);
    Ok(Json(CleanupResponse { deleted_backups }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::test_support::{create_orders_table, test_database};
    use crate::engine::{EngineSettings, ExecContext};
    use crate::identifiers::PrefixTableMapper;
    use crate::queue::QueueSettings;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_list_and_cleanup_backups() {
        let (_dir, db) = test_database();
        let state = AppState::new(
            db.clone(),
            Arc::new(PrefixTableMapper::new("")),
            EngineSettings::default(),
            QueueSettings::default(),
        );
        {
            let conn = db.get_connection().unwrap();
            create_orders_table(&conn);
            conn.execute_batch("INSERT INTO orders (status, amount) VALUES ('a', '1')")
                .unwrap();
            let ctx = ExecContext {
                form_id: Some("orders"),
                history_id: None,
            };
            state.engine.drop_column(&conn, ctx, "orders", "amount", true).unwrap();
        }

        let Json(listed) = list_backups(State(state.clone()), Path("orders".to_string()))
            .await
            .unwrap();
        assert_eq!(listed.backups.len(), 1);
        assert_eq!(listed.backups[0].column_name, "amount");
        assert_eq!(listed.backups[0].row_count, 1);
        assert!(!listed.backups[0].expired);

        let Json(kept) = cleanup_backups(State(state.clone()), Query(CleanupParams { days: None }))
            .await
            .unwrap();
        assert_eq!(kept.deleted_backups, 0);

        let Json(swept) = cleanup_backups(State(state.clone()), Query(CleanupParams { days: Some(0) }))
            .await
            .unwrap();
        assert_eq!(swept.deleted_backups, 1);

        let err = cleanup_backups(State(state), Query(CleanupParams { days: Some(-1) }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
