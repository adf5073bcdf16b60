use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::changes::{ChangeRecord, FieldDef};
use crate::detector::ChangeDetector;
use crate::engine::{MigrationPreview, PreviewSummary};
use crate::error::FormShiftError;
use crate::history::HistoryEntry;
use crate::identifiers::validate_identifier;
use crate::inspector::SqliteInspector;
use crate::queue::{DeadLetter, EnqueuedJob, QueueJob, QueueStatus};

use super::common::{blocking, executed_by, ApiError, ApiResult};
use super::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectRequest {
    pub form_id: String,
    pub old_fields: Vec<FieldDef>,
    pub new_fields: Vec<FieldDef>,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub changes: Vec<ChangeRecord>,
}

/// Body of both preview and execute requests.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesRequest {
    pub form_id: String,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub preview: Vec<MigrationPreview>,
    pub summary: PreviewSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub queued_jobs: Vec<EnqueuedJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusParams {
    pub form_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    pub new_history_entry: HistoryEntry,
    pub already_rolled_back: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub restored_column: String,
    pub rows_affected: usize,
    pub column_created: bool,
    pub history_entry: HistoryEntry,
}

fn check_form_id(form_id: &str) -> Result<(), FormShiftError> {
    if form_id.trim().is_empty() {
        return Err(FormShiftError::InvalidInput("formId is required".to_string()));
    }
    Ok(())
}

/// POST /migrations/detect
///
/// Diffs two field lists into ordered change records. Pure; nothing is stored.
pub async fn detect_changes(Json(req): Json<DetectRequest>) -> ApiResult<DetectResponse> {
    check_form_id(&req.form_id)?;
    let changes = ChangeDetector::detect(&req.form_id, &req.old_fields, &req.new_fields);
    Ok(Json(DetectResponse { changes }))
}

/// POST /migrations/preview
///
/// Dry run against the live schema. Later changes in the batch are planned
/// against the schema the earlier ones would produce.
pub async fn preview_migrations(
    State(state): State<AppState>,
    Json(req): Json<ChangesRequest>,
) -> ApiResult<PreviewResponse> {
    check_form_id(&req.form_id)?;
    for change in &req.changes {
        if change.form_id != req.form_id {
            return Err(ApiError(FormShiftError::InvalidInput(format!(
                "Change for form '{}' submitted under form '{}'",
                change.form_id, req.form_id
            ))));
        }
    }

    let preview = blocking(move || {
        let table = state.queue.table_for_form(&req.form_id);
        validate_identifier(&table)?;
        let conn = state.db.get_connection()?;
        let inspector = SqliteInspector::new(&conn);
        state.engine.preview_batch(&inspector, &table, &req.changes)
    })
    .await?;

    let summary = PreviewSummary::from_previews(&preview);
    Ok(Json(PreviewResponse { preview, summary }))
}

/// POST /migrations/execute
///
/// Queues the changes and returns as soon as they are durably recorded.
pub async fn execute_migrations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangesRequest>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    check_form_id(&req.form_id)?;
    if req.changes.is_empty() {
        return Err(ApiError(FormShiftError::InvalidInput(
            "changes must not be empty".to_string(),
        )));
    }
    let user = executed_by(&headers);

    let queued_jobs =
        blocking(move || state.queue.enqueue_batch(&req.form_id, &req.changes, &user)).await?;

    Ok((StatusCode::ACCEPTED, Json(ExecuteResponse { queued_jobs })))
}

/// GET /migrations/queue/status?formId=
pub async fn get_queue_status(
    State(state): State<AppState>,
    Query(params): Query<QueueStatusParams>,
) -> ApiResult<QueueStatus> {
    check_form_id(&params.form_id)?;
    let status = blocking(move || state.queue.status(&params.form_id)).await?;
    Ok(Json(status))
}

/// POST /migrations/jobs/{job_id}/cancel
pub async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<i64>) -> ApiResult<QueueJob> {
    let job = blocking(move || state.queue.cancel(job_id)).await?;
    Ok(Json(job))
}

/// GET /migrations/dead-letters/{form_id}
pub async fn get_dead_letters(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
) -> ApiResult<DeadLettersResponse> {
    let dead_letters = blocking(move || state.queue.dead_letters(&form_id)).await?;
    Ok(Json(DeadLettersResponse { dead_letters }))
}

/// POST /migrations/rollback/{history_id}
pub async fn rollback_migration(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(history_id): Path<i64>,
) -> ApiResult<RollbackResponse> {
    let user = executed_by(&headers);
    let outcome = blocking(move || state.coordinator.rollback(history_id, &user)).await?;

    if !outcome.already_rolled_back {
        info!("Rollback of migration {} requested via API completed", history_id);
    }
    Ok(Json(RollbackResponse {
        new_history_entry: outcome.entry,
        already_rolled_back: outcome.already_rolled_back,
    }))
}

/// POST /migrations/restore/{backup_id}
pub async fn restore_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(backup_id): Path<i64>,
) -> ApiResult<RestoreResponse> {
    let user = executed_by(&headers);
    let result = blocking(move || state.coordinator.restore_backup(backup_id, &user)).await?;

    Ok(Json(RestoreResponse {
        restored_column: result.outcome.restored_column,
        rows_affected: result.outcome.rows_affected,
        column_created: result.outcome.column_created,
        history_entry: result.entry,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::changes::ChangeKind;
    use crate::column_type::ColumnType;
    use crate::db::test_support::{create_orders_table, test_database};
    use crate::db::Database;
    use crate::engine::EngineSettings;
    use crate::identifiers::PrefixTableMapper;
    use crate::queue::{JobStatus, QueueSettings};
    use tempfile::TempDir;

    fn test_state() -> (TempDir, Database, AppState) {
        let (dir, db) = test_database();
        {
            let conn = db.get_connection().unwrap();
            create_orders_table(&conn);
            conn.execute_batch("INSERT INTO orders (status, amount) VALUES ('new', '5'), ('old', 'abc')")
                .unwrap();
        }
        let state = AppState::new(
            db.clone(),
            Arc::new(PrefixTableMapper::new("")),
            EngineSettings::default(),
            QueueSettings::default(),
        );
        (dir, db, state)
    }

    fn amount_to_integer() -> ChangeRecord {
        ChangeRecord::change_type("orders", "f_amount", "amount", ColumnType::Text, ColumnType::Integer)
    }

    #[tokio::test]
    async fn test_detect_orders_renames_before_deletes() {
        let old_fields = vec![
            FieldDef::new("a", "status", ColumnType::Text),
            FieldDef::new("b", "amount", ColumnType::Text),
        ];
        let new_fields = vec![FieldDef::new("a", "order_status", ColumnType::Text)];

        let Json(resp) = detect_changes(Json(DetectRequest {
            form_id: "orders".into(),
            old_fields,
            new_fields,
        }))
        .await
        .unwrap();

        let kinds: Vec<ChangeKind> = resp.changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::RenameField, ChangeKind::DeleteField]);
    }

    #[tokio::test]
    async fn test_preview_reports_unconvertible_rows_without_side_effects() {
        let (_dir, db, state) = test_state();

        let Json(resp) = preview_migrations(
            State(state),
            Json(ChangesRequest {
                form_id: "orders".into(),
                changes: vec![amount_to_integer()],
            }),
        )
        .await
        .unwrap();

        assert_eq!(resp.preview.len(), 1);
        assert!(resp.preview[0].requires_backup);
        assert!(!resp.preview[0].warnings.is_empty());
        assert_eq!(resp.summary.total_changes, 1);

        let conn = db.get_connection().unwrap();
        let history: i64 = conn
            .query_row("SELECT count(*) FROM migration_history", [], |r| r.get(0))
            .unwrap();
        let backups: i64 = conn
            .query_row("SELECT count(*) FROM data_backups", [], |r| r.get(0))
            .unwrap();
        assert_eq!((history, backups), (0, 0));
    }

    #[tokio::test]
    async fn test_execute_queues_jobs() {
        let (_dir, _db, state) = test_state();

        let (status, Json(resp)) = execute_migrations(
            State(state.clone()),
            HeaderMap::new(),
            Json(ChangesRequest {
                form_id: "orders".into(),
                changes: vec![ChangeRecord::add_field(
                    "orders",
                    &FieldDef::new("f_note", "note", ColumnType::Text),
                )],
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(resp.queued_jobs.len(), 1);
        assert_eq!(resp.queued_jobs[0].status, JobStatus::Queued);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["queuedJobs"][0]["type"], "ADD_FIELD");
        assert_eq!(json["queuedJobs"][0]["status"], "queued");

        let Json(queue) = get_queue_status(
            State(state),
            Query(QueueStatusParams {
                form_id: "orders".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(queue.waiting, 1);
    }

    #[tokio::test]
    async fn test_execute_rejects_mismatched_form() {
        let (_dir, _db, state) = test_state();

        let err = execute_migrations(
            State(state),
            HeaderMap::new(),
            Json(ChangesRequest {
                form_id: "invoices".into(),
                changes: vec![amount_to_integer()],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rollback_unknown_entry_is_not_found() {
        let (_dir, _db, state) = test_state();
        let err = rollback_migration(State(state), HeaderMap::new(), Path(42))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
