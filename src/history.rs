use log::warn;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::changes::{ChangeKind, ChangeRecord};
use crate::column_type::ColumnType;
use crate::error::FormShiftError;

/// Lifecycle of a history entry. Stored as an integer in `migration_history.status`.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HistoryStatus {
    Pending = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
}

impl HistoryStatus {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => HistoryStatus::Pending,
            1 => HistoryStatus::Running,
            2 => HistoryStatus::Succeeded,
            3 => HistoryStatus::Failed,
            _ => {
                warn!(
                    "Invalid HistoryStatus value in database: {}, treating as Failed",
                    value
                );
                HistoryStatus::Failed
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HistoryStatus::Succeeded | HistoryStatus::Failed)
    }
}

#[derive(AsRefStr, Display, EnumString, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    AddField,
    DeleteField,
    ChangeType,
    RenameField,
    Rollback,
    RestoreBackup,
}

impl From<ChangeKind> for MigrationType {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::AddField => MigrationType::AddField,
            ChangeKind::DeleteField => MigrationType::DeleteField,
            ChangeKind::ChangeType => MigrationType::ChangeType,
            ChangeKind::RenameField => MigrationType::RenameField,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub form_id: String,
    pub field_id: String,
    pub migration_type: MigrationType,
    pub table_name: String,
    pub column_name: String,
    pub new_column_name: Option<String>,
    pub data_type: Option<ColumnType>,
    pub old_data_type: Option<ColumnType>,
    pub forward_sql: Option<String>,
    pub rollback_sql: Option<String>,
    pub status: HistoryStatus,
    pub executed_by: String,
    pub created_at: i64,
    pub executed_at: Option<i64>,
    pub error_message: Option<String>,
    pub backup_id: Option<i64>,
    pub rollback_of: Option<i64>,
}

/// Values for a history row about to be created in the PENDING state.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub form_id: String,
    pub field_id: String,
    pub migration_type: MigrationType,
    pub table_name: String,
    pub column_name: String,
    pub new_column_name: Option<String>,
    pub data_type: Option<ColumnType>,
    pub old_data_type: Option<ColumnType>,
    /// Planned SQL; replaced by the executed SQL on success
    pub forward_sql: Option<String>,
    pub executed_by: String,
    pub backup_id: Option<i64>,
    pub rollback_of: Option<i64>,
}

impl NewHistoryEntry {
    pub fn for_change(change: &ChangeRecord, table: &str, planned_sql: String, executed_by: &str) -> Self {
        Self {
            form_id: change.form_id.clone(),
            field_id: change.field_id.clone(),
            migration_type: change.kind.into(),
            table_name: table.to_string(),
            column_name: change.column_name.clone(),
            new_column_name: change.new_column_name.clone(),
            data_type: Some(change.data_type),
            old_data_type: change.old_data_type,
            forward_sql: Some(planned_sql),
            executed_by: executed_by.to_string(),
            backup_id: None,
            rollback_of: None,
        }
    }
}

const SELECT_COLUMNS: &str = "history_id, form_id, field_id, migration_type, table_name, column_name,
    new_column_name, data_type, old_data_type, forward_sql, rollback_sql, status, executed_by,
    created_at, executed_at, error_message, backup_id, rollback_of";

/// Durable audit log of migrations. Entries only move forward through their
/// lifecycle and are never modified once terminal.
pub struct MigrationHistory;

impl MigrationHistory {
    pub fn create_pending(conn: &Connection, entry: &NewHistoryEntry) -> Result<i64, FormShiftError> {
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO migration_history (
                form_id, field_id, migration_type, table_name, column_name, new_column_name,
                data_type, old_data_type, forward_sql, rollback_sql, status, executed_by,
                created_at, backup_id, rollback_of
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)",
            params![
                entry.form_id,
                entry.field_id,
                entry.migration_type.as_ref(),
                entry.table_name,
                entry.column_name,
                entry.new_column_name,
                entry.data_type.map(|t| t.to_string()),
                entry.old_data_type.map(|t| t.to_string()),
                entry.forward_sql,
                HistoryStatus::Pending.as_i64(),
                entry.executed_by,
                now,
                entry.backup_id,
                entry.rollback_of,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn mark_running(conn: &Connection, history_id: i64) -> Result<(), FormShiftError> {
        let updated = conn.execute(
            "UPDATE migration_history SET status = ?
             WHERE history_id = ? AND status IN (?, ?)",
            params![
                HistoryStatus::Running.as_i64(),
                history_id,
                HistoryStatus::Pending.as_i64(),
                HistoryStatus::Running.as_i64(),
            ],
        )?;
        Self::expect_transition(conn, history_id, updated, "start")
    }

    /// Record success. Rollback SQL is only ever written here, so it is non-null
    /// only for SUCCEEDED entries.
    pub fn mark_succeeded(
        conn: &Connection,
        history_id: i64,
        forward_sql: &str,
        rollback_sql: Option<&str>,
        backup_id: Option<i64>,
    ) -> Result<(), FormShiftError> {
        let now = chrono::Utc::now().timestamp();
        let updated = conn.execute(
            "UPDATE migration_history
             SET status = ?, forward_sql = ?, rollback_sql = ?, backup_id = COALESCE(?, backup_id),
                 executed_at = ?, error_message = NULL
             WHERE history_id = ? AND status IN (?, ?)",
            params![
                HistoryStatus::Succeeded.as_i64(),
                forward_sql,
                rollback_sql,
                backup_id,
                now,
                history_id,
                HistoryStatus::Pending.as_i64(),
                HistoryStatus::Running.as_i64(),
            ],
        )?;
        Self::expect_transition(conn, history_id, updated, "succeed")
    }

    /// Pin the type a change actually converted from. It differs from the
    /// recorded one when the live schema drifted; rollbacks reverse this type.
    pub fn record_converted_from(
        conn: &Connection,
        history_id: i64,
        from: ColumnType,
    ) -> Result<(), FormShiftError> {
        let updated = conn.execute(
            "UPDATE migration_history SET old_data_type = ?
             WHERE history_id = ? AND status IN (?, ?)",
            params![
                from.to_string(),
                history_id,
                HistoryStatus::Pending.as_i64(),
                HistoryStatus::Running.as_i64(),
            ],
        )?;
        Self::expect_transition(conn, history_id, updated, "record the converted type of")
    }

    /// Note a failed attempt that will be retried. The entry stays non-terminal.
    pub fn record_attempt_error(
        conn: &Connection,
        history_id: i64,
        message: &str,
    ) -> Result<(), FormShiftError> {
        let updated = conn.execute(
            "UPDATE migration_history SET error_message = ?
             WHERE history_id = ? AND status IN (?, ?)",
            params![
                message,
                history_id,
                HistoryStatus::Pending.as_i64(),
                HistoryStatus::Running.as_i64(),
            ],
        )?;
        Self::expect_transition(conn, history_id, updated, "record an error on")
    }

    pub fn mark_failed(conn: &Connection, history_id: i64, message: &str) -> Result<(), FormShiftError> {
        let now = chrono::Utc::now().timestamp();
        let updated = conn.execute(
            "UPDATE migration_history
             SET status = ?, error_message = ?, executed_at = ?, rollback_sql = NULL
             WHERE history_id = ? AND status IN (?, ?)",
            params![
                HistoryStatus::Failed.as_i64(),
                message,
                now,
                history_id,
                HistoryStatus::Pending.as_i64(),
                HistoryStatus::Running.as_i64(),
            ],
        )?;
        Self::expect_transition(conn, history_id, updated, "fail")
    }

    pub fn get(conn: &Connection, history_id: i64) -> Result<Option<HistoryEntry>, FormShiftError> {
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM migration_history WHERE history_id = ?",
                    SELECT_COLUMNS
                ),
                [history_id],
                Self::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Newest first.
    pub fn list_for_form(
        conn: &Connection,
        form_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<HistoryEntry>, i64), FormShiftError> {
        let total: i64 = conn.query_row(
            "SELECT count(*) FROM migration_history WHERE form_id = ?",
            [form_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM migration_history WHERE form_id = ?
             ORDER BY history_id DESC LIMIT ? OFFSET ?",
            SELECT_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![form_id, limit, offset], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((entries, total))
    }

    /// The successful rollback of `history_id`, if one has already been applied.
    pub fn find_succeeded_rollback(
        conn: &Connection,
        history_id: i64,
    ) -> Result<Option<HistoryEntry>, FormShiftError> {
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM migration_history
                     WHERE rollback_of = ? AND migration_type = ? AND status = ?
                     ORDER BY history_id LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![
                    history_id,
                    MigrationType::Rollback.as_ref(),
                    HistoryStatus::Succeeded.as_i64()
                ],
                Self::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// The migration that produced `backup_id`.
    pub fn find_by_backup(conn: &Connection, backup_id: i64) -> Result<Option<HistoryEntry>, FormShiftError> {
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM migration_history
                     WHERE backup_id = ? AND migration_type NOT IN (?, ?)
                     ORDER BY history_id LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![
                    backup_id,
                    MigrationType::Rollback.as_ref(),
                    MigrationType::RestoreBackup.as_ref()
                ],
                Self::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn expect_transition(
        conn: &Connection,
        history_id: i64,
        updated: usize,
        action: &str,
    ) -> Result<(), FormShiftError> {
        if updated == 1 {
            return Ok(());
        }

        match Self::get(conn, history_id)? {
            Some(entry) => Err(FormShiftError::Error(format!(
                "Cannot {} history entry {}: it is already {:?}",
                action, history_id, entry.status
            ))),
            None => Err(FormShiftError::NotFound(format!(
                "History entry {}",
                history_id
            ))),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<HistoryEntry> {
        let migration_type: String = row.get(3)?;
        let migration_type = migration_type.parse::<MigrationType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let parse_type = |s: Option<String>| s.and_then(|s| s.parse::<ColumnType>().ok());

        Ok(HistoryEntry {
            id: row.get(0)?,
            form_id: row.get(1)?,
            field_id: row.get(2)?,
            migration_type,
            table_name: row.get(4)?,
            column_name: row.get(5)?,
            new_column_name: row.get(6)?,
            data_type: parse_type(row.get(7)?),
            old_data_type: parse_type(row.get(8)?),
            forward_sql: row.get(9)?,
            rollback_sql: row.get(10)?,
            status: HistoryStatus::from_i64(row.get(11)?),
            executed_by: row.get(12)?,
            created_at: row.get(13)?,
            executed_at: row.get(14)?,
            error_message: row.get(15)?,
            backup_id: row.get(16)?,
            rollback_of: row.get(17)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn new_entry(form_id: &str, migration_type: MigrationType, column: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            form_id: form_id.to_string(),
            field_id: format!("field_{column}"),
            migration_type,
            table_name: form_id.to_string(),
            column_name: column.to_string(),
            new_column_name: None,
            data_type: Some(ColumnType::Text),
            old_data_type: None,
            forward_sql: None,
            executed_by: "tester".to_string(),
            backup_id: None,
            rollback_of: None,
        }
    }
}
