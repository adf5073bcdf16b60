use chrono::Utc;
use log::{info, Level};
use logging_timer::timer;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::db::Database;
use crate::error::FormShiftError;
use crate::history::{HistoryStatus, MigrationType};
use crate::identifiers::{quote_ident, validate_identifier};
use crate::inspector::{SchemaInspector, SqliteInspector};

pub const DEFAULT_RETENTION_DAYS: i64 = 90;
pub const DEFAULT_BATCH_SIZE: usize = 1000;

const SECS_PER_DAY: i64 = 86_400;

/// One `{row_id, value}` pair of a column snapshot. The value keeps the storage
/// class it had in the live table.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub row_id: i64,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub id: i64,
    pub form_id: Option<String>,
    pub table_name: String,
    pub column_name: String,
    /// Declared SQL type of the column when it was snapshotted
    pub value_type: String,
    pub row_count: i64,
    pub created_at: i64,
    pub retention_until: i64,
    pub data_snapshot: Vec<SnapshotRow>,
}

impl BackupRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.retention_until
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub backup_id: i64,
    pub form_id: Option<String>,
    pub table_name: String,
    pub column_name: String,
    pub value_type: String,
    pub row_count: i64,
    pub created_at: i64,
    pub retention_until: i64,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub table_name: String,
    pub restored_column: String,
    pub rows_affected: usize,
    pub column_created: bool,
}

/// Column snapshots taken before destructive schema changes.
///
/// Snapshots are read and written in keyset batches of `batch_size` rows so a
/// large table never has to be held in a single statement.
#[derive(Debug, Clone)]
pub struct BackupStore {
    batch_size: usize,
    retention_days: i64,
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_RETENTION_DAYS)
    }
}

impl BackupStore {
    pub fn new(batch_size: usize, retention_days: i64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            retention_days: retention_days.max(0),
        }
    }

    /// Snapshot every row's value of `table.column`.
    ///
    /// Runs in its own transaction scope; when called inside an open transaction
    /// the snapshot commits or rolls back with it.
    pub fn backup_column(
        &self,
        conn: &Connection,
        form_id: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<BackupRecord, FormShiftError> {
        let _tmr = timer!(Level::Debug; "BackupStore::backup_column", "{}.{}", table, column);

        Database::immediate_transaction(conn, |c| {
            let inspector = SqliteInspector::new(c);
            let info = inspector.column_info(table, column)?.ok_or_else(|| {
                FormShiftError::ColumnNotFound {
                    table: table.to_string(),
                    column: column.to_string(),
                }
            })?;

            let created_at = Utc::now().timestamp();
            let retention_until = created_at + self.retention_days * SECS_PER_DAY;

            c.execute(
                "INSERT INTO data_backups (
                    form_id, table_name, column_name, value_type, row_count, created_at, retention_until
                ) VALUES (?, ?, ?, ?, 0, ?, ?)",
                params![form_id, table, info.name, info.declared_type, created_at, retention_until],
            )?;
            let backup_id = c.last_insert_rowid();

            let mut data_snapshot = Vec::new();
            {
                let mut insert = c.prepare_cached(
                    "INSERT INTO backup_rows (backup_id, row_id, value) VALUES (?, ?, ?)",
                )?;
                inspector.for_each_value(table, &info.name, self.batch_size, &mut |row_id, value| {
                    insert.execute(params![backup_id, row_id, value])?;
                    data_snapshot.push(SnapshotRow {
                        row_id,
                        value: value.clone(),
                    });
                    Ok(())
                })?;
            }

            let row_count = data_snapshot.len() as i64;
            c.execute(
                "UPDATE data_backups SET row_count = ? WHERE backup_id = ?",
                params![row_count, backup_id],
            )?;

            info!(
                "Backed up {} row(s) of {}.{} as backup {}",
                row_count, table, info.name, backup_id
            );

            Ok(BackupRecord {
                id: backup_id,
                form_id: form_id.map(str::to_string),
                table_name: table.to_string(),
                column_name: info.name,
                value_type: info.declared_type,
                row_count,
                created_at,
                retention_until,
                data_snapshot,
            })
        })
        .map_err(as_backup_failure)
    }

    /// Write a snapshot back into `table.column`.
    ///
    /// The column is created with the snapshot's declared type if missing. Rows that
    /// no longer exist are skipped and rows absent from the snapshot are untouched.
    pub fn restore_column(
        &self,
        conn: &Connection,
        backup_id: i64,
        table: &str,
        column: &str,
    ) -> Result<RestoreOutcome, FormShiftError> {
        let _tmr = timer!(Level::Debug; "BackupStore::restore_column", "{}", backup_id);

        Database::immediate_transaction(conn, |c| {
            let header = Self::summary(c, backup_id)?
                .ok_or_else(|| FormShiftError::NotFound(format!("Backup {}", backup_id)))?;

            let stored: i64 = c.query_row(
                "SELECT count(*) FROM backup_rows WHERE backup_id = ?",
                [backup_id],
                |row| row.get(0),
            )?;
            if stored != header.row_count {
                return Err(FormShiftError::BackupFailed(format!(
                    "Backup {} is incomplete: {} of {} row(s) stored",
                    backup_id, stored, header.row_count
                )));
            }

            let inspector = SqliteInspector::new(c);
            if !inspector.has_table(table)? {
                return Err(FormShiftError::NotFound(format!("Table '{}'", table)));
            }

            let column_created = match inspector.column_info(table, column)? {
                Some(live) => {
                    if !live.declared_type.eq_ignore_ascii_case(&header.value_type) {
                        return Err(FormShiftError::RestoreConflict(format!(
                            "{}.{} is {} but backup {} holds {} values",
                            table, column, live.declared_type, backup_id, header.value_type
                        )));
                    }
                    false
                }
                None => {
                    validate_identifier(column)?;
                    c.execute(
                        &format!(
                            "ALTER TABLE {} ADD COLUMN {} {}",
                            quote_ident(table),
                            quote_ident(column),
                            header.value_type
                        ),
                        [],
                    )?;
                    true
                }
            };

            let mut read = c.prepare(
                "SELECT row_id, value FROM backup_rows
                 WHERE backup_id = ? AND row_id > ? ORDER BY row_id LIMIT ?",
            )?;
            let mut write = c.prepare(&format!(
                "UPDATE {} SET {} = ? WHERE rowid = ?",
                quote_ident(table),
                quote_ident(column)
            ))?;

            let mut rows_affected = 0;
            let mut after = i64::MIN;
            loop {
                let batch = read
                    .query_map(params![backup_id, after, self.batch_size as i64], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, Value>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                for (row_id, value) in &batch {
                    rows_affected += write.execute(params![value, row_id])?;
                }

                match batch.last() {
                    Some(&(last, _)) if batch.len() == self.batch_size => after = last,
                    _ => break,
                }
            }

            info!(
                "Restored {} row(s) from backup {} into {}.{}",
                rows_affected, backup_id, table, column
            );

            Ok(RestoreOutcome {
                table_name: table.to_string(),
                restored_column: column.to_string(),
                rows_affected,
                column_created,
            })
        })
    }

    /// Delete backups past retention, or older than `max_age_days` when given.
    ///
    /// Backups referenced by a rollback or restore that hasn't finished are kept.
    pub fn sweep_expired(
        &self,
        conn: &Connection,
        now: i64,
        max_age_days: Option<i64>,
    ) -> Result<usize, FormShiftError> {
        if max_age_days.is_some_and(|d| d < 0) {
            return Err(FormShiftError::InvalidInput(
                "days must not be negative".to_string(),
            ));
        }
        let cutoff = max_age_days.map(|days| now - days * SECS_PER_DAY);

        let condition = "(retention_until <= ?1 OR (?2 IS NOT NULL AND created_at <= ?2))
            AND backup_id NOT IN (
                SELECT backup_id FROM migration_history
                WHERE backup_id IS NOT NULL
                  AND status IN (?3, ?4)
                  AND migration_type IN (?5, ?6)
            )";
        let pending = HistoryStatus::Pending.as_i64();
        let running = HistoryStatus::Running.as_i64();
        let rollback = MigrationType::Rollback.as_ref();
        let restore = MigrationType::RestoreBackup.as_ref();

        let deleted = Database::immediate_transaction(conn, |c| {
            c.execute(
                &format!(
                    "DELETE FROM backup_rows WHERE backup_id IN (SELECT backup_id FROM data_backups WHERE {})",
                    condition
                ),
                params![now, cutoff, pending, running, rollback, restore],
            )?;
            let deleted = c.execute(
                &format!("DELETE FROM data_backups WHERE {}", condition),
                params![now, cutoff, pending, running, rollback, restore],
            )?;
            Ok(deleted)
        })?;

        if deleted > 0 {
            info!("Backup sweep removed {} backup(s)", deleted);
        }
        Ok(deleted)
    }

    pub fn exists(conn: &Connection, backup_id: i64) -> Result<bool, FormShiftError> {
        Ok(Self::summary(conn, backup_id)?.is_some())
    }

    pub fn summary(conn: &Connection, backup_id: i64) -> Result<Option<BackupSummary>, FormShiftError> {
        let now = Utc::now().timestamp();
        let summary = conn
            .query_row(
                "SELECT backup_id, table_name, column_name, value_type, row_count, created_at, retention_until, form_id
                 FROM data_backups WHERE backup_id = ?",
                [backup_id],
                |row| Self::summary_from_row(row, now),
            )
            .optional()?;
        Ok(summary)
    }

    /// Newest first.
    pub fn list_for_form(conn: &Connection, form_id: &str) -> Result<Vec<BackupSummary>, FormShiftError> {
        let now = Utc::now().timestamp();
        let mut stmt = conn.prepare(
            "SELECT backup_id, table_name, column_name, value_type, row_count, created_at, retention_until, form_id
             FROM data_backups WHERE form_id = ? ORDER BY backup_id DESC",
        )?;
        let backups = stmt
            .query_map([form_id], |row| Self::summary_from_row(row, now))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(backups)
    }

    /// Load a backup including its full snapshot.
    pub fn load(conn: &Connection, backup_id: i64) -> Result<Option<BackupRecord>, FormShiftError> {
        let header = conn
            .query_row(
                "SELECT form_id, table_name, column_name, value_type, row_count, created_at, retention_until
                 FROM data_backups WHERE backup_id = ?",
                [backup_id],
                |row| {
                    Ok(BackupRecord {
                        id: backup_id,
                        form_id: row.get(0)?,
                        table_name: row.get(1)?,
                        column_name: row.get(2)?,
                        value_type: row.get(3)?,
                        row_count: row.get(4)?,
                        created_at: row.get(5)?,
                        retention_until: row.get(6)?,
                        data_snapshot: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut record) = header else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT row_id, value FROM backup_rows WHERE backup_id = ? ORDER BY row_id")?;
        record.data_snapshot = stmt
            .query_map([backup_id], |row| {
                Ok(SnapshotRow {
                    row_id: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(record))
    }

    fn summary_from_row(row: &Row, now: i64) -> rusqlite::Result<BackupSummary> {
        let retention_until: i64 = row.get(6)?;
        Ok(BackupSummary {
            backup_id: row.get(0)?,
            table_name: row.get(1)?,
            column_name: row.get(2)?,
            value_type: row.get(3)?,
            row_count: row.get(4)?,
            created_at: row.get(5)?,
            retention_until,
            expired: now >= retention_until,
            form_id: row.get(7)?,
        })
    }
}

/// Storage errors while snapshotting surface as `BackupFailed`. Interrupts are
/// kept so the caller can report a timeout.
fn as_backup_failure(e: FormShiftError) -> FormShiftError {
    if e.is_interrupt() {
        return e;
    }
    match e {
        FormShiftError::DatabaseError(err) => FormShiftError::BackupFailed(err.to_string()),
        FormShiftError::PoolError(err) => FormShiftError::BackupFailed(err.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{create_orders_table, test_database};
    use crate::history::test_support::new_entry;
    use crate::history::MigrationHistory;
    use pretty_assertions::assert_eq;

    fn seed_amounts(conn: &Connection, amounts: &[&str]) {
        for amount in amounts {
            conn.execute("INSERT INTO orders (status, amount) VALUES ('new', ?)", [amount])
                .unwrap();
        }
    }

    fn amounts(conn: &Connection) -> Vec<(i64, Value)> {
        conn.prepare("SELECT rowid, amount FROM orders ORDER BY rowid")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_backup_captures_every_row_across_batches() {
        let (_dir, db) = test_database();
        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);
        seed_amounts(&conn, &["1", "2", "3", "4", "5"]);
        conn.execute("UPDATE orders SET amount = NULL WHERE id = 4", []).unwrap();

        let store = BackupStore::new(2, 90);
        let backup = store
            .backup_column(&conn, Some("orders"), "orders", "amount")
            .unwrap();

        assert_eq!(backup.row_count, 5);
        assert_eq!(backup.value_type, "TEXT");
        assert_eq!(backup.data_snapshot[3].value, Value::Null);
        assert_eq!(backup.retention_until - backup.created_at, 90 * SECS_PER_DAY);

        let loaded = BackupStore::load(&conn, backup.id).unwrap().unwrap();
        assert_eq!(loaded, backup);
        assert!(!loaded.is_expired(loaded.created_at));
        assert!(loaded.is_expired(loaded.retention_until));
    }

    #[test]
    fn test_backup_of_missing_column_fails() {
        let (_dir, db) = test_database();
        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);

        let result = BackupStore::default().backup_column(&conn, None, "orders", "nope");
        assert!(matches!(result, Err(FormShiftError::ColumnNotFound { .. })));
        let count: i64 = conn
            .query_row("SELECT count(*) FROM data_backups", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_restore_recreates_column_and_skips_missing_rows() {
        let (_dir, db) = test_database();
        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);
        seed_amounts(&conn, &["100", "200", "abc"]);

        let store = BackupStore::new(2, 90);
        let backup = store.backup_column(&conn, None, "orders", "amount").unwrap();
        conn.execute_batch("ALTER TABLE orders DROP COLUMN amount; DELETE FROM orders WHERE id = 2;")
            .unwrap();
        conn.execute("INSERT INTO orders (status) VALUES ('later')", []).unwrap();

        let outcome = store
            .restore_column(&conn, backup.id, "orders", "amount")
            .unwrap();
        assert!(outcome.column_created);
        assert_eq!(outcome.rows_affected, 2);

        assert_eq!(
            amounts(&conn),
            vec![
                (1, Value::Text("100".into())),
                (3, Value::Text("abc".into())),
                (4, Value::Null),
            ]
        );
    }

    #[test]
    fn test_restore_rejects_type_mismatch() {
        let (_dir, db) = test_database();
        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);
        seed_amounts(&conn, &["1"]);

        let store = BackupStore::default();
        let backup = store.backup_column(&conn, None, "orders", "amount").unwrap();
        conn.execute_batch("ALTER TABLE orders DROP COLUMN amount; ALTER TABLE orders ADD COLUMN amount INTEGER;")
            .unwrap();

        let result = store.restore_column(&conn, backup.id, "orders", "amount");
        assert!(matches!(result, Err(FormShiftError::RestoreConflict(_))));
        assert!(matches!(
            store.restore_column(&conn, 999, "orders", "amount"),
            Err(FormShiftError::NotFound(_))
        ));
    }

    #[test]
    fn test_sweep_respects_retention_and_pending_rollbacks() {
        let (_dir, db) = test_database();
        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);
        seed_amounts(&conn, &["1", "2"]);

        let store = BackupStore::default();
        let kept = store.backup_column(&conn, Some("orders"), "orders", "amount").unwrap();
        let swept = store.backup_column(&conn, Some("orders"), "orders", "status").unwrap();

        let mut rollback = new_entry("orders", MigrationType::Rollback, "amount");
        rollback.backup_id = Some(kept.id);
        MigrationHistory::create_pending(&conn, &rollback).unwrap();

        let now = Utc::now().timestamp();
        assert_eq!(store.sweep_expired(&conn, now, None).unwrap(), 0);

        let later = now + 91 * SECS_PER_DAY;
        assert_eq!(store.sweep_expired(&conn, later, None).unwrap(), 1);
        assert!(BackupStore::exists(&conn, kept.id).unwrap());
        assert!(!BackupStore::exists(&conn, swept.id).unwrap());

        let orphaned: i64 = conn
            .query_row(
                "SELECT count(*) FROM backup_rows WHERE backup_id = ?",
                [swept.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(orphaned, 0);
    }

    #[test]
    fn test_sweep_with_max_age() {
        let (_dir, db) = test_database();
        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);

        let store = BackupStore::default();
        store.backup_column(&conn, Some("orders"), "orders", "amount").unwrap();

        let now = Utc::now().timestamp();
        assert_eq!(store.sweep_expired(&conn, now, Some(1)).unwrap(), 0);
        assert_eq!(
            store
                .sweep_expired(&conn, now + 2 * SECS_PER_DAY, Some(1))
                .unwrap(),
            1
        );
        assert!(store.sweep_expired(&conn, now, Some(-1)).is_err());
        assert!(BackupStore::list_for_form(&conn, "orders").unwrap().is_empty());
    }
}
