use std::sync::Arc;

use log::{error, info, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;

use crate::backups::{BackupStore, RestoreOutcome};
use crate::column_type::ColumnType;
use crate::db::Database;
use crate::engine::{find_unconvertible, run_retype, sql, MigrationEngine, MAX_REPORTED_ROWS};
use crate::error::FormShiftError;
use crate::history::{HistoryEntry, HistoryStatus, MigrationHistory, MigrationType, NewHistoryEntry};
use crate::inspector::{SchemaInspector, SqliteInspector};
use crate::queue::MigrationQueue;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    /// The ROLLBACK entry: new, or the one recorded by an earlier rollback
    pub entry: HistoryEntry,
    pub already_rolled_back: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub entry: HistoryEntry,
    pub outcome: RestoreOutcome,
}

/// How a succeeded migration is undone.
#[derive(Debug, Clone, PartialEq)]
enum RollbackAction {
    /// Replay the recorded reverse SQL
    Replay { sql: String },
    /// Run a safe type change's reverse conversion once every value is known to
    /// fit the type the change converted from
    Reconvert {
        column: String,
        from: ColumnType,
        to: ColumnType,
    },
    /// Drop the converted column and rebuild it from the pre-conversion backup
    DropAndRestore { backup_id: i64, column: String },
    /// Recreate a dropped column from its backup
    Restore { backup_id: i64, column: String },
}

impl RollbackAction {
    fn backup_id(&self) -> Option<i64> {
        match self {
            RollbackAction::DropAndRestore { backup_id, .. } | RollbackAction::Restore { backup_id, .. } => {
                Some(*backup_id)
            }
            _ => None,
        }
    }

    fn plan(target: &HistoryEntry) -> Result<Self, FormShiftError> {
        let not_rollbackable = |reason: &str| FormShiftError::NotRollbackable {
            history_id: target.id,
            reason: reason.to_string(),
        };

        match (target.migration_type, &target.rollback_sql, target.backup_id) {
            (MigrationType::AddField | MigrationType::RenameField, Some(sql), _) => {
                Ok(RollbackAction::Replay { sql: sql.clone() })
            }
            (MigrationType::ChangeType, Some(_), _) => {
                let (Some(from), Some(to)) = (target.data_type, target.old_data_type) else {
                    return Err(not_rollbackable("the recorded type change is missing its types"));
                };
                Ok(RollbackAction::Reconvert {
                    column: target.column_name.clone(),
                    from,
                    to,
                })
            }
            (MigrationType::ChangeType, None, Some(backup_id)) => Ok(RollbackAction::DropAndRestore {
                backup_id,
                column: target.column_name.clone(),
            }),
            (MigrationType::DeleteField, _, Some(backup_id)) => Ok(RollbackAction::Restore {
                backup_id,
                column: target.column_name.clone(),
            }),
            (MigrationType::Rollback | MigrationType::RestoreBackup, _, _) => {
                Err(not_rollbackable("rollback and restore entries cannot be rolled back"))
            }
            _ => Err(not_rollbackable("no rollback SQL or backup was recorded")),
        }
    }
}

/// Undoes succeeded migrations and restores backups.
///
/// Both take the form's exclusivity slot from the queue, so they never run beside
/// a queued migration of the same form. Every attempt is recorded as its own
/// history entry; the entry being undone is never modified.
pub struct RollbackCoordinator {
    db: Database,
    engine: Arc<MigrationEngine>,
    queue: MigrationQueue,
}

impl RollbackCoordinator {
    pub fn new(db: Database, engine: Arc<MigrationEngine>, queue: MigrationQueue) -> Self {
        Self { db, engine, queue }
    }

    pub fn rollback(&self, history_id: i64, executed_by: &str) -> Result<RollbackOutcome, FormShiftError> {
        let _tmr = timer!(Level::Debug; "RollbackCoordinator::rollback", "{}", history_id);
        let conn = self.db.get_connection()?;

        let target = MigrationHistory::get(&conn, history_id)?
            .ok_or_else(|| FormShiftError::NotFound(format!("History entry {}", history_id)))?;

        if let Some(existing) = Self::previous_rollback(&conn, &target)? {
            return Ok(existing);
        }
        if target.status != HistoryStatus::Succeeded {
            return Err(FormShiftError::NotRollbackable {
                history_id,
                reason: format!("it is {:?}; only succeeded migrations can be rolled back", target.status),
            });
        }
        let action = RollbackAction::plan(&target)?;

        let _reservation = self.queue.reserve_form(&target.form_id)?;

        // Another rollback may have finished while we waited for the form
        if let Some(existing) = Self::previous_rollback(&conn, &target)? {
            return Ok(existing);
        }

        let entry = NewHistoryEntry {
            form_id: target.form_id.clone(),
            field_id: target.field_id.clone(),
            migration_type: MigrationType::Rollback,
            table_name: target.table_name.clone(),
            column_name: target.column_name.clone(),
            new_column_name: target.new_column_name.clone(),
            data_type: target.old_data_type.or(target.data_type),
            old_data_type: target.data_type,
            forward_sql: None,
            executed_by: executed_by.to_string(),
            backup_id: action.backup_id(),
            rollback_of: Some(target.id),
        };

        let rollback_id = self.start_entry(&conn, &entry)?;
        let result = Database::immediate_transaction(&conn, |c| {
            let executed = self.apply(c, &target, &action)?;
            MigrationHistory::mark_succeeded(c, rollback_id, &executed, None, action.backup_id())?;
            Ok(())
        });
        self.finish_entry(&conn, rollback_id, result)?;

        info!(
            "Rolled back migration {} ({} on {}.{}) as history entry {}",
            target.id, target.migration_type, target.table_name, target.column_name, rollback_id
        );

        let entry = MigrationHistory::get(&conn, rollback_id)?
            .ok_or_else(|| FormShiftError::NotFound(format!("History entry {}", rollback_id)))?;
        Ok(RollbackOutcome {
            entry,
            already_rolled_back: false,
        })
    }

    /// Restore a backup into the column it was taken from, recorded as a
    /// RESTORE_BACKUP history entry.
    pub fn restore_backup(&self, backup_id: i64, executed_by: &str) -> Result<RestoreResult, FormShiftError> {
        let _tmr = timer!(Level::Debug; "RollbackCoordinator::restore_backup", "{}", backup_id);
        let conn = self.db.get_connection()?;

        let backup = BackupStore::summary(&conn, backup_id)?
            .ok_or_else(|| FormShiftError::NotFound(format!("Backup {}", backup_id)))?;
        let source = MigrationHistory::find_by_backup(&conn, backup_id)?;

        let form_id = backup
            .form_id
            .clone()
            .or_else(|| source.as_ref().map(|s| s.form_id.clone()))
            .ok_or_else(|| {
                FormShiftError::RestoreConflict(format!("Backup {} is not associated with a form", backup_id))
            })?;
        let _reservation = self.queue.reserve_form(&form_id)?;

        let entry = NewHistoryEntry {
            form_id: form_id.clone(),
            field_id: source
                .as_ref()
                .map(|s| s.field_id.clone())
                .unwrap_or_else(|| backup.column_name.clone()),
            migration_type: MigrationType::RestoreBackup,
            table_name: backup.table_name.clone(),
            column_name: backup.column_name.clone(),
            new_column_name: None,
            data_type: ColumnType::from_declared(&backup.value_type),
            old_data_type: None,
            forward_sql: None,
            executed_by: executed_by.to_string(),
            backup_id: Some(backup_id),
            rollback_of: None,
        };

        let restore_id = self.start_entry(&conn, &entry)?;
        let result = Database::immediate_transaction(&conn, |c| {
            let outcome =
                self.engine
                    .backups()
                    .restore_column(c, backup_id, &backup.table_name, &backup.column_name)?;
            let executed = restore_note(backup_id, &outcome);
            MigrationHistory::mark_succeeded(c, restore_id, &executed, None, Some(backup_id))?;
            Ok(outcome)
        });
        let outcome = self.finish_entry(&conn, restore_id, result)?;

        let entry = MigrationHistory::get(&conn, restore_id)?
            .ok_or_else(|| FormShiftError::NotFound(format!("History entry {}", restore_id)))?;
        Ok(RestoreResult { entry, outcome })
    }

    fn previous_rollback(
        conn: &Connection,
        target: &HistoryEntry,
    ) -> Result<Option<RollbackOutcome>, FormShiftError> {
        if matches!(
            target.migration_type,
            MigrationType::Rollback | MigrationType::RestoreBackup
        ) {
            return Ok(None);
        }

        Ok(MigrationHistory::find_succeeded_rollback(conn, target.id)?.map(|entry| {
            info!("Migration {} was already rolled back by entry {}", target.id, entry.id);
            RollbackOutcome {
                entry,
                already_rolled_back: true,
            }
        }))
    }

    fn start_entry(&self, conn: &Connection, entry: &NewHistoryEntry) -> Result<i64, FormShiftError> {
        Database::immediate_transaction(conn, |c| {
            let id = MigrationHistory::create_pending(c, entry)?;
            MigrationHistory::mark_running(c, id)?;
            Ok(id)
        })
    }

    /// Record a failed attempt on its history entry and pass the result through.
    fn finish_entry<T>(
        &self,
        conn: &Connection,
        history_id: i64,
        result: Result<T, FormShiftError>,
    ) -> Result<T, FormShiftError> {
        if let Err(e) = &result {
            error!("History entry {} failed: {}", history_id, e);
            if let Err(mark_err) = MigrationHistory::mark_failed(conn, history_id, &e.to_string()) {
                error!("Could not mark history entry {} failed: {}", history_id, mark_err);
            }
        }
        result
    }

    /// Undo `target` on the connection's open transaction. Returns the SQL
    /// recorded for the rollback entry.
    fn apply(
        &self,
        conn: &Connection,
        target: &HistoryEntry,
        action: &RollbackAction,
    ) -> Result<String, FormShiftError> {
        let table = target.table_name.as_str();
        let inspector = SqliteInspector::new(conn);
        if !inspector.has_table(table)? {
            return Err(FormShiftError::NotFound(format!("Table '{}'", table)));
        }

        match action {
            RollbackAction::Replay { sql } => {
                conn.execute_batch(sql)?;
                Ok(sql.clone())
            }
            RollbackAction::Reconvert { column, from, to } => {
                let live = inspector.column_info(table, column)?.ok_or_else(|| {
                    FormShiftError::ColumnNotFound {
                        table: table.to_string(),
                        column: column.clone(),
                    }
                })?;
                if live.column_type != Some(*from) {
                    return Err(FormShiftError::NotRollbackable {
                        history_id: target.id,
                        reason: format!(
                            "{}.{} is no longer {} (declared '{}')",
                            table, live.name, from, live.declared_type
                        ),
                    });
                }
                let bad = find_unconvertible(
                    &inspector,
                    table,
                    &live.name,
                    *from,
                    *to,
                    self.engine.settings().backup_batch_size,
                    MAX_REPORTED_ROWS,
                )?;
                if bad.total > 0 {
                    return Err(FormShiftError::UnsafeConversion {
                        table: table.to_string(),
                        column: column.clone(),
                        from: from.to_string(),
                        to: to.to_string(),
                        row_ids: bad.row_ids,
                    });
                }
                run_retype(conn, table, &live.name, *from, *to)
            }
            RollbackAction::DropAndRestore { backup_id, column } => {
                let live = inspector.column_info(table, column)?.ok_or_else(|| {
                    FormShiftError::ColumnNotFound {
                        table: table.to_string(),
                        column: column.clone(),
                    }
                })?;
                if !BackupStore::exists(conn, *backup_id)? {
                    return Err(FormShiftError::NotRollbackable {
                        history_id: target.id,
                        reason: format!("backup {} no longer exists", backup_id),
                    });
                }

                let drop_sql = sql::drop_column(table, &live.name);
                conn.execute_batch(&drop_sql)?;
                let outcome = self.engine.backups().restore_column(conn, *backup_id, table, &live.name)?;
                Ok(format!("{};\n{}", drop_sql, restore_note(*backup_id, &outcome)))
            }
            RollbackAction::Restore { backup_id, column } => {
                if !BackupStore::exists(conn, *backup_id)? {
                    return Err(FormShiftError::NotRollbackable {
                        history_id: target.id,
                        reason: format!("backup {} no longer exists", backup_id),
                    });
                }
                let outcome = self.engine.backups().restore_column(conn, *backup_id, table, column)?;
                Ok(restore_note(*backup_id, &outcome))
            }
        }
    }
}

fn restore_note(backup_id: i64, outcome: &RestoreOutcome) -> String {
    format!(
        "-- restored {} row(s) of {}.{} from backup {}",
        outcome.rows_affected, outcome.table_name, outcome.restored_column, backup_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{ChangeRecord, FieldDef};
    use crate::db::test_support::{create_orders_table, test_database};
    use crate::engine::{EngineSettings, ExecContext};
    use crate::identifiers::PrefixTableMapper;
    use crate::queue::QueueSettings;
    use pretty_assertions::assert_eq;
    use rusqlite::types::Value;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Database,
        engine: Arc<MigrationEngine>,
        queue: MigrationQueue,
        coordinator: RollbackCoordinator,
    }

    fn fixture() -> Fixture {
        let (dir, db) = test_database();
        let engine = Arc::new(MigrationEngine::new(EngineSettings::default()));
        let queue = MigrationQueue::new(
            db.clone(),
            Arc::clone(&engine),
            Arc::new(PrefixTableMapper::new("")),
            QueueSettings::default(),
        );
        let coordinator = RollbackCoordinator::new(db.clone(), Arc::clone(&engine), queue.clone());

        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);
        conn.execute_batch(
            "INSERT INTO orders (status, amount) VALUES ('new', '10'), ('paid', '20'), ('void', '30')",
        )
        .unwrap();

        Fixture {
            _dir: dir,
            db,
            engine,
            queue,
            coordinator,
        }
    }

    /// Run `change` the way a queue worker would and return its history id.
    fn migrate(fx: &Fixture, change: &ChangeRecord) -> i64 {
        let conn = fx.db.get_connection().unwrap();
        let entry = NewHistoryEntry::for_change(change, "orders", sql::planned("orders", change), "tester");
        let history_id = MigrationHistory::create_pending(&conn, &entry).unwrap();
        MigrationHistory::mark_running(&conn, history_id).unwrap();
        let ctx = ExecContext {
            form_id: Some("orders"),
            history_id: Some(history_id),
        };
        fx.engine.execute(&conn, ctx, "orders", change).unwrap();
        history_id
    }

    fn column_values(fx: &Fixture, column: &str) -> Vec<Value> {
        let conn = fx.db.get_connection().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT \"{}\" FROM orders ORDER BY id", column))
            .unwrap();
        let values = stmt
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<Vec<Value>, _>>()
            .unwrap();
        values
    }

    fn has_column(fx: &Fixture, column: &str) -> bool {
        let conn = fx.db.get_connection().unwrap();
        let has = SqliteInspector::new(&conn).has_column("orders", column).unwrap();
        has
    }

    #[test]
    fn test_add_field_rollback_round_trip() {
        let fx = fixture();
        let change = ChangeRecord::add_field("orders", &FieldDef::new("f_note", "note", ColumnType::Text));
        let history_id = migrate(&fx, &change);
        assert!(has_column(&fx, "note"));

        let first = fx.coordinator.rollback(history_id, "tester").unwrap();
        assert!(!first.already_rolled_back);
        assert_eq!(first.entry.migration_type, MigrationType::Rollback);
        assert_eq!(first.entry.status, HistoryStatus::Succeeded);
        assert_eq!(first.entry.rollback_of, Some(history_id));
        assert!(!has_column(&fx, "note"));

        let second = fx.coordinator.rollback(history_id, "tester").unwrap();
        assert!(second.already_rolled_back);
        assert_eq!(second.entry.id, first.entry.id);

        let conn = fx.db.get_connection().unwrap();
        let original = MigrationHistory::get(&conn, history_id).unwrap().unwrap();
        assert_eq!(original.status, HistoryStatus::Succeeded);
        assert!(original.rollback_sql.is_some());
    }

    #[test]
    fn test_rename_rollback_restores_old_name() {
        let fx = fixture();
        let field = FieldDef::new("f_status", "status", ColumnType::Text);
        let history_id = migrate(&fx, &ChangeRecord::rename_field("orders", &field, "order_status"));

        fx.coordinator.rollback(history_id, "tester").unwrap();
        assert!(has_column(&fx, "status"));
        assert!(!has_column(&fx, "order_status"));
        assert_eq!(column_values(&fx, "status")[1], Value::Text("paid".into()));
    }

    #[test]
    fn test_delete_rollback_restores_values() {
        let fx = fixture();
        let field = FieldDef::new("f_amount", "amount", ColumnType::Text);
        let before = column_values(&fx, "amount");
        let history_id = migrate(&fx, &ChangeRecord::delete_field("orders", &field));
        assert!(!has_column(&fx, "amount"));

        let outcome = fx.coordinator.rollback(history_id, "tester").unwrap();
        assert!(outcome.entry.backup_id.is_some());
        assert_eq!(column_values(&fx, "amount"), before);
    }

    #[test]
    fn test_risky_type_change_rollback_uses_backup() {
        let fx = fixture();
        let change = ChangeRecord::change_type("orders", "f_amount", "amount", ColumnType::Text, ColumnType::Integer);
        let history_id = migrate(&fx, &change);
        assert_eq!(column_values(&fx, "amount")[0], Value::Integer(10));

        fx.coordinator.rollback(history_id, "tester").unwrap();

        let conn = fx.db.get_connection().unwrap();
        let info = SqliteInspector::new(&conn)
            .column_info("orders", "amount")
            .unwrap()
            .unwrap();
        assert_eq!(info.column_type, Some(ColumnType::Text));
        assert_eq!(column_values(&fx, "amount")[0], Value::Text("10".into()));
    }

    #[test]
    fn test_safe_type_change_rollback_revalidates_values() {
        let fx = fixture();
        {
            let conn = fx.db.get_connection().unwrap();
            conn.execute_batch(
                "ALTER TABLE orders ADD COLUMN qty INTEGER;
                 UPDATE orders SET qty = id;",
            )
            .unwrap();
        }
        let change = ChangeRecord::change_type("orders", "f_qty", "qty", ColumnType::Integer, ColumnType::Decimal);
        let history_id = migrate(&fx, &change);

        {
            let conn = fx.db.get_connection().unwrap();
            conn.execute("UPDATE orders SET qty = 2.5 WHERE id = 2", []).unwrap();
        }
        let err = fx.coordinator.rollback(history_id, "tester").unwrap_err();
        assert_eq!(err.offending_rows(), Some(&[2_i64][..]));

        let conn = fx.db.get_connection().unwrap();
        let (entries, _) = MigrationHistory::list_for_form(&conn, "orders", 10, 0).unwrap();
        let failed = entries
            .iter()
            .find(|e| e.migration_type == MigrationType::Rollback)
            .unwrap();
        assert_eq!(failed.status, HistoryStatus::Failed);

        conn.execute("UPDATE orders SET qty = 2 WHERE id = 2", []).unwrap();
        fx.coordinator.rollback(history_id, "tester").unwrap();
        assert_eq!(
            column_values(&fx, "qty"),
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
        );
    }

    #[test]
    fn test_drifted_type_change_rolls_back_to_the_live_source_type() {
        let fx = fixture();
        {
            let conn = fx.db.get_connection().unwrap();
            conn.execute_batch(
                "ALTER TABLE orders ADD COLUMN qty INTEGER;
                 UPDATE orders SET qty = id;",
            )
            .unwrap();
        }
        // The record believes qty is decimal; the live column is integer
        let change = ChangeRecord::change_type("orders", "f_qty", "qty", ColumnType::Decimal, ColumnType::Text);
        let history_id = migrate(&fx, &change);

        let conn = fx.db.get_connection().unwrap();
        let entry = MigrationHistory::get(&conn, history_id).unwrap().unwrap();
        assert_eq!(entry.old_data_type, Some(ColumnType::Integer));

        conn.execute("UPDATE orders SET qty = '2.5' WHERE id = 2", []).unwrap();
        let err = fx.coordinator.rollback(history_id, "tester").unwrap_err();
        assert_eq!(err.offending_rows(), Some(&[2_i64][..]));
        assert_eq!(
            column_values(&fx, "qty"),
            vec![Value::Text("1".into()), Value::Text("2.5".into()), Value::Text("3".into())]
        );

        conn.execute("UPDATE orders SET qty = '2' WHERE id = 2", []).unwrap();
        fx.coordinator.rollback(history_id, "tester").unwrap();
        assert_eq!(
            column_values(&fx, "qty"),
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
        );
    }

    #[test]
    fn test_safe_rollback_refuses_a_column_retyped_since() {
        let fx = fixture();
        {
            let conn = fx.db.get_connection().unwrap();
            conn.execute_batch(
                "ALTER TABLE orders ADD COLUMN qty INTEGER;
                 UPDATE orders SET qty = id;",
            )
            .unwrap();
        }
        let to_decimal = ChangeRecord::change_type("orders", "f_qty", "qty", ColumnType::Integer, ColumnType::Decimal);
        let history_id = migrate(&fx, &to_decimal);
        let to_text = ChangeRecord::change_type("orders", "f_qty", "qty", ColumnType::Decimal, ColumnType::Text);
        migrate(&fx, &to_text);

        assert!(matches!(
            fx.coordinator.rollback(history_id, "tester"),
            Err(FormShiftError::NotRollbackable { .. })
        ));
    }

    #[test]
    fn test_ineligible_entries_are_rejected() {
        let fx = fixture();
        let conn = fx.db.get_connection().unwrap();
        let pending = MigrationHistory::create_pending(
            &conn,
            &crate::history::test_support::new_entry("orders", MigrationType::AddField, "x"),
        )
        .unwrap();
        assert!(matches!(
            fx.coordinator.rollback(pending, "tester"),
            Err(FormShiftError::NotRollbackable { .. })
        ));

        let unbacked = MigrationHistory::create_pending(
            &conn,
            &crate::history::test_support::new_entry("orders", MigrationType::DeleteField, "amount"),
        )
        .unwrap();
        MigrationHistory::mark_running(&conn, unbacked).unwrap();
        let ctx = ExecContext {
            form_id: Some("orders"),
            history_id: Some(unbacked),
        };
        let dropped = fx.engine.drop_column(&conn, ctx, "orders", "amount", false).unwrap();
        assert!(dropped.backup_id.is_none());
        let err = fx.coordinator.rollback(unbacked, "tester").unwrap_err();
        assert!(matches!(err, FormShiftError::NotRollbackable { .. }));

        let add = ChangeRecord::add_field("orders", &FieldDef::new("f_note", "note", ColumnType::Text));
        let history_id = migrate(&fx, &add);
        let rollback = fx.coordinator.rollback(history_id, "tester").unwrap();
        assert!(matches!(
            fx.coordinator.rollback(rollback.entry.id, "tester"),
            Err(FormShiftError::NotRollbackable { .. })
        ));
        assert!(matches!(
            fx.coordinator.rollback(9999, "tester"),
            Err(FormShiftError::NotFound(_))
        ));
    }

    #[test]
    fn test_rollback_waits_for_queued_jobs() {
        let fx = fixture();
        let add = ChangeRecord::add_field("orders", &FieldDef::new("f_note", "note", ColumnType::Text));
        let history_id = migrate(&fx, &add);

        fx.queue
            .enqueue("orders", &ChangeRecord::add_field("orders", &FieldDef::new("f_x", "x", ColumnType::Text)), "tester")
            .unwrap();
        assert!(matches!(
            fx.coordinator.rollback(history_id, "tester"),
            Err(FormShiftError::FormBusy(_))
        ));
        assert!(has_column(&fx, "note"));
    }

    #[test]
    fn test_restore_backup_is_audited() {
        let fx = fixture();
        let field = FieldDef::new("f_amount", "amount", ColumnType::Text);
        let history_id = migrate(&fx, &ChangeRecord::delete_field("orders", &field));

        let conn = fx.db.get_connection().unwrap();
        let backup_id = MigrationHistory::get(&conn, history_id)
            .unwrap()
            .unwrap()
            .backup_id
            .unwrap();

        let result = fx.coordinator.restore_backup(backup_id, "tester").unwrap();
        assert_eq!(result.outcome.rows_affected, 3);
        assert!(result.outcome.column_created);
        assert_eq!(result.entry.migration_type, MigrationType::RestoreBackup);
        assert_eq!(result.entry.field_id, "f_amount");
        assert_eq!(result.entry.status, HistoryStatus::Succeeded);
        assert_eq!(result.entry.backup_id, Some(backup_id));
        assert_eq!(column_values(&fx, "amount")[2], Value::Text("30".into()));

        assert!(matches!(
            fx.coordinator.restore_backup(9999, "tester"),
            Err(FormShiftError::NotFound(_))
        ));
    }
}
