pub mod preview;
pub mod sql;

use log::{info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;

use crate::backups::{BackupStore, DEFAULT_BATCH_SIZE, DEFAULT_RETENTION_DAYS};
use crate::changes::{ChangeKind, ChangeRecord};
use crate::column_type::ColumnType;
use crate::conversion::{classify, is_convertible, Compatibility};
use crate::db::Database;
use crate::error::FormShiftError;
use crate::history::MigrationHistory;
use crate::identifiers::{quote_ident, temp_column_name, validate_identifier};
use crate::inspector::{SchemaInspector, SqliteInspector};

pub use preview::{MigrationPreview, PreviewSummary};

/// Upper bound on the row ids carried by an `UnsafeConversion` error.
pub const MAX_REPORTED_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backup_batch_size: usize,
    pub backup_retention_days: i64,
    /// Also snapshot columns before safe type changes
    pub backup_safe_conversions: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backup_batch_size: DEFAULT_BATCH_SIZE,
            backup_retention_days: DEFAULT_RETENTION_DAYS,
            backup_safe_conversions: false,
        }
    }
}

/// Who a migration runs for. With a `history_id`, the entry is moved to
/// SUCCEEDED inside the migration's own transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecContext<'a> {
    pub form_id: Option<&'a str>,
    pub history_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub forward_sql: String,
    pub rollback_sql: Option<String>,
    pub backup_id: Option<i64>,
    /// The live schema already matched the target; nothing was executed
    pub already_applied: bool,
    pub rows_affected: u64,
}

impl AppliedMigration {
    fn already_applied(forward_sql: String) -> Self {
        Self {
            forward_sql,
            rollback_sql: None,
            backup_id: None,
            already_applied: true,
            rows_affected: 0,
        }
    }
}

/// A type change resolved against the live column.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TypeChangePlan {
    /// Live spelling of the column name
    pub column: String,
    pub from: ColumnType,
    pub to: ColumnType,
    pub class: Compatibility,
    pub already_applied: bool,
    /// The live type differs from the one the change record expected
    pub drift: bool,
}

pub(crate) fn plan_type_change(
    inspector: &dyn SchemaInspector,
    table: &str,
    column: &str,
    expected_from: Option<ColumnType>,
    to: ColumnType,
) -> Result<TypeChangePlan, FormShiftError> {
    let info = inspector
        .column_info(table, column)?
        .ok_or_else(|| FormShiftError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        })?;

    let from = info.column_type.or(expected_from).ok_or_else(|| {
        FormShiftError::InvalidInput(format!(
            "Cannot determine the current type of {}.{} (declared '{}')",
            table, column, info.declared_type
        ))
    })?;

    Ok(TypeChangePlan {
        column: info.name,
        from,
        to,
        class: classify(from, to),
        already_applied: from == to,
        drift: expected_from.is_some_and(|expected| expected != from),
    })
}

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Unconvertible {
    /// First `limit` offending row ids, ascending
    pub row_ids: Vec<i64>,
    pub total: u64,
}

pub(crate) fn find_unconvertible(
    inspector: &dyn SchemaInspector,
    table: &str,
    column: &str,
    from: ColumnType,
    to: ColumnType,
    batch_size: usize,
    limit: usize,
) -> Result<Unconvertible, FormShiftError> {
    let mut found = Unconvertible::default();
    inspector.for_each_value(table, column, batch_size, &mut |row_id, value| {
        if !is_convertible(value, from, to) {
            found.total += 1;
            if found.row_ids.len() < limit {
                found.row_ids.push(row_id);
            }
        }
        Ok(())
    })?;
    Ok(found)
}

/// Runs a type change's statements on `conn`, checking SQLite's own result
/// before the original column is dropped. Any non-null value the conversion
/// turned into NULL fails the change with the offending row ids; the caller's
/// transaction rolls the scratch column back. Returns the executed script.
pub(crate) fn run_retype(
    conn: &Connection,
    table: &str,
    column: &str,
    from: ColumnType,
    to: ColumnType,
) -> Result<String, FormShiftError> {
    let statements = sql::retype_column(table, column, from, to);
    let (convert, swap) = statements.split_at(2);

    conn.execute_batch(&sql::script(convert))?;

    let lost = lost_values(conn, table, column, MAX_REPORTED_ROWS)?;
    if lost.total > 0 {
        warn!(
            "{} value(s) of {}.{} did not survive {} -> {}",
            lost.total, table, column, from, to
        );
        return Err(FormShiftError::UnsafeConversion {
            table: table.to_string(),
            column: column.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            row_ids: lost.row_ids,
        });
    }

    conn.execute_batch(&sql::script(swap))?;
    Ok(sql::script(&statements))
}

fn lost_values(conn: &Connection, table: &str, column: &str, limit: usize) -> Result<Unconvertible, FormShiftError> {
    let query = format!(
        "SELECT rowid FROM {} WHERE {} IS NOT NULL AND {} IS NULL ORDER BY rowid",
        quote_ident(table),
        quote_ident(column),
        quote_ident(&temp_column_name(column))
    );

    let mut found = Unconvertible::default();
    let mut stmt = conn.prepare(&query)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        found.total += 1;
        if found.row_ids.len() < limit {
            found.row_ids.push(row.get(0)?);
        }
    }
    Ok(found)
}

/// Applies change records to form-backed tables.
///
/// Every public method opens exactly one transaction scope on the connection it
/// is given and leaves it closed on return. Preconditions are checked against the
/// live schema inside that scope, never against the change record alone.
/// Failure bookkeeping on history entries belongs to the caller.
pub struct MigrationEngine {
    settings: EngineSettings,
    backups: BackupStore,
}

impl MigrationEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            backups: BackupStore::new(settings.backup_batch_size, settings.backup_retention_days),
            settings,
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Apply one change record to `table`.
    pub fn execute(
        &self,
        conn: &Connection,
        ctx: ExecContext<'_>,
        table: &str,
        change: &ChangeRecord,
    ) -> Result<AppliedMigration, FormShiftError> {
        change.validate()?;

        match change.kind {
            ChangeKind::AddField => self.add_column(conn, ctx, table, &change.column_name, change.data_type),
            ChangeKind::DeleteField => self.drop_column(conn, ctx, table, &change.column_name, true),
            ChangeKind::RenameField => {
                let new_name = change.new_column_name.as_deref().ok_or_else(|| {
                    FormShiftError::InvalidInput("RENAME_FIELD requires newColumnName".into())
                })?;
                self.rename_column(conn, ctx, table, &change.column_name, new_name)
            }
            ChangeKind::ChangeType => self.migrate_column_type(
                conn,
                ctx,
                table,
                &change.column_name,
                change.old_data_type,
                change.data_type,
            ),
        }
    }

    pub fn add_column(
        &self,
        conn: &Connection,
        ctx: ExecContext<'_>,
        table: &str,
        column: &str,
        ty: ColumnType,
    ) -> Result<AppliedMigration, FormShiftError> {
        let _tmr = timer!(Level::Debug; "MigrationEngine::add_column", "{}.{}", table, column);
        validate_identifier(column)?;
        let forward_sql = sql::add_column(table, column, ty);

        self.in_scope(conn, ctx, table, |c, inspector| {
            if let Some(existing) = inspector.column_info(table, column)? {
                if existing.column_type == Some(ty) {
                    info!("{}.{} already exists as {}; nothing to do", table, column, ty);
                    return Ok(AppliedMigration::already_applied(forward_sql));
                }
                return Err(FormShiftError::DuplicateColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }

            c.execute_batch(&forward_sql)?;
            info!("Added column {}.{} ({})", table, column, ty);

            Ok(AppliedMigration {
                forward_sql,
                rollback_sql: Some(sql::drop_column(table, column)),
                backup_id: None,
                already_applied: false,
                rows_affected: 0,
            })
        })
    }

    /// Drop `column`, snapshotting it first when `with_backup` is set. A backup
    /// failure prevents the drop.
    pub fn drop_column(
        &self,
        conn: &Connection,
        ctx: ExecContext<'_>,
        table: &str,
        column: &str,
        with_backup: bool,
    ) -> Result<AppliedMigration, FormShiftError> {
        let _tmr = timer!(Level::Debug; "MigrationEngine::drop_column", "{}.{}", table, column);

        self.in_scope(conn, ctx, table, |c, inspector| {
            let info = inspector.column_info(table, column)?.ok_or_else(|| {
                FormShiftError::ColumnNotFound {
                    table: table.to_string(),
                    column: column.to_string(),
                }
            })?;

            let backup = if with_backup {
                Some(self.backups.backup_column(c, ctx.form_id, table, &info.name)?)
            } else {
                None
            };
            let rows_affected = match &backup {
                Some(b) => b.row_count.max(0) as u64,
                None => inspector.row_count(table)?,
            };

            let forward_sql = sql::drop_column(table, &info.name);
            c.execute_batch(&forward_sql)?;
            info!("Dropped column {}.{}", table, info.name);

            Ok(AppliedMigration {
                forward_sql,
                rollback_sql: None,
                backup_id: backup.map(|b| b.id),
                already_applied: false,
                rows_affected,
            })
        })
    }

    pub fn rename_column(
        &self,
        conn: &Connection,
        ctx: ExecContext<'_>,
        table: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<AppliedMigration, FormShiftError> {
        let _tmr = timer!(Level::Debug; "MigrationEngine::rename_column", "{}.{} -> {}", table, old_name, new_name);
        validate_identifier(new_name)?;

        self.in_scope(conn, ctx, table, |c, inspector| {
            let old_col = inspector.column_info(table, old_name)?;
            let new_col = if old_name.eq_ignore_ascii_case(new_name) {
                None
            } else {
                inspector.column_info(table, new_name)?
            };

            match (old_col, new_col) {
                (Some(_), Some(_)) => Err(FormShiftError::DuplicateColumn {
                    table: table.to_string(),
                    column: new_name.to_string(),
                }),
                (None, Some(_)) => {
                    info!("{}.{} already renamed to {}; nothing to do", table, old_name, new_name);
                    Ok(AppliedMigration::already_applied(sql::rename_column(
                        table, old_name, new_name,
                    )))
                }
                (None, None) => Err(FormShiftError::ColumnNotFound {
                    table: table.to_string(),
                    column: old_name.to_string(),
                }),
                (Some(old), None) => {
                    let forward_sql = sql::rename_column(table, &old.name, new_name);
                    c.execute_batch(&forward_sql)?;
                    info!("Renamed column {}.{} to {}", table, old.name, new_name);

                    Ok(AppliedMigration {
                        forward_sql,
                        rollback_sql: Some(sql::rename_column(table, new_name, &old.name)),
                        backup_id: None,
                        already_applied: false,
                        rows_affected: 0,
                    })
                }
            }
        })
    }

    /// Change the type of `column`.
    ///
    /// Conversions that can lose data are validated value by value first; any
    /// unconvertible value aborts the whole change with the offending row ids. They
    /// always take a backup. The live type is authoritative: if it differs from
    /// `old_type` the conversion is planned from the live type.
    pub fn migrate_column_type(
        &self,
        conn: &Connection,
        ctx: ExecContext<'_>,
        table: &str,
        column: &str,
        old_type: Option<ColumnType>,
        new_type: ColumnType,
    ) -> Result<AppliedMigration, FormShiftError> {
        let _tmr = timer!(Level::Debug; "MigrationEngine::migrate_column_type", "{}.{} -> {}", table, column, new_type);

        self.in_scope(conn, ctx, table, |c, inspector| {
            let plan = plan_type_change(inspector, table, column, old_type, new_type)?;
            let forward_sql = sql::script(&sql::retype_column(table, &plan.column, plan.from, plan.to));

            if plan.already_applied {
                info!("{}.{} is already {}; nothing to do", table, plan.column, new_type);
                return Ok(AppliedMigration::already_applied(forward_sql));
            }
            if plan.drift {
                warn!(
                    "{}.{} is {} in the live schema, not {:?} as recorded; converting from {}",
                    table, plan.column, plan.from, old_type, plan.from
                );
            }

            if plan.class.needs_validation() {
                let bad = find_unconvertible(
                    inspector,
                    table,
                    &plan.column,
                    plan.from,
                    plan.to,
                    self.settings.backup_batch_size,
                    MAX_REPORTED_ROWS,
                )?;
                if bad.total > 0 {
                    return Err(FormShiftError::UnsafeConversion {
                        table: table.to_string(),
                        column: plan.column.clone(),
                        from: plan.from.to_string(),
                        to: plan.to.to_string(),
                        row_ids: bad.row_ids,
                    });
                }
            }

            let backup = if plan.class.needs_validation() || self.settings.backup_safe_conversions {
                Some(self.backups.backup_column(c, ctx.form_id, table, &plan.column)?)
            } else {
                None
            };

            let rows_affected = inspector.row_count(table)?;
            run_retype(c, table, &plan.column, plan.from, plan.to)?;
            if let Some(history_id) = ctx.history_id {
                MigrationHistory::record_converted_from(c, history_id, plan.from)?;
            }
            info!(
                "Converted {}.{} from {} to {} ({} row(s))",
                table, plan.column, plan.from, plan.to, rows_affected
            );

            let rollback_sql = (plan.class == Compatibility::Safe)
                .then(|| sql::script(&sql::retype_column(table, &plan.column, plan.to, plan.from)));

            Ok(AppliedMigration {
                forward_sql,
                rollback_sql,
                backup_id: backup.map(|b| b.id),
                already_applied: false,
                rows_affected,
            })
        })
    }

    /// Dry run of one change against `inspector`. Touches no persisted state.
    pub fn preview(
        &self,
        inspector: &dyn SchemaInspector,
        table: &str,
        change: &ChangeRecord,
    ) -> Result<MigrationPreview, FormShiftError> {
        preview::preview_change(&self.settings, inspector, table, change)
    }

    /// Dry run of an ordered batch; each change is planned against the schema
    /// the earlier changes would leave behind.
    pub fn preview_batch(
        &self,
        inspector: &dyn SchemaInspector,
        table: &str,
        changes: &[ChangeRecord],
    ) -> Result<Vec<MigrationPreview>, FormShiftError> {
        preview::preview_batch(&self.settings, inspector, table, changes)
    }

    fn in_scope<F>(
        &self,
        conn: &Connection,
        ctx: ExecContext<'_>,
        table: &str,
        f: F,
    ) -> Result<AppliedMigration, FormShiftError>
    where
        F: FnOnce(&Connection, &SqliteInspector) -> Result<AppliedMigration, FormShiftError>,
    {
        validate_identifier(table)?;

        Database::immediate_transaction(conn, |c| {
            let inspector = SqliteInspector::new(c);
            if !inspector.has_table(table)? {
                return Err(FormShiftError::NotFound(format!("Table '{}'", table)));
            }

            let applied = f(c, &inspector)?;

            if let Some(history_id) = ctx.history_id {
                MigrationHistory::mark_succeeded(
                    c,
                    history_id,
                    &applied.forward_sql,
                    applied.rollback_sql.as_deref(),
                    applied.backup_id,
                )?;
            }
            Ok(applied)
        })
    }
}
