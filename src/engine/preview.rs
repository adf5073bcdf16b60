use rusqlite::types::Value;
use serde::Serialize;

use super::{find_unconvertible, plan_type_change, sql, EngineSettings};
use crate::changes::{ChangeKind, ChangeRecord};
use crate::conversion::Compatibility;
use crate::error::FormShiftError;
use crate::identifiers::validate_identifier;
use crate::inspector::{ColumnInfo, SchemaInspector};

/// Offending row ids listed in a preview warning before the list is truncated.
const MAX_LISTED_ROWS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPreview {
    pub change: ChangeRecord,
    pub forward_sql: String,
    pub rollback_sql: Option<String>,
    pub warnings: Vec<String>,
    pub requires_backup: bool,
    pub affected_rows: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSummary {
    pub total_changes: usize,
    pub requiring_backup: usize,
    pub warning_count: usize,
    pub affected_rows: u64,
}

impl PreviewSummary {
    pub fn from_previews(previews: &[MigrationPreview]) -> Self {
        previews.iter().fold(
            PreviewSummary {
                total_changes: previews.len(),
                ..Default::default()
            },
            |mut summary, p| {
                if p.requires_backup {
                    summary.requiring_backup += 1;
                }
                summary.warning_count += p.warnings.len();
                summary.affected_rows += p.affected_rows;
                summary
            },
        )
    }
}

pub(crate) fn preview_change(
    settings: &EngineSettings,
    inspector: &dyn SchemaInspector,
    table: &str,
    change: &ChangeRecord,
) -> Result<MigrationPreview, FormShiftError> {
    change.validate()?;
    validate_identifier(table)?;
    if !inspector.has_table(table)? {
        return Err(FormShiftError::NotFound(format!("Table '{}'", table)));
    }

    let column = change.column_name.as_str();
    let mut warnings = Vec::new();

    let (forward_sql, rollback_sql, requires_backup, affected_rows) = match change.kind {
        ChangeKind::AddField => {
            if let Some(existing) = inspector.column_info(table, column)? {
                if existing.column_type != Some(change.data_type) {
                    return Err(FormShiftError::DuplicateColumn {
                        table: table.to_string(),
                        column: column.to_string(),
                    });
                }
                warnings.push(format!(
                    "Column '{}' already exists as {}; nothing will change",
                    existing.name, change.data_type
                ));
            }
            (
                sql::add_column(table, column, change.data_type),
                Some(sql::drop_column(table, column)),
                false,
                0,
            )
        }

        ChangeKind::DeleteField => {
            let info = require_column(inspector, table, column)?;
            let mut with_data = 0u64;
            inspector.for_each_value(table, &info.name, settings.backup_batch_size, &mut |_, value| {
                if !matches!(value, Value::Null) {
                    with_data += 1;
                }
                Ok(())
            })?;
            if with_data > 0 {
                warnings.push(format!(
                    "{} row(s) will lose data in column '{}'; a backup is taken before the drop",
                    with_data, info.name
                ));
            }
            (
                sql::drop_column(table, &info.name),
                None,
                true,
                inspector.row_count(table)?,
            )
        }

        ChangeKind::RenameField => {
            let new_name = change.new_column_name.as_deref().unwrap_or_default();
            let old_col = inspector.column_info(table, column)?;
            let new_col = if column.eq_ignore_ascii_case(new_name) {
                None
            } else {
                inspector.column_info(table, new_name)?
            };

            match (old_col, new_col) {
                (Some(_), Some(_)) => {
                    return Err(FormShiftError::DuplicateColumn {
                        table: table.to_string(),
                        column: new_name.to_string(),
                    })
                }
                (None, None) => {
                    return Err(FormShiftError::ColumnNotFound {
                        table: table.to_string(),
                        column: column.to_string(),
                    })
                }
                (None, Some(_)) => warnings.push(format!(
                    "Column '{}' is already named '{}'; nothing will change",
                    column, new_name
                )),
                (Some(_), None) => {}
            }
            (
                sql::rename_column(table, column, new_name),
                Some(sql::rename_column(table, new_name, column)),
                false,
                0,
            )
        }

        ChangeKind::ChangeType => {
            let plan = plan_type_change(inspector, table, column, change.old_data_type, change.data_type)?;
            let forward_sql = sql::script(&sql::retype_column(table, &plan.column, plan.from, plan.to));

            if plan.already_applied {
                warnings.push(format!(
                    "Column '{}' is already {}; nothing will change",
                    plan.column, plan.to
                ));
                (forward_sql, None, false, 0)
            } else {
                if plan.drift {
                    warnings.push(format!(
                        "Column '{}' is {} in the database; the conversion starts from {}",
                        plan.column, plan.from, plan.from
                    ));
                }
                if plan.class == Compatibility::Incompatible {
                    warnings.push(format!(
                        "{} values cannot be represented as {}; only empty values convert",
                        plan.from, plan.to
                    ));
                }
                if plan.class.needs_validation() {
                    let bad = find_unconvertible(
                        inspector,
                        table,
                        &plan.column,
                        plan.from,
                        plan.to,
                        settings.backup_batch_size,
                        MAX_LISTED_ROWS,
                    )?;
                    if bad.total > 0 {
                        warnings.push(format!(
                            "{} row(s) hold values that cannot be converted to {} (rows {}); the migration will fail until they are fixed",
                            bad.total,
                            plan.to,
                            describe_rows(&bad.row_ids, bad.total)
                        ));
                    }
                }

                let rollback_sql = (plan.class == Compatibility::Safe)
                    .then(|| sql::script(&sql::retype_column(table, &plan.column, plan.to, plan.from)));
                (
                    forward_sql,
                    rollback_sql,
                    plan.class.needs_validation() || settings.backup_safe_conversions,
                    inspector.row_count(table)?,
                )
            }
        }
    };

    Ok(MigrationPreview {
        change: change.clone(),
        forward_sql,
        rollback_sql,
        warnings,
        requires_backup,
        affected_rows,
    })
}

pub(crate) fn preview_batch(
    settings: &EngineSettings,
    inspector: &dyn SchemaInspector,
    table: &str,
    changes: &[ChangeRecord],
) -> Result<Vec<MigrationPreview>, FormShiftError> {
    let mut projected = ProjectedSchema::new(inspector, table)?;
    let mut previews = Vec::with_capacity(changes.len());

    for change in changes {
        previews.push(preview_change(settings, &projected, table, change)?);
        projected.apply(change);
    }

    Ok(previews)
}

fn require_column(
    inspector: &dyn SchemaInspector,
    table: &str,
    column: &str,
) -> Result<ColumnInfo, FormShiftError> {
    inspector
        .column_info(table, column)?
        .ok_or_else(|| FormShiftError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        })
}

fn describe_rows(row_ids: &[i64], total: u64) -> String {
    let listed = row_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let remaining = total.saturating_sub(row_ids.len() as u64);
    if remaining > 0 {
        format!("{} and {} more", listed, remaining)
    } else {
        listed
    }
}

struct ProjectedColumn {
    info: ColumnInfo,
    /// Column in the live table the values come from; None for columns added
    /// earlier in the batch
    source: Option<String>,
}

/// The schema of one table as it will look after the changes applied so far,
/// layered over the live inspector. Values are read through from the live table.
struct ProjectedSchema<'a> {
    base: &'a dyn SchemaInspector,
    table: String,
    columns: Vec<ProjectedColumn>,
    anchor: Option<String>,
}

impl<'a> ProjectedSchema<'a> {
    fn new(base: &'a dyn SchemaInspector, table: &str) -> Result<Self, FormShiftError> {
        let columns: Vec<ProjectedColumn> = base
            .table_columns(table)?
            .into_iter()
            .map(|info| ProjectedColumn {
                source: Some(info.name.clone()),
                info,
            })
            .collect();
        let anchor = columns.first().map(|c| c.info.name.clone());

        Ok(Self {
            base,
            table: table.to_string(),
            columns,
            anchor,
        })
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.info.name.eq_ignore_ascii_case(column))
    }

    fn apply(&mut self, change: &ChangeRecord) {
        let pos = self.position(&change.column_name);

        match change.kind {
            ChangeKind::AddField => {
                if pos.is_none() {
                    self.columns.push(ProjectedColumn {
                        info: ColumnInfo {
                            name: change.column_name.clone(),
                            declared_type: change.data_type.sql_type().to_string(),
                            column_type: Some(change.data_type),
                        },
                        source: None,
                    });
                }
            }
            ChangeKind::DeleteField => {
                if let Some(i) = pos {
                    self.columns.remove(i);
                }
            }
            ChangeKind::RenameField => {
                if let (Some(i), Some(new_name)) = (pos, &change.new_column_name) {
                    self.columns[i].info.name = new_name.clone();
                }
            }
            ChangeKind::ChangeType => {
                if let Some(i) = pos {
                    let info = &mut self.columns[i].info;
                    info.declared_type = change.data_type.sql_type().to_string();
                    info.column_type = Some(change.data_type);
                }
            }
        }
    }

    fn is_projected(&self, table: &str) -> bool {
        self.table.eq_ignore_ascii_case(table)
    }
}

impl SchemaInspector for ProjectedSchema<'_> {
    fn has_table(&self, table: &str) -> Result<bool, FormShiftError> {
        self.base.has_table(table)
    }

    fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, FormShiftError> {
        if !self.is_projected(table) {
            return self.base.table_columns(table);
        }
        Ok(self.columns.iter().map(|c| c.info.clone()).collect())
    }

    fn row_count(&self, table: &str) -> Result<u64, FormShiftError> {
        self.base.row_count(table)
    }

    fn column_values(
        &self,
        table: &str,
        column: &str,
        after_row_id: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Value)>, FormShiftError> {
        if !self.is_projected(table) {
            return self.base.column_values(table, column, after_row_id, limit);
        }

        let Some(projected) = self.position(column).map(|i| &self.columns[i]) else {
            return Ok(Vec::new());
        };

        match (&projected.source, &self.anchor) {
            (Some(source), _) => self.base.column_values(table, source, after_row_id, limit),
            // Added earlier in the batch: every existing row holds NULL
            (None, Some(anchor)) => Ok(self
                .base
                .column_values(table, anchor, after_row_id, limit)?
                .into_iter()
                .map(|(row_id, _)| (row_id, Value::Null))
                .collect()),
            (None, None) => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::FieldDef;
    use crate::column_type::ColumnType;
    use crate::db::test_support::{create_orders_table, test_database};
    use crate::engine::MigrationEngine;
    use crate::inspector::fake::FakeInspector;
    use crate::inspector::SqliteInspector;
    use pretty_assertions::assert_eq;

    fn text(values: &[&str]) -> Vec<Value> {
        values.iter().map(|v| Value::Text(v.to_string())).collect()
    }

    fn orders() -> FakeInspector {
        FakeInspector::default()
            .with_column("orders", "id", ColumnType::Integer, vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])
            .with_column("orders", "status", ColumnType::Text, text(&["new", "paid", "new"]))
            .with_column(
                "orders",
                "amount",
                ColumnType::Text,
                vec![Value::Text("100".into()), Value::Null, Value::Text("abc".into())],
            )
    }

    fn engine() -> MigrationEngine {
        MigrationEngine::new(EngineSettings::default())
    }

    #[test]
    fn test_preview_add_field() {
        let change = ChangeRecord::add_field("orders", &FieldDef::new("f", "note", ColumnType::Text));
        let preview = engine().preview(&orders(), "orders", &change).unwrap();

        assert_eq!(preview.forward_sql, "ALTER TABLE \"orders\" ADD COLUMN \"note\" TEXT");
        assert_eq!(
            preview.rollback_sql.as_deref(),
            Some("ALTER TABLE \"orders\" DROP COLUMN \"note\"")
        );
        assert!(preview.warnings.is_empty());
        assert!(!preview.requires_backup);
    }

    #[test]
    fn test_preview_add_existing_column_with_other_type() {
        let change = ChangeRecord::add_field("orders", &FieldDef::new("f", "status", ColumnType::Integer));
        let result = engine().preview(&orders(), "orders", &change);
        assert!(matches!(result, Err(FormShiftError::DuplicateColumn { .. })));
    }

    #[test]
    fn test_preview_delete_warns_about_data_loss() {
        let change = ChangeRecord::delete_field("orders", &FieldDef::new("f", "amount", ColumnType::Text));
        let preview = engine().preview(&orders(), "orders", &change).unwrap();

        assert!(preview.requires_backup);
        assert_eq!(preview.rollback_sql, None);
        assert_eq!(preview.affected_rows, 3);
        assert_eq!(preview.warnings.len(), 1);
        assert!(preview.warnings[0].starts_with("2 row(s) will lose data"));
    }

    #[test]
    fn test_preview_risky_conversion_lists_rows() {
        let change =
            ChangeRecord::change_type("orders", "f", "amount", ColumnType::Text, ColumnType::Integer);
        let preview = engine().preview(&orders(), "orders", &change).unwrap();

        assert!(preview.requires_backup);
        assert_eq!(preview.rollback_sql, None);
        assert_eq!(preview.warnings.len(), 1);
        assert!(preview.warnings[0].contains("(rows 3)"));
    }

    #[test]
    fn test_preview_batch_plans_against_projected_schema() {
        let old = FieldDef::new("f", "status", ColumnType::Text);
        let changes = vec![
            ChangeRecord::rename_field("orders", &old, "order_status"),
            ChangeRecord::change_type("orders", "f", "order_status", ColumnType::Text, ColumnType::Boolean),
            ChangeRecord::add_field("orders", &FieldDef::new("g", "note", ColumnType::Text)),
            ChangeRecord::change_type("orders", "g", "note", ColumnType::Text, ColumnType::Integer),
        ];

        let previews = engine().preview_batch(&orders(), "orders", &changes).unwrap();
        assert_eq!(previews.len(), 4);
        assert!(previews[1].forward_sql.contains("\"order_status\""));
        // "new" and "paid" are not booleans
        assert!(previews[1].warnings[0].contains("(rows 1, 2, 3)"));
        // A freshly added column only holds NULLs
        assert!(previews[3].warnings.is_empty());

        let summary = PreviewSummary::from_previews(&previews);
        assert_eq!(summary.total_changes, 4);
        assert_eq!(summary.requiring_backup, 2);
        assert_eq!(summary.warning_count, 1);
    }

    #[test]
    fn test_single_preview_does_not_see_earlier_changes() {
        let change =
            ChangeRecord::change_type("orders", "f", "order_status", ColumnType::Text, ColumnType::Integer);
        let result = engine().preview(&orders(), "orders", &change);
        assert!(matches!(result, Err(FormShiftError::ColumnNotFound { .. })));
    }

    #[test]
    fn test_preview_touches_no_persisted_state() {
        let (_dir, db) = test_database();
        let conn = db.get_connection().unwrap();
        create_orders_table(&conn);
        conn.execute("INSERT INTO orders (status, amount) VALUES ('new', '5')", [])
            .unwrap();

        let change = ChangeRecord::delete_field("orders", &FieldDef::new("f", "amount", ColumnType::Text));
        let preview = engine()
            .preview(&SqliteInspector::new(&conn), "orders", &change)
            .unwrap();
        assert!(preview.requires_backup);

        let backups: i64 = conn
            .query_row("SELECT count(*) FROM data_backups", [], |r| r.get(0))
            .unwrap();
        assert_eq!(backups, 0);
        assert!(SqliteInspector::new(&conn).has_column("orders", "amount").unwrap());
    }

    #[test]
    fn test_describe_rows_truncates() {
        assert_eq!(describe_rows(&[1, 2], 2), "1, 2");
        assert_eq!(describe_rows(&[1, 2], 5), "1, 2 and 3 more");
    }
}
