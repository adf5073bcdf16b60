use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::column_type::ColumnType;
use crate::error::FormShiftError;
use crate::identifiers::quote_ident;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    /// None when the declared type isn't one of ours
    pub column_type: Option<ColumnType>,
}

/// Read-only view of the live schema and data of form-backed tables.
///
/// The migration engine never trusts a change record about what exists: every
/// check goes through this interface. Rows are addressed by SQLite rowid.
pub trait SchemaInspector {
    fn has_table(&self, table: &str) -> Result<bool, FormShiftError>;

    /// Columns of `table` in declaration order. Empty if the table doesn't exist.
    fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, FormShiftError>;

    fn row_count(&self, table: &str) -> Result<u64, FormShiftError>;

    /// Up to `limit` `(row_id, value)` pairs with `row_id > after_row_id`, ascending.
    fn column_values(
        &self,
        table: &str,
        column: &str,
        after_row_id: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Value)>, FormShiftError>;

    fn column_info(&self, table: &str, column: &str) -> Result<Option<ColumnInfo>, FormShiftError> {
        Ok(self
            .table_columns(table)?
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(column)))
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool, FormShiftError> {
        Ok(self.column_info(table, column)?.is_some())
    }

    /// Walk every value of a column in batches of `batch_size`.
    fn for_each_value(
        &self,
        table: &str,
        column: &str,
        batch_size: usize,
        f: &mut dyn FnMut(i64, &Value) -> Result<(), FormShiftError>,
    ) -> Result<(), FormShiftError> {
        let mut after = i64::MIN;
        loop {
            let batch = self.column_values(table, column, after, batch_size)?;
            let Some(&(last, _)) = batch.last() else {
                return Ok(());
            };
            for (row_id, value) in &batch {
                f(*row_id, value)?;
            }
            if batch.len() < batch_size {
                return Ok(());
            }
            after = last;
        }
    }
}

/// `SchemaInspector` over a SQLite connection.
///
/// Borrowing the connection means reads made inside an open transaction see that
/// transaction's uncommitted schema.
pub struct SqliteInspector<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteInspector<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl SchemaInspector for SqliteInspector<'_> {
    fn has_table(&self, table: &str) -> Result<bool, FormShiftError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
                [table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, FormShiftError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")?;

        let columns = stmt
            .query_map([table], |row| {
                let name: String = row.get(0)?;
                let declared_type: String = row.get(1)?;
                Ok(ColumnInfo {
                    column_type: ColumnType::from_declared(&declared_type),
                    name,
                    declared_type,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(columns)
    }

    fn row_count(&self, table: &str) -> Result<u64, FormShiftError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn column_values(
        &self,
        table: &str,
        column: &str,
        after_row_id: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Value)>, FormShiftError> {
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE rowid > ? ORDER BY rowid LIMIT ?",
            quote_ident(column),
            quote_ident(table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params![after_row_id, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Value>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;

    /// In-memory inspector for exercising the engine's planning logic without SQLite.
    #[derive(Default)]
    pub struct FakeInspector {
        tables: HashMap<String, Vec<(ColumnInfo, Vec<Value>)>>,
    }

    impl FakeInspector {
        pub fn with_column(mut self, table: &str, column: &str, ty: ColumnType, values: Vec<Value>) -> Self {
            self.tables.entry(table.to_string()).or_default().push((
                ColumnInfo {
                    name: column.to_string(),
                    declared_type: ty.sql_type().to_string(),
                    column_type: Some(ty),
                },
                values,
            ));
            self
        }
    }

    impl SchemaInspector for FakeInspector {
        fn has_table(&self, table: &str) -> Result<bool, FormShiftError> {
            Ok(self.tables.contains_key(table))
        }

        fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, FormShiftError> {
            Ok(self
                .tables
                .get(table)
                .map(|cols| cols.iter().map(|(info, _)| info.clone()).collect())
                .unwrap_or_default())
        }

        fn row_count(&self, table: &str) -> Result<u64, FormShiftError> {
            Ok(self
                .tables
                .get(table)
                .and_then(|cols| cols.first())
                .map(|(_, values)| values.len() as u64)
                .unwrap_or(0))
        }

        fn column_values(
            &self,
            table: &str,
            column: &str,
            after_row_id: i64,
            limit: usize,
        ) -> Result<Vec<(i64, Value)>, FormShiftError> {
            let values = self
                .tables
                .get(table)
                .and_then(|cols| cols.iter().find(|(info, _)| info.name == column))
                .map(|(_, values)| values.clone())
                .unwrap_or_default();

            Ok(values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i as i64 + 1, v))
                .filter(|(id, _)| *id > after_row_id)
                .take(limit)
                .collect())
        }
    }
}
