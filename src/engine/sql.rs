//! DDL builders for the four migration kinds.
//!
//! Every builder quotes its identifiers. Multi-statement plans are recorded in
//! history as one script, statements separated by `;\n`, and replayed with
//! `execute_batch`.

use crate::changes::{ChangeKind, ChangeRecord};
use crate::column_type::ColumnType;
use crate::conversion::conversion_expr;
use crate::identifiers::{quote_ident, temp_column_name};

pub fn add_column(table: &str, column: &str, ty: ColumnType) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(table),
        quote_ident(column),
        ty.sql_type()
    )
}

pub fn drop_column(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(table),
        quote_ident(column)
    )
}

pub fn rename_column(table: &str, from: &str, to: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        quote_ident(table),
        quote_ident(from),
        quote_ident(to)
    )
}

/// SQLite can't alter a column's type in place, so a type change copies the
/// converted values through a scratch column and swaps it in.
pub fn retype_column(table: &str, column: &str, from: ColumnType, to: ColumnType) -> Vec<String> {
    let temp = temp_column_name(column);
    let t = quote_ident(table);

    vec![
        format!("ALTER TABLE {} ADD COLUMN {} {}", t, quote_ident(&temp), to.sql_type()),
        format!(
            "UPDATE {} SET {} = {}",
            t,
            quote_ident(&temp),
            conversion_expr(&quote_ident(column), from, to)
        ),
        drop_column(table, column),
        rename_column(table, &temp, column),
    ]
}

pub fn script(statements: &[String]) -> String {
    statements.join(";\n")
}

/// SQL a change is expected to run, planned from the record alone. The engine
/// replaces it with what it actually executed.
pub fn planned(table: &str, change: &ChangeRecord) -> String {
    let column = change.column_name.as_str();
    match change.kind {
        ChangeKind::AddField => add_column(table, column, change.data_type),
        ChangeKind::DeleteField => drop_column(table, column),
        ChangeKind::RenameField => rename_column(
            table,
            column,
            change.new_column_name.as_deref().unwrap_or_default(),
        ),
        ChangeKind::ChangeType => script(&retype_column(
            table,
            column,
            change.old_data_type.unwrap_or(change.data_type),
            change.data_type,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_builders_quote_identifiers() {
        assert_eq!(
            add_column("orders", "note", ColumnType::Text),
            "ALTER TABLE \"orders\" ADD COLUMN \"note\" TEXT"
        );
        assert_eq!(
            rename_column("orders", "status", "order_status"),
            "ALTER TABLE \"orders\" RENAME COLUMN \"status\" TO \"order_status\""
        );
    }

    #[test]
    fn test_retype_script_runs_and_preserves_position_of_values() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, amount TEXT);
             INSERT INTO orders (amount) VALUES ('100'), (' 7 '), (NULL);",
        )
        .unwrap();

        let statements = retype_column("orders", "amount", ColumnType::Text, ColumnType::Integer);
        assert_eq!(statements.len(), 4);
        conn.execute_batch(&script(&statements)).unwrap();

        let declared: String = conn
            .query_row(
                "SELECT type FROM pragma_table_info('orders') WHERE name = 'amount'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(declared, "INTEGER");

        let values: Vec<Option<i64>> = conn
            .prepare("SELECT amount FROM orders ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, vec![Some(100), Some(7), None]);
    }
}
