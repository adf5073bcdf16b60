use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Logical type of a form field, and therefore of its backing column.
///
/// Serialized lowercase on the wire and in the history table. The SQLite declared
/// type is derived from it, and `from_declared` maps a declared type read back from
/// `pragma_table_info` to the logical type.
#[derive(
    AsRefStr,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Copy,
    Clone,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "REAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    /// Map a SQLite declared column type back to a logical type.
    ///
    /// Common aliases produced by other tools (VARCHAR, INT, DATETIME...) are
    /// accepted. Returns None for anything we can't classify.
    pub fn from_declared(declared: &str) -> Option<Self> {
        let upper = declared.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();

        match base {
            "TEXT" | "VARCHAR" | "CHAR" | "CLOB" | "STRING" => Some(ColumnType::Text),
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" => Some(ColumnType::Integer),
            "REAL" | "DECIMAL" | "NUMERIC" | "DOUBLE" | "FLOAT" => Some(ColumnType::Decimal),
            "BOOLEAN" | "BOOL" => Some(ColumnType::Boolean),
            "DATE" => Some(ColumnType::Date),
            "TIMESTAMP" | "DATETIME" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_sql_type_round_trips_through_declared() {
        for ty in ColumnType::iter() {
            assert_eq!(ColumnType::from_declared(ty.sql_type()), Some(ty));
        }
    }

    #[test]
    fn test_from_declared_aliases() {
        assert_eq!(
            ColumnType::from_declared("varchar(255)"),
            Some(ColumnType::Text)
        );
        assert_eq!(
            ColumnType::from_declared("DATETIME"),
            Some(ColumnType::Timestamp)
        );
        assert_eq!(ColumnType::from_declared("int"), Some(ColumnType::Integer));
        assert_eq!(ColumnType::from_declared(""), None);
        assert_eq!(ColumnType::from_declared("GEOMETRY"), None);
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(ColumnType::Decimal.to_string(), "decimal");
        assert_eq!("Timestamp".parse::<ColumnType>().unwrap(), ColumnType::Timestamp);
        assert!("money".parse::<ColumnType>().is_err());
        assert_eq!(
            serde_json::to_string(&ColumnType::Boolean).unwrap(),
            "\"boolean\""
        );
    }
}
