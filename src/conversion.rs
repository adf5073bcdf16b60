use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rusqlite::types::Value;
use serde::Serialize;

use crate::column_type::ColumnType;

/// How a column type change treats existing data.
///
/// The matrix in `classify` is total: every (from, to) pair has exactly one class.
///
/// - `Identity`: nothing to do
/// - `Safe`: every value of the source type has a representation in the target
/// - `Risky`: some values convert, some don't; each value is validated before commit
/// - `Incompatible`: no non-null value converts; only empty columns can be retyped
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compatibility {
    Identity,
    Safe,
    Risky,
    Incompatible,
}

impl Compatibility {
    /// Whether existing values must be validated (and backed up) before converting.
    pub fn needs_validation(&self) -> bool {
        matches!(self, Compatibility::Risky | Compatibility::Incompatible)
    }
}

pub fn classify(from: ColumnType, to: ColumnType) -> Compatibility {
    use ColumnType::*;
    use Compatibility::*;

    match (from, to) {
        (a, b) if a == b => Identity,

        // Everything has a textual form
        (_, Text) => Safe,

        (Text, _) => Risky,

        (Integer, Decimal) => Safe,
        (Integer, Boolean) => Risky,
        (Integer, Date | Timestamp) => Incompatible,

        (Decimal, Integer) => Risky,
        (Decimal, Boolean | Date | Timestamp) => Incompatible,

        (Boolean, Integer | Decimal) => Safe,
        (Boolean, Date | Timestamp) => Incompatible,

        (Date, Timestamp) => Safe,
        (Date, Integer | Decimal | Boolean) => Incompatible,

        (Timestamp, Date) => Risky,
        (Timestamp, Integer | Decimal | Boolean) => Incompatible,

        // Only reachable for identical pairs, handled by the guard above
        (_, _) => Identity,
    }
}

/// SQL expression converting `column` (already quoted) from one type to another.
///
/// Every value `is_convertible` accepts comes out non-NULL. The engine still
/// checks SQLite's result before committing a conversion.
pub fn conversion_expr(column: &str, from: ColumnType, to: ColumnType) -> String {
    use ColumnType::*;

    if classify(from, to) == Compatibility::Incompatible {
        return "NULL".to_string();
    }

    match (from, to) {
        (a, b) if a == b => column.to_string(),
        (_, Text) => format!("CAST({} AS TEXT)", column),
        (Text, Integer) => format!("CAST(trim({}) AS INTEGER)", column),
        (Text, Decimal) => format!("CAST(trim({}) AS REAL)", column),
        (Text, Boolean) => format!(
            "CASE lower(trim({c})) WHEN 'true' THEN 1 WHEN '1' THEN 1 WHEN 'yes' THEN 1 \
             WHEN 'false' THEN 0 WHEN '0' THEN 0 WHEN 'no' THEN 0 ELSE NULL END",
            c = column
        ),
        (Text, Date) | (Timestamp, Date) => format!("date(trim({}))", column),
        (Text, Timestamp) | (Date, Timestamp) => format!("datetime(trim({}))", column),
        (_, Integer) | (_, Boolean) => format!("CAST({} AS INTEGER)", column),
        (_, Decimal) => format!("CAST({} AS REAL)", column),
        _ => "NULL".to_string(),
    }
}

/// Returns true if `value`, currently held in a column of type `from`, can be
/// converted to `to` without losing its meaning. NULL always converts.
///
/// Only the shapes SQLite's own conversion accepts pass: fixed-width ISO dates,
/// and text padded with spaces alone (SQLite's `trim` strips nothing else).
pub fn is_convertible(value: &Value, from: ColumnType, to: ColumnType) -> bool {
    use ColumnType::*;

    if matches!(value, Value::Null) {
        return true;
    }

    match classify(from, to) {
        Compatibility::Identity | Compatibility::Safe => return true,
        Compatibility::Incompatible => return false,
        Compatibility::Risky => {}
    }

    // Numeric sources convert with a bare CAST, which reads a stray string's
    // numeric prefix instead of rejecting it
    if matches!(from, Integer | Decimal) && matches!(value, Value::Text(_) | Value::Blob(_)) {
        return false;
    }

    match to {
        Integer => as_integer(value).is_some(),
        Decimal => as_decimal(value).is_some(),
        Boolean => as_boolean(value).is_some(),
        Date => as_text(value).is_some_and(|s| parse_date(&s).is_some()),
        Timestamp => as_text(value).is_some_and(|s| parse_timestamp(&s).is_some()),
        Text => true,
    }
}

fn sql_trim(s: &str) -> &str {
    s.trim_matches(' ')
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(sql_trim(s).to_string()),
        Value::Null | Value::Integer(_) | Value::Real(_) | Value::Blob(_) => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Real(f) if f.is_finite() && f.fract() == 0.0 => {
            if *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                Some(*f as i64)
            } else {
                None
            }
        }
        Value::Text(s) => sql_trim(s).parse::<i64>().ok(),
        _ => None,
    }
}

fn as_decimal(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Real(f) if f.is_finite() => Some(*f),
        Value::Text(s) => {
            let s = sql_trim(s);
            // Rust also reads "inf" and "NaN", which SQLite casts to 0.0
            let numeric = s.bytes().any(|b| b.is_ascii_digit())
                && s.bytes().all(|b| b.is_ascii_digit() || b"+-.eE".contains(&b));
            if !numeric {
                return None;
            }
            s.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        _ => None,
    }
}

fn as_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Integer(0) => Some(false),
        Value::Integer(1) => Some(true),
        Value::Text(s) => match sql_trim(s).to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `9` matches one ASCII digit, anything else matches itself.
fn has_shape(s: &str, shape: &str) -> bool {
    s.len() == shape.len()
        && s.bytes().zip(shape.bytes()).all(|(c, p)| match p {
            b'9' => c.is_ascii_digit(),
            _ => c == p,
        })
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if has_shape(s, "9999-99-99") {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();
    }
    parse_datetime(s).map(|dt| dt.date())
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if has_shape(s, "9999-99-99") {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0));
    }
    parse_datetime(s)
}

/// `YYYY-MM-DD HH:MM[:SS[.fff]]`, with `T` allowed as the separator.
fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let (base, fraction) = match s.split_once('.') {
        Some((base, fraction)) => (base, Some(fraction)),
        None => (s, None),
    };

    if let Some(fraction) = fraction {
        if fraction.is_empty() || fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }

    let normalized = match base.as_bytes().get(10) {
        Some(b'T') => base.replacen('T', " ", 1),
        Some(b' ') => base.to_string(),
        _ => return None,
    };

    if has_shape(&normalized, "9999-99-99 99:99:99") {
        let parsed = match fraction {
            Some(fraction) => {
                NaiveDateTime::parse_from_str(&format!("{}.{}", normalized, fraction), "%Y-%m-%d %H:%M:%S%.f")
            }
            None => NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S"),
        };
        // chrono reads :60 as a leap second; SQLite rejects it
        parsed.ok().filter(|dt| dt.nanosecond() < 1_000_000_000)
    } else if fraction.is_none() && has_shape(&normalized, "9999-99-99 99:99") {
        NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M").ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use strum::IntoEnumIterator;

    #[test]
    fn test_matrix_is_total_and_diagonal_is_identity() {
        for from in ColumnType::iter() {
            for to in ColumnType::iter() {
                let class = classify(from, to);
                assert_eq!(class == Compatibility::Identity, from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_known_classifications() {
        assert_eq!(classify(ColumnType::Integer, ColumnType::Text), Compatibility::Safe);
        assert_eq!(classify(ColumnType::Date, ColumnType::Text), Compatibility::Safe);
        assert_eq!(classify(ColumnType::Text, ColumnType::Integer), Compatibility::Risky);
        assert_eq!(classify(ColumnType::Text, ColumnType::Date), Compatibility::Risky);
        assert_eq!(
            classify(ColumnType::Integer, ColumnType::Date),
            Compatibility::Incompatible
        );
        assert!(Compatibility::Incompatible.needs_validation());
        assert!(!Compatibility::Safe.needs_validation());
    }

    #[test]
    fn test_text_to_integer_validation() {
        let from = ColumnType::Text;
        let to = ColumnType::Integer;
        assert!(is_convertible(&Value::Text("100".into()), from, to));
        assert!(is_convertible(&Value::Text(" 42 ".into()), from, to));
        assert!(is_convertible(&Value::Null, from, to));
        assert!(!is_convertible(&Value::Text("abc".into()), from, to));
        assert!(!is_convertible(&Value::Text("12.5".into()), from, to));
    }

    #[test]
    fn test_date_and_timestamp_validation() {
        assert!(is_convertible(
            &Value::Text("2025-01-15".into()),
            ColumnType::Text,
            ColumnType::Date
        ));
        assert!(!is_convertible(
            &Value::Text("2025-02-30".into()),
            ColumnType::Text,
            ColumnType::Date
        ));
        assert!(is_convertible(
            &Value::Text("2025-01-15T10:30:00".into()),
            ColumnType::Text,
            ColumnType::Timestamp
        ));
        assert!(is_convertible(
            &Value::Text("2025-01-15 10:30:00".into()),
            ColumnType::Timestamp,
            ColumnType::Date
        ));
        assert!(!is_convertible(
            &Value::Text("yesterday".into()),
            ColumnType::Text,
            ColumnType::Timestamp
        ));
    }

    #[test]
    fn test_incompatible_rejects_every_non_null_value() {
        assert!(!is_convertible(
            &Value::Integer(5),
            ColumnType::Integer,
            ColumnType::Date
        ));
        assert!(is_convertible(&Value::Null, ColumnType::Integer, ColumnType::Date));
        assert_eq!(
            conversion_expr("\"c\"", ColumnType::Integer, ColumnType::Date),
            "NULL"
        );
    }

    #[test]
    fn test_sql_expressions_agree_with_validators() {
        let conn = Connection::open_in_memory().unwrap();
        let eval = |expr: String, v: &str| -> Value {
            conn.query_row(&format!("SELECT {}", expr.replace("\"c\"", "?1")), [v], |r| {
                r.get::<_, Value>(0)
            })
            .unwrap()
        };

        assert_eq!(
            eval(conversion_expr("\"c\"", ColumnType::Text, ColumnType::Integer), " 42 "),
            Value::Integer(42)
        );
        assert_eq!(
            eval(conversion_expr("\"c\"", ColumnType::Text, ColumnType::Boolean), "Yes"),
            Value::Integer(1)
        );
        assert_eq!(
            eval(conversion_expr("\"c\"", ColumnType::Text, ColumnType::Date), "2025-01-15T10:30:00"),
            Value::Text("2025-01-15".into())
        );
        assert_eq!(
            eval(
                conversion_expr("\"c\"", ColumnType::Text, ColumnType::Timestamp),
                "2025-01-15"
            ),
            Value::Text("2025-01-15 00:00:00".into())
        );
    }

    #[test]
    fn test_validators_follow_sqlite_formats() {
        let text = |s: &str| Value::Text(s.into());
        let (t, date, ts, boolean) = (ColumnType::Text, ColumnType::Date, ColumnType::Timestamp, ColumnType::Boolean);

        assert!(!is_convertible(&text("2025-1-5"), t, date));
        assert!(!is_convertible(&text("2025-01-15 1:05:00"), t, ts));
        assert!(!is_convertible(&text("2025-1-15T10:30:00"), t, ts));
        assert!(!is_convertible(&text("2025-01-15 10:30:60"), t, ts));
        assert!(is_convertible(&text("2025-01-15 10:30:00.250"), t, ts));
        assert!(is_convertible(&text("2025-01-15 10:30"), t, ts));

        assert!(!is_convertible(&text("yes\n"), t, boolean));
        assert!(!is_convertible(&text("true\t"), t, boolean));
        assert!(is_convertible(&text("  yes "), t, boolean));
        assert!(!is_convertible(&text("\t42"), t, ColumnType::Integer));
        assert!(!is_convertible(&text("inf"), t, ColumnType::Decimal));
        assert!(is_convertible(&text("1.5e3"), t, ColumnType::Decimal));

        // Integer columns convert with a bare CAST
        assert!(!is_convertible(&text("yes"), ColumnType::Integer, boolean));
        assert!(is_convertible(&Value::Integer(1), ColumnType::Integer, boolean));
        assert!(!is_convertible(&Value::Integer(2), ColumnType::Integer, boolean));
        assert!(!is_convertible(&text("12abc"), ColumnType::Decimal, ColumnType::Integer));
    }

    #[test]
    fn test_accepted_text_never_converts_to_null() {
        let conn = Connection::open_in_memory().unwrap();
        let samples = [
            "42", " 42 ", "\n42", "-7", "+5", "12abc", "2.5", ".5", "1e3", "inf", "NaN", "abc", "",
            "true", "Yes", " no ", "yes\n", "true\t", "0", "1",
            "2025-01-15", "2025-1-5", "2025-01-15 10:30", "2025-01-15 10:30:00", "2025-01-15T10:30:00.5",
            "2025-01-15 1:05:00", "2025-1-15T10:30:00", "2025-01-15 10:30:00.", "2025-01-15T10:30:00Z",
        ];

        for to in ColumnType::iter().filter(|to| *to != ColumnType::Text) {
            let expr = conversion_expr("?1", ColumnType::Text, to);
            for sample in samples {
                let converted: Value = conn
                    .query_row(&format!("SELECT {}", expr), [sample], |r| r.get(0))
                    .unwrap();
                if is_convertible(&Value::Text(sample.into()), ColumnType::Text, to) {
                    assert_ne!(converted, Value::Null, "{:?} -> {}", sample, to);
                }
            }
        }
    }
}
