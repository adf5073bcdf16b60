use crate::error::FormShiftError;

/// Prefix reserved for the scratch column used while changing a column's type.
pub const TEMP_COLUMN_PREFIX: &str = "__fs_retype_";

const MAX_IDENTIFIER_LEN: usize = 63;

/// Maps a form to the table holding its submissions.
///
/// The naming scheme belongs to the form builder; this is the narrow boundary
/// through which the migration subsystem consumes it.
pub trait TableMapper: Send + Sync {
    fn table_for_form(&self, form_id: &str) -> String;
}

/// Default mapping: `<prefix><form_id>`.
#[derive(Debug, Clone)]
pub struct PrefixTableMapper {
    prefix: String,
}

impl PrefixTableMapper {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl TableMapper for PrefixTableMapper {
    fn table_for_form(&self, form_id: &str) -> String {
        format!("{}{}", self.prefix, form_id)
    }
}

/// Validate a table or column name before it is spliced into DDL.
///
/// Names are quoted anyway; this keeps them boring enough that the recorded SQL
/// is readable and replayable.
pub fn validate_identifier(name: &str) -> Result<(), FormShiftError> {
    let mut chars = name.chars();

    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !first_ok || !rest_ok || name.len() > MAX_IDENTIFIER_LEN {
        return Err(FormShiftError::InvalidInput(format!(
            "'{}' is not a valid identifier",
            name
        )));
    }

    if name.starts_with(TEMP_COLUMN_PREFIX) {
        return Err(FormShiftError::InvalidInput(format!(
            "'{}' uses the reserved prefix '{}'",
            name, TEMP_COLUMN_PREFIX
        )));
    }

    Ok(())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn temp_column_name(column: &str) -> String {
    format!("{}{}", TEMP_COLUMN_PREFIX, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_mapper() {
        let mapper = PrefixTableMapper::new("form_");
        assert_eq!(mapper.table_for_form("contact"), "form_contact");
        let bare = PrefixTableMapper::new("");
        assert_eq!(bare.table_for_form("orders"), "orders");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("order_status").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("bad name").is_err());
        assert!(validate_identifier("x\"; DROP TABLE t; --").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert!(validate_identifier("__fs_retype_amount").is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("status"), "\"status\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
