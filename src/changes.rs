use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::column_type::ColumnType;
use crate::error::FormShiftError;
use crate::identifiers::validate_identifier;

/// A logical field as the form builder sees it.
///
/// `column_name` has already been produced by the identifier mapper; `field_id` is
/// stable across edits and is what the change detector keys on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub field_id: String,
    pub column_name: String,
    pub data_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FieldDef {
    pub fn new(field_id: &str, column_name: &str, data_type: ColumnType) -> Self {
        Self {
            field_id: field_id.to_string(),
            column_name: column_name.to_string(),
            data_type,
            label: None,
        }
    }
}

#[derive(
    AsRefStr, Display, EnumString, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone,
)]
pub enum ChangeKind {
    #[strum(serialize = "ADD_FIELD")]
    #[serde(rename = "ADD_FIELD")]
    AddField,
    #[strum(serialize = "DELETE_FIELD")]
    #[serde(rename = "DELETE_FIELD")]
    DeleteField,
    #[strum(serialize = "CHANGE_TYPE")]
    #[serde(rename = "CHANGE_TYPE")]
    ChangeType,
    #[strum(serialize = "RENAME_FIELD")]
    #[serde(rename = "RENAME_FIELD")]
    RenameField,
}

/// One schema change for one field.
///
/// - `AddField`: `column_name` is created with `data_type`
/// - `DeleteField`: `column_name` is dropped; `data_type` is what it held
/// - `RenameField`: `column_name` becomes `new_column_name`
/// - `ChangeType`: `column_name` goes from `old_data_type` to `data_type`
///
/// A field renamed and retyped in the same edit produces two records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub form_id: String,
    pub field_id: String,
    pub column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_column_name: Option<String>,
    pub data_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data_type: Option<ColumnType>,
}

impl ChangeRecord {
    pub fn add_field(form_id: &str, field: &FieldDef) -> Self {
        Self {
            kind: ChangeKind::AddField,
            form_id: form_id.to_string(),
            field_id: field.field_id.clone(),
            column_name: field.column_name.clone(),
            new_column_name: None,
            data_type: field.data_type,
            old_data_type: None,
        }
    }

    pub fn delete_field(form_id: &str, field: &FieldDef) -> Self {
        Self {
            kind: ChangeKind::DeleteField,
            ..Self::add_field(form_id, field)
        }
    }

    pub fn rename_field(form_id: &str, old: &FieldDef, new_column_name: &str) -> Self {
        Self {
            kind: ChangeKind::RenameField,
            new_column_name: Some(new_column_name.to_string()),
            ..Self::add_field(form_id, old)
        }
    }

    pub fn change_type(
        form_id: &str,
        field_id: &str,
        column_name: &str,
        old_type: ColumnType,
        new_type: ColumnType,
    ) -> Self {
        Self {
            kind: ChangeKind::ChangeType,
            form_id: form_id.to_string(),
            field_id: field_id.to_string(),
            column_name: column_name.to_string(),
            new_column_name: None,
            data_type: new_type,
            old_data_type: Some(old_type),
        }
    }

    /// Check that the record carries exactly what its kind needs.
    ///
    /// Records built by the detector always pass; this guards records that arrive
    /// over the API.
    pub fn validate(&self) -> Result<(), FormShiftError> {
        if self.form_id.trim().is_empty() || self.field_id.trim().is_empty() {
            return Err(FormShiftError::InvalidInput(
                "formId and fieldId are required".to_string(),
            ));
        }
        validate_identifier(&self.column_name)?;

        match self.kind {
            ChangeKind::RenameField => {
                let new_name = self.new_column_name.as_deref().ok_or_else(|| {
                    FormShiftError::InvalidInput("RENAME_FIELD requires newColumnName".into())
                })?;
                validate_identifier(new_name)?;
                if new_name == self.column_name {
                    return Err(FormShiftError::InvalidInput(
                        "RENAME_FIELD must change the column name".into(),
                    ));
                }
                if self.old_data_type.is_some() {
                    return Err(FormShiftError::InvalidInput(
                        "RENAME_FIELD cannot also change the type".into(),
                    ));
                }
            }
            ChangeKind::ChangeType => {
                if self.new_column_name.is_some() {
                    return Err(FormShiftError::InvalidInput(
                        "CHANGE_TYPE cannot also rename the column".into(),
                    ));
                }
                if self.old_data_type.is_none() {
                    return Err(FormShiftError::InvalidInput(
                        "CHANGE_TYPE requires oldDataType".into(),
                    ));
                }
            }
            ChangeKind::AddField | ChangeKind::DeleteField => {
                if self.new_column_name.is_some() || self.old_data_type.is_some() {
                    return Err(FormShiftError::InvalidInput(format!(
                        "{} takes neither newColumnName nor oldDataType",
                        self.kind
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn to_json(&self) -> Result<String, FormShiftError> {
        serde_json::to_string(self)
            .map_err(|e| FormShiftError::Error(format!("Failed to serialize ChangeRecord: {}", e)))
    }
}
