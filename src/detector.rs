use std::collections::{HashMap, HashSet};

use crate::changes::{ChangeRecord, FieldDef};

/// Diffs two versions of a form's field list.
pub struct ChangeDetector;

impl ChangeDetector {
    /// Compute the ordered change records turning `old_fields` into `new_fields`.
    ///
    /// Fields are matched by `field_id`. Output order:
    /// 1. ADD_FIELD, in `new_fields` order
    /// 2. RENAME_FIELD, in `new_fields` order
    /// 3. CHANGE_TYPE, in `new_fields` order, naming the post-rename column
    /// 4. DELETE_FIELD, in `old_fields` order
    ///
    /// A repeated `field_id` within one list is ignored after its first occurrence.
    pub fn detect(form_id: &str, old_fields: &[FieldDef], new_fields: &[FieldDef]) -> Vec<ChangeRecord> {
        let old_by_id: HashMap<&str, &FieldDef> = {
            let mut map = HashMap::new();
            for field in old_fields {
                map.entry(field.field_id.as_str()).or_insert(field);
            }
            map
        };

        let mut adds = Vec::new();
        let mut renames = Vec::new();
        let mut retypes = Vec::new();
        let mut seen_new: HashSet<&str> = HashSet::new();

        for new in new_fields {
            if !seen_new.insert(new.field_id.as_str()) {
                continue;
            }

            match old_by_id.get(new.field_id.as_str()) {
                None => adds.push(ChangeRecord::add_field(form_id, new)),
                Some(old) => {
                    if old.column_name != new.column_name {
                        renames.push(ChangeRecord::rename_field(form_id, old, &new.column_name));
                    }
                    if old.data_type != new.data_type {
                        retypes.push(ChangeRecord::change_type(
                            form_id,
                            &new.field_id,
                            &new.column_name,
                            old.data_type,
                            new.data_type,
                        ));
                    }
                }
            }
        }

        let mut seen_old: HashSet<&str> = HashSet::new();
        let deletes = old_fields
            .iter()
            .filter(|old| seen_old.insert(old.field_id.as_str()))
            .filter(|old| !seen_new.contains(old.field_id.as_str()))
            .map(|old| ChangeRecord::delete_field(form_id, old));

        let mut changes = adds;
        changes.extend(renames);
        changes.extend(retypes);
        changes.extend(deletes);

        log::debug!(
            "Detected {} change(s) for form '{}'",
            changes.len(),
            form_id
        );

        changes
    }
}
