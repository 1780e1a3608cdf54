//! Per-field last-writer-wins merge across divergent versions

use serde_json::{Map, Value};

use crate::types::ConflictVersion;

/// Merges conflicting versions field by field
///
/// Versions are ordered by timestamp (device id breaks ties) and folded
/// oldest to newest, so every top-level field takes the value of the most
/// recent version that carries it. Fields are never dropped just because a
/// newer version lacks them. A side that deleted the entity contributes no
/// fields; the merge is a delete only when every side deleted.
#[derive(Debug, Clone, Default)]
pub struct FieldMerge;

impl FieldMerge {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(&self, versions: &[ConflictVersion]) -> Option<Value> {
        let mut ordered: Vec<&ConflictVersion> = versions.iter().collect();
        ordered.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });

        let mut fields: Option<Map<String, Value>> = None;
        let mut newest_scalar: Option<&Value> = None;

        for version in ordered {
            match &version.data {
                Some(Value::Object(object)) => {
                    let merged = fields.get_or_insert_with(Map::new);
                    for (field, value) in object {
                        merged.insert(field.clone(), value.clone());
                    }
                }
                Some(other) => newest_scalar = Some(other),
                None => {}
            }
        }

        match (fields, newest_scalar) {
            (Some(object), _) => Some(Value::Object(object)),
            (None, Some(value)) => Some(value.clone()),
            (None, None) => None,
        }
    }
}
