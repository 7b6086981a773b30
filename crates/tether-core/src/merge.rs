//! # Field Merge
//!
//! Whole-field last-writer-wins merge applied when an incoming record matches
//! a stored one by primary key.
//!
//! ```text
//!   existing  { name: "A", age: 5 }
//!   candidate { name: "B", age: 99 }     properties = ["name"]
//!   ─────────────────────────────────
//!   existing  { name: "B", age: 5 }      returns ["name"]
//! ```
//!
//! Fields absent from the candidate are left alone. With a property filter,
//! fields outside the filter are neither read from the candidate nor written.

use crate::record::Record;

/// Copies candidate fields onto `existing` and returns the names that changed.
///
/// `existing` keeps its identity (`row_id`, entity, key field). Changed fields
/// are marked dirty on `existing`.
pub fn merge_fields(
    existing: &mut Record,
    candidate: &Record,
    properties: Option<&[String]>,
) -> Vec<String> {
    let mut changed = Vec::new();

    let selected: Vec<&String> = match properties {
        Some(props) => props
            .iter()
            .filter(|name| candidate.fields().contains_key(name.as_str()))
            .collect(),
        None => candidate.fields().keys().collect(),
    };

    for name in selected {
        let Some(incoming) = candidate.get(name) else {
            continue;
        };
        if existing.get(name) == Some(incoming) {
            continue;
        }
        existing.set(name.clone(), incoming.clone());
        changed.push(name.clone());
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn stored(value: Value) -> Record {
        Record::from_stored("Person", "objID", 1, value.as_object().cloned().unwrap())
    }

    fn incoming(value: Value) -> Record {
        Record::new("Person", "objID").with_fields(value.as_object().cloned().unwrap())
    }

    #[test]
    fn test_property_filter_limits_merge() {
        let mut existing = stored(json!({ "objID": 1, "name": "A", "age": 5 }));
        let candidate = incoming(json!({ "objID": 1, "name": "B", "age": 99 }));

        let changed = merge_fields(&mut existing, &candidate, Some(&["name".to_string()]));

        assert_eq!(changed, vec!["name".to_string()]);
        assert_eq!(existing.get("name"), Some(&json!("B")));
        assert_eq!(existing.get("age"), Some(&json!(5)));
        assert_eq!(existing.row_id(), Some(1));
    }

    #[test]
    fn test_full_merge_keeps_absent_fields() {
        let mut existing = stored(json!({ "objID": 1, "name": "A", "nick": "a" }));
        let candidate = incoming(json!({ "objID": 1, "name": "B", "age": 7 }));

        let mut changed = merge_fields(&mut existing, &candidate, None);
        changed.sort();

        assert_eq!(changed, vec!["age".to_string(), "name".to_string()]);
        assert_eq!(existing.get("nick"), Some(&json!("a")));
        assert_eq!(existing.get("age"), Some(&json!(7)));
    }

    #[test]
    fn test_identical_values_report_nothing() {
        let mut existing = stored(json!({ "objID": 1, "name": "A" }));
        let candidate = incoming(json!({ "objID": 1, "name": "A" }));

        assert!(merge_fields(&mut existing, &candidate, None).is_empty());
        assert!(!existing.is_dirty());
    }

    #[test]
    fn test_filter_names_missing_from_candidate_are_ignored() {
        let mut existing = stored(json!({ "objID": 1, "name": "A" }));
        let candidate = incoming(json!({ "objID": 1 }));

        let changed = merge_fields(&mut existing, &candidate, Some(&["name".to_string()]));

        assert!(changed.is_empty());
        assert_eq!(existing.get("name"), Some(&json!("A")));
    }
}
