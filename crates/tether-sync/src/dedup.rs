//! # Dedup / Upsert Engine
//!
//! Decides whether an incoming record becomes a new row or merges into the
//! stored record that already holds its primary key.
//!
//! ## Decision Procedure
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  candidate                                                              │
//! │     │                                                                   │
//! │     ├── already stored (row_id)? ──► write back (optionally partial)    │
//! │     │                                                                   │
//! │     ├── no primary key ───────────► insert (keyless rows never merge)   │
//! │     │                                                                   │
//! │     └── primary_key_lookup(entity, key)                                 │
//! │            │                                                            │
//! │            ├── no match ──────────► insert                              │
//! │            │                                                            │
//! │            └── match                                                    │
//! │                 ├── Insert mode ──► DedupViolation                      │
//! │                 └── Merge mode ───► merge_fields → update existing row  │
//! │                                     (existing row id is kept)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here commits. The caller owns the [`StoreSession`] and commits once
//! per work item (or once per batch).

use tracing::debug;

use tether_core::{merge_fields, EntitySpec, Record};
use tether_db::sql::canonical_key;
use tether_db::{DbError, StoreSession};

use crate::error::{SyncError, SyncResult};

/// How a candidate with an already-stored primary key is handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpsertMode {
    /// Always-insert (`save`). A stored key fails with `DedupViolation`.
    #[default]
    Insert,
    /// Merge-if-exists (`save_or_update`), optionally limited to named fields.
    Merge { properties: Option<Vec<String>> },
}

impl UpsertMode {
    pub fn merge() -> Self {
        UpsertMode::Merge { properties: None }
    }

    pub fn merge_properties<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        UpsertMode::Merge {
            properties: Some(properties.into_iter().map(Into::into).collect()),
        }
    }

    pub fn properties(&self) -> Option<&[String]> {
        match self {
            UpsertMode::Merge {
                properties: Some(props),
            } => Some(props.as_slice()),
            _ => None,
        }
    }
}

/// Rejects records that belong to another entity or lack a required key.
pub fn check_record(spec: &EntitySpec, record: &Record) -> SyncResult<()> {
    spec.check(record)
        .map_err(|e| SyncError::Programmer(e.to_string()))
}

fn dedup_violation(record: &Record) -> SyncError {
    SyncError::DedupViolation {
        entity: record.entity().to_string(),
        key: record
            .primary_key()
            .and_then(canonical_key)
            .unwrap_or_else(|| "null".to_string()),
    }
}

fn map_unique(err: DbError, record: &Record) -> SyncError {
    if err.is_unique_violation() {
        dedup_violation(record)
    } else {
        SyncError::Store(err)
    }
}

async fn insert(session: &mut StoreSession, mut candidate: Record) -> SyncResult<Record> {
    session
        .insert(&mut candidate)
        .await
        .map_err(|e| map_unique(e, &candidate))?;
    Ok(candidate)
}

/// Inserts or merges one candidate. Returns the resulting stored record.
pub async fn upsert(
    session: &mut StoreSession,
    spec: &EntitySpec,
    mut candidate: Record,
    mode: &UpsertMode,
) -> SyncResult<Record> {
    check_record(spec, &candidate)?;

    if !candidate.is_new() {
        session
            .update(&candidate, mode.properties())
            .await
            .map_err(|e| map_unique(e, &candidate))?;
        candidate.mark_clean();
        return Ok(candidate);
    }

    let Some(key) = candidate.primary_key().cloned() else {
        debug!(entity = %spec.name, "Keyless record, inserting");
        return insert(session, candidate).await;
    };

    let existing = session
        .primary_key_lookup(&spec.name, &spec.primary_key, &key)
        .await?;

    match (existing, mode) {
        (None, _) => insert(session, candidate).await,

        (Some(_), UpsertMode::Insert) => Err(dedup_violation(&candidate)),

        (Some(mut existing), UpsertMode::Merge { properties }) => {
            let changed = merge_fields(&mut existing, &candidate, properties.as_deref());
            if !changed.is_empty() {
                session
                    .update(&existing, Some(changed.as_slice()))
                    .await
                    .map_err(|e| map_unique(e, &existing))?;
            }
            debug!(
                entity = %spec.name,
                row_id = ?existing.row_id(),
                changed = changed.len(),
                "Merged into existing record"
            );
            existing.mark_clean();
            Ok(existing)
        }
    }
}

/// Runs [`upsert`] for each candidate in order against one session.
///
/// The first failure stops the batch; the caller rolls the session back, so
/// the batch is atomic.
pub async fn upsert_batch(
    session: &mut StoreSession,
    spec: &EntitySpec,
    candidates: Vec<Record>,
    mode: &UpsertMode,
) -> SyncResult<Vec<Record>> {
    let mut stored = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        stored.push(upsert(session, spec, candidate, mode).await?);
    }
    Ok(stored)
}

/// Whether another stored record already holds this record's primary key.
pub async fn is_duplicate(session: &mut StoreSession, record: &Record) -> SyncResult<bool> {
    let Some(key) = record.primary_key() else {
        return Ok(false);
    };

    let existing = session
        .primary_key_lookup(record.entity(), record.primary_key_field(), key)
        .await?;

    Ok(existing.is_some_and(|stored| stored.row_id() != record.row_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tether_core::Query;
    use tether_db::{Database, DbConfig};

    fn spec() -> EntitySpec {
        EntitySpec::new("Person", "objID")
    }

    fn person(value: Value) -> Record {
        spec().new_record_with(value.as_object().cloned().unwrap())
    }

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_equal_keys_collapse_to_one_record() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let first = upsert(
            &mut session,
            &spec(),
            person(json!({ "objID": 1, "name": "A" })),
            &UpsertMode::merge(),
        )
        .await
        .unwrap();
        let second = upsert(
            &mut session,
            &spec(),
            person(json!({ "objID": 1, "name": "B" })),
            &UpsertMode::merge(),
        )
        .await
        .unwrap();

        assert_eq!(first.row_id(), second.row_id());
        assert_eq!(second.get("name"), Some(&json!("B")));
        assert_eq!(session.count("Person").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyless_records_always_insert() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        for _ in 0..2 {
            upsert(
                &mut session,
                &spec(),
                person(json!({ "name": "anon" })),
                &UpsertMode::merge(),
            )
            .await
            .unwrap();
        }

        assert_eq!(session.count("Person").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_mode_rejects_existing_key() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        upsert(&mut session, &spec(), person(json!({ "objID": 9 })), &UpsertMode::Insert)
            .await
            .unwrap();
        let err = upsert(&mut session, &spec(), person(json!({ "objID": 9 })), &UpsertMode::Insert)
            .await
            .unwrap_err();

        match err {
            SyncError::DedupViolation { entity, key } => {
                assert_eq!(entity, "Person");
                assert_eq!(key, "9");
            }
            other => panic!("expected DedupViolation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_property_filter_merge() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        upsert(
            &mut session,
            &spec(),
            person(json!({ "objID": 1, "name": "A", "age": 5 })),
            &UpsertMode::Insert,
        )
        .await
        .unwrap();

        let merged = upsert(
            &mut session,
            &spec(),
            person(json!({ "objID": 1, "name": "B", "age": 99 })),
            &UpsertMode::merge_properties(["name"]),
        )
        .await
        .unwrap();
        assert_eq!(merged.get("age"), Some(&json!(5)));

        let stored = session.query("Person", &Query::all()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("name"), Some(&json!("B")));
        assert_eq!(stored[0].get("age"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_required_key_is_programmer_error() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();
        let strict = spec().requiring_primary_key(true);

        let err = upsert(
            &mut session,
            &strict,
            strict.new_record_with(json!({ "name": "x" }).as_object().cloned().unwrap()),
            &UpsertMode::merge(),
        )
        .await
        .unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[tokio::test]
    async fn test_foreign_record_is_programmer_error() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let err = upsert(
            &mut session,
            &spec(),
            Record::new("Comment", "objID"),
            &UpsertMode::Insert,
        )
        .await
        .unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[tokio::test]
    async fn test_batch_and_duplicate_detection() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let stored = upsert_batch(
            &mut session,
            &spec(),
            vec![
                person(json!({ "objID": 1, "name": "A" })),
                person(json!({ "objID": 2, "name": "B" })),
                person(json!({ "objID": 1, "name": "C" })),
            ],
            &UpsertMode::merge(),
        )
        .await
        .unwrap();

        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].row_id(), stored[2].row_id());
        assert_eq!(session.count("Person").await.unwrap(), 2);

        assert!(!is_duplicate(&mut session, &stored[0]).await.unwrap());
        assert!(is_duplicate(&mut session, &person(json!({ "objID": 2 }))).await.unwrap());
        assert!(!is_duplicate(&mut session, &person(json!({ "objID": 3 }))).await.unwrap());
        assert!(!is_duplicate(&mut session, &person(json!({ "name": "z" }))).await.unwrap());
    }

    #[tokio::test]
    async fn test_stored_record_is_written_back() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let mut stored = upsert(
            &mut session,
            &spec(),
            person(json!({ "objID": 1, "name": "A" })),
            &UpsertMode::Insert,
        )
        .await
        .unwrap();
        let row_id = stored.row_id();

        stored.set("name", "Z");
        let saved = upsert(&mut session, &spec(), stored, &UpsertMode::Insert)
            .await
            .unwrap();

        assert_eq!(saved.row_id(), row_id);
        assert!(!saved.is_dirty());
        assert_eq!(session.count("Person").await.unwrap(), 1);
    }
}
