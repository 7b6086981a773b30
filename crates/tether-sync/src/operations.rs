//! # Operations
//!
//! One function per kind of work. The work queue runs these from its worker
//! task; the direct API awaits them inline on the caller's task. Each one
//! opens its own store session and finishes it (commit on success, rollback
//! on failure) before returning.
//!
//! ## Connection Rule
//! A session is never held while another is opened, and never across a
//! network await. An in-memory store has exactly one connection.

use tracing::{debug, warn};

use tether_core::{EntitySpec, ParseTree, Query, Record};
use tether_db::{Database, StoreSession};

use crate::dedup::{self, UpsertMode};
use crate::error::{SyncError, SyncResult};
use crate::fetch::{FetchReport, FetchRequest, FetchRoute, Fetcher};

/// Commits on `Ok`, rolls back on `Err`.
async fn finish<T>(session: StoreSession, result: SyncResult<T>) -> SyncResult<T> {
    match result {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = session.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

fn check_owner(spec: &EntitySpec, record: &Record) -> SyncResult<()> {
    if record.entity() != spec.name {
        return Err(SyncError::Programmer(format!(
            "{} record passed to the {} model",
            record.entity(),
            spec.name
        )));
    }
    Ok(())
}

pub async fn query(db: &Database, entity: &str, query: &Query) -> SyncResult<Vec<Record>> {
    let mut session = db.begin().await?;
    let result = session.query(entity, query).await.map_err(SyncError::from);
    finish(session, result).await
}

/// Upserts every record in one session. All or nothing.
pub async fn save(
    db: &Database,
    spec: &EntitySpec,
    records: Vec<Record>,
    mode: &UpsertMode,
) -> SyncResult<Vec<Record>> {
    let count = records.len();
    let mut session = db.begin().await?;
    let result = dedup::upsert_batch(&mut session, spec, records, mode).await;
    let stored = finish(session, result).await?;
    debug!(entity = %spec.name, count, "Records saved");
    Ok(stored)
}

/// Deletes the records in one session.
///
/// ## Returns
/// How many of them were actually stored and removed.
pub async fn destroy(db: &Database, spec: &EntitySpec, records: &[Record]) -> SyncResult<usize> {
    for record in records {
        check_owner(spec, record)?;
    }

    let mut session = db.begin().await?;
    let mut result = Ok(0usize);
    for record in records {
        match session.delete(record).await {
            Ok(true) => {
                if let Ok(removed) = result.as_mut() {
                    *removed += 1;
                }
            }
            Ok(false) => {}
            Err(e) => {
                result = Err(e.into());
                break;
            }
        }
    }
    let removed = finish(session, result).await?;
    debug!(entity = %spec.name, removed, requested = records.len(), "Records destroyed");
    Ok(removed)
}

/// Fetches, maps and (when the request persists) merges by primary key.
///
/// Network and decoding finish before a store session is opened.
pub async fn fetch(
    db: &Database,
    fetcher: &Fetcher,
    spec: &EntitySpec,
    request: &FetchRequest,
    route: FetchRoute,
) -> SyncResult<FetchReport> {
    let mut report = fetcher.fetch_records(spec, request, route).await?;

    if let Some(partial) = report.partial_error(&spec.name) {
        warn!(url = %request.url, error = %partial, "Collection fetch partially mapped");
        for failure in &report.failures {
            debug!(error = %failure, "Skipped element");
        }
    }

    if request.persist && !report.records.is_empty() {
        let records = std::mem::take(&mut report.records);
        report.records = save(db, spec, records, &UpsertMode::merge()).await?;
    }

    debug!(
        url = %request.url,
        entity = %spec.name,
        mapped = report.records.len(),
        persisted = request.persist,
        "Fetch complete"
    );
    Ok(report)
}

/// Fetches and reshapes without mapping or storing.
pub async fn fetch_raw(fetcher: &Fetcher, request: &FetchRequest) -> SyncResult<ParseTree> {
    fetcher.fetch_tree(request).await
}

pub async fn is_duplicate(db: &Database, record: &Record) -> SyncResult<bool> {
    let mut session = db.begin().await?;
    let result = dedup::is_duplicate(&mut session, record).await;
    finish(session, result).await
}

pub async fn clear(db: &Database) -> SyncResult<u64> {
    Ok(db.clear_disk_storage().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_db::DbConfig;

    fn spec() -> EntitySpec {
        EntitySpec::new("Article", "objID")
    }

    fn article(id: i64) -> Record {
        spec().new_record_with(json!({ "objID": id, "title": format!("#{}", id) }).as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let err = save(&db, &spec(), vec![article(1), article(1)], &UpsertMode::Insert)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DedupViolation { .. }));

        let stored = query(&db, "Article", &Query::all()).await.unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_counts_removed() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let stored = save(&db, &spec(), vec![article(1), article(2)], &UpsertMode::Insert)
            .await
            .unwrap();

        let mut targets = stored.clone();
        targets.push(article(3));
        assert_eq!(destroy(&db, &spec(), &targets).await.unwrap(), 2);
        assert!(query(&db, "Article", &Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_rejects_foreign_record() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = destroy(&db, &spec(), &[Record::new("Comment", "objID")])
            .await
            .unwrap_err();
        assert!(err.is_programmer_error());
    }
}
