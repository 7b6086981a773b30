//! # Store Session
//!
//! One unit of work against the store: a SQLite transaction plus the record
//! operations the upper layers need.
//!
//! ```text
//!   db.begin() ──► StoreSession
//!                    │ query / insert / update / delete / lookup / clear_all
//!                    │ (all inside one transaction)
//!                    ▼
//!               commit()  → every change becomes durable at once
//!               rollback() or drop → nothing happened
//! ```

use chrono::Utc;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::debug;

use tether_core::{FieldMap, Query, Record};

use crate::error::{DbError, DbResult};
use crate::sql;

/// Row shape read back from the `records` table.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: i64,
    entity: String,
    primary_key_field: String,
    fields: String,
}

impl RecordRow {
    fn into_record(self) -> DbResult<Record> {
        let fields: FieldMap = serde_json::from_str(&self.fields)?;
        Ok(Record::from_stored(
            self.entity,
            self.primary_key_field,
            self.id,
            fields,
        ))
    }
}

const SELECT_RECORDS: &str = "SELECT id, entity, primary_key_field, fields FROM records";

/// Open transaction against the record store.
pub struct StoreSession {
    tx: Transaction<'static, Sqlite>,
}

impl std::fmt::Debug for StoreSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSession").finish_non_exhaustive()
    }
}

impl StoreSession {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        StoreSession { tx }
    }

    /// Records of `entity` matching `query`, sorted, then limited.
    pub async fn query(&mut self, entity: &str, query: &Query) -> DbResult<Vec<Record>> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_RECORDS);
        builder.push(" WHERE entity = ");
        builder.push_bind(entity.to_string());

        if let Some(predicate) = &query.predicate {
            builder.push(" AND ");
            sql::push_predicate(&mut builder, predicate)?;
        }

        sql::push_order(&mut builder, &query.sort)?;

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::from(limit));
        }

        let rows: Vec<RecordRow> = builder
            .build_query_as::<RecordRow>()
            .fetch_all(&mut *self.tx)
            .await?;

        debug!(entity = %entity, count = rows.len(), "Query executed");

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Inserts a new record and assigns its store identity.
    ///
    /// ## Returns
    /// * `Ok(row_id)` - record is stored (pending commit) and marked clean
    /// * `Err(DbError::UniqueViolation)` - another record holds the primary key
    /// * `Err(DbError::AlreadyStored)` - record already has a row id
    pub async fn insert(&mut self, record: &mut Record) -> DbResult<i64> {
        if let Some(row_id) = record.row_id() {
            return Err(DbError::AlreadyStored {
                entity: record.entity().to_string(),
                row_id,
            });
        }

        let primary_key = record.primary_key().and_then(sql::canonical_key);
        let fields = serde_json::to_string(record.fields())?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO records (
                entity, primary_key_field, primary_key, fields, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(record.entity().to_string())
        .bind(record.primary_key_field().to_string())
        .bind(primary_key)
        .bind(fields)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        let row_id = result.last_insert_rowid();
        record.assign_row_id(row_id);
        record.mark_clean();

        debug!(entity = %record.entity(), row_id, "Record inserted");
        Ok(row_id)
    }

    /// Writes a stored record back.
    ///
    /// With `fields`, only the named fields are written; other stored fields
    /// keep their current values. Names missing from `record` are skipped.
    pub async fn update(&mut self, record: &Record, fields: Option<&[String]>) -> DbResult<()> {
        let row_id = record
            .row_id()
            .ok_or_else(|| DbError::not_found(record.entity(), "unsaved record"))?;

        let stored = match fields {
            None => record.fields().clone(),
            Some(names) => {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT fields FROM records WHERE id = ?1")
                        .bind(row_id)
                        .fetch_optional(&mut *self.tx)
                        .await?;
                let current =
                    current.ok_or_else(|| DbError::not_found(record.entity(), row_id.to_string()))?;

                let mut map: FieldMap = serde_json::from_str(&current)?;
                for name in names {
                    if let Some(value) = record.get(name) {
                        map.insert(name.clone(), value.clone());
                    }
                }
                map
            }
        };

        let primary_key = stored
            .get(record.primary_key_field())
            .and_then(sql::canonical_key);
        let encoded = serde_json::to_string(&stored)?;

        let result = sqlx::query(
            "UPDATE records SET primary_key = ?1, fields = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(primary_key)
        .bind(encoded)
        .bind(Utc::now())
        .bind(row_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(record.entity(), row_id.to_string()));
        }

        debug!(entity = %record.entity(), row_id, partial = fields.is_some(), "Record updated");
        Ok(())
    }

    /// Deletes a record by row id, or by primary key when it was never loaded.
    ///
    /// ## Returns
    /// `true` if a row was removed.
    pub async fn delete(&mut self, record: &Record) -> DbResult<bool> {
        let result = if let Some(row_id) = record.row_id() {
            sqlx::query("DELETE FROM records WHERE id = ?1")
                .bind(row_id)
                .execute(&mut *self.tx)
                .await?
        } else if let Some(key) = record.primary_key().and_then(sql::canonical_key) {
            sqlx::query(
                "DELETE FROM records WHERE entity = ?1 AND primary_key_field = ?2 AND primary_key = ?3",
            )
            .bind(record.entity().to_string())
            .bind(record.primary_key_field().to_string())
            .bind(key)
            .execute(&mut *self.tx)
            .await?
        } else {
            return Ok(false);
        };

        let removed = result.rows_affected() > 0;
        debug!(entity = %record.entity(), removed, "Record delete");
        Ok(removed)
    }

    /// Finds the stored record of `entity` whose `pk_field` equals `value`.
    pub async fn primary_key_lookup(
        &mut self,
        entity: &str,
        pk_field: &str,
        value: &Value,
    ) -> DbResult<Option<Record>> {
        let Some(key) = sql::canonical_key(value) else {
            return Ok(None);
        };

        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, entity, primary_key_field, fields
            FROM records
            WHERE entity = ?1 AND primary_key_field = ?2 AND primary_key = ?3
            "#,
        )
        .bind(entity.to_string())
        .bind(pk_field.to_string())
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    /// Number of stored records of `entity`.
    pub async fn count(&mut self, entity: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE entity = ?1")
            .bind(entity.to_string())
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count)
    }

    /// Deletes every record of every entity.
    pub async fn clear_all(&mut self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM records")
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Makes every change in this session durable.
    pub async fn commit(self) -> DbResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }

    /// Discards every change in this session.
    pub async fn rollback(self) -> DbResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;
    use tether_core::{Predicate, SortKey};

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn article(value: Value) -> Record {
        Record::new("Article", "objID").with_fields(value.as_object().cloned().unwrap())
    }

    async fn seed(db: &Database) {
        let mut session = db.begin().await.unwrap();
        for value in [
            json!({ "objID": 1, "title": "Hello", "rank": 3 }),
            json!({ "objID": 2, "title": "World", "rank": 1 }),
            json!({ "objID": 3, "title": "help wanted", "rank": 2, "draft": true }),
        ] {
            session.insert(&mut article(value)).await.unwrap();
        }
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_assigns_row_id_and_cleans() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let mut record = article(json!({ "objID": 1, "title": "Hello" }));
        assert!(record.is_dirty());

        let row_id = session.insert(&mut record).await.unwrap();
        assert_eq!(record.row_id(), Some(row_id));
        assert!(!record.is_dirty());

        assert!(matches!(
            session.insert(&mut record).await,
            Err(DbError::AlreadyStored { .. })
        ));
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_primary_key_rejected() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        session
            .insert(&mut article(json!({ "objID": 7 })))
            .await
            .unwrap();
        let err = session
            .insert(&mut article(json!({ "objID": 7 })))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_keyless_records_never_collide() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        session.insert(&mut article(json!({ "title": "a" }))).await.unwrap();
        session
            .insert(&mut article(json!({ "objID": null, "title": "b" })))
            .await
            .unwrap();

        assert_eq!(session.count("Article").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_query_filter_sort_limit() {
        let db = setup().await;
        seed(&db).await;
        let mut session = db.begin().await.unwrap();

        let all = session.query("Article", &Query::all()).await.unwrap();
        let ids: Vec<Value> = all.iter().map(|r| r.get("objID").cloned().unwrap()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);

        let sorted = session
            .query("Article", &Query::all().sort_by(SortKey::ascending("rank")).limit(2))
            .await
            .unwrap();
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].get("objID"), Some(&json!(2)));
        assert_eq!(sorted[1].get("objID"), Some(&json!(3)));

        let hel = session
            .query("Article", &Query::filter(Predicate::contains("title", "HEL")))
            .await
            .unwrap();
        assert_eq!(hel.len(), 2);

        let drafts = session
            .query("Article", &Query::filter(Predicate::eq("draft", true)))
            .await
            .unwrap();
        assert_eq!(drafts.len(), 1);

        let not_drafts = session
            .query("Article", &Query::filter(Predicate::is_null("draft")))
            .await
            .unwrap();
        assert_eq!(not_drafts.len(), 2);

        let other = session.query("Comment", &Query::all()).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_query_rejects_bad_field() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let err = session
            .query("Article", &Query::filter(Predicate::eq("", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_fields() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let mut record = article(json!({ "objID": 1, "name": "A", "age": 5 }));
        session.insert(&mut record).await.unwrap();

        record.set("name", "B");
        record.set("age", 99);
        session
            .update(&record, Some(&["name".to_string()]))
            .await
            .unwrap();

        let stored = session
            .primary_key_lookup("Article", "objID", &json!(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("name"), Some(&json!("B")));
        assert_eq!(stored.get("age"), Some(&json!(5)));
        assert_eq!(stored.row_id(), record.row_id());
    }

    #[tokio::test]
    async fn test_update_unsaved_record_fails() {
        let db = setup().await;
        let mut session = db.begin().await.unwrap();

        let record = article(json!({ "objID": 1 }));
        assert!(matches!(
            session.update(&record, None).await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_by_row_id_and_by_key() {
        let db = setup().await;
        seed(&db).await;
        let mut session = db.begin().await.unwrap();

        let first = session
            .primary_key_lookup("Article", "objID", &json!(1))
            .await
            .unwrap()
            .unwrap();
        assert!(session.delete(&first).await.unwrap());
        assert!(!session.delete(&first).await.unwrap());

        assert!(session.delete(&article(json!({ "objID": 2 }))).await.unwrap());
        assert!(!session.delete(&article(json!({ "title": "no key" }))).await.unwrap());

        assert_eq!(session.count("Article").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let db = setup().await;

        let mut session = db.begin().await.unwrap();
        session.insert(&mut article(json!({ "objID": 1 }))).await.unwrap();
        session.rollback().await.unwrap();

        let mut session = db.begin().await.unwrap();
        assert_eq!(session.count("Article").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let db = setup().await;
        seed(&db).await;

        let mut session = db.begin().await.unwrap();
        assert_eq!(session.clear_all().await.unwrap(), 3);
        session.commit().await.unwrap();

        let mut session = db.begin().await.unwrap();
        assert!(session.query("Article", &Query::all()).await.unwrap().is_empty());
    }
}
