//! # Ledger Facade
//!
//! The entry point applications hold. One [`Ledger`] owns one store, the
//! store's work queue and the fetch pipeline. Per-entity access goes through
//! [`Model`] (queued, returns [`Ticket`]s) or [`Direct`] (inline, awaited on
//! the caller's task, bypassing the queue).
//!
//! ## Queued vs Direct
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ledger.model::<Article>()                                             │
//! │     │                                                                   │
//! │     ├── .save(r) / .find(p) / .get_all(url)   → Ticket<T>               │
//! │     │        └── WorkQueue (FIFO, one at a time)                        │
//! │     │                                                                   │
//! │     └── .direct().save(r).await                → SyncResult<T>          │
//! │              └── operations::* on the caller's task                     │
//! │                                                                         │
//! │  Both paths share the same store; they are NOT ordered against each     │
//! │  other. Mix them only when that race is acceptable.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use tether_core::{PersistableEntity, Predicate};
//! use tether_sync::{Ledger, TetherConfig};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Article {
//!     #[serde(rename = "objID")]
//!     id: i64,
//!     title: String,
//! }
//!
//! impl PersistableEntity for Article {}
//!
//! # async fn demo() -> tether_sync::SyncResult<()> {
//! let ledger = Ledger::open(&TetherConfig::load(None)?).await?;
//! let articles = ledger.model::<Article>();
//!
//! let report = articles.get_all("articles").await?;
//! let rust = articles.find(Predicate::contains("title", "rust")).await?;
//! println!("{} fetched, {} about rust", report.records.len(), rust.len());
//!
//! ledger.close().await
//! # }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

use tether_core::{EntitySpec, FieldMap, ParseTree, PersistableEntity, Predicate, Query, Record, SortKey};
use tether_db::Database;

use crate::config::TetherConfig;
use crate::dedup::UpsertMode;
use crate::error::{SyncError, SyncResult};
use crate::fetch::{Decoder, FetchReport, FetchRequest, FetchRoute, Fetcher, HttpTransport, JsonDecoder, Transport};
use crate::operations;
use crate::queue::{first, Ticket, WorkQueue};

// =============================================================================
// Ledger
// =============================================================================

/// One store plus its work queue and fetch pipeline.
#[derive(Debug, Clone)]
pub struct Ledger {
    db: Arc<Database>,
    queue: WorkQueue,
    fetcher: Fetcher,
}

impl Ledger {
    /// Opens the configured store, runs migrations and starts the work queue.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(config: &TetherConfig) -> SyncResult<Self> {
        config.validate()?;

        let db = Database::new(config.db_config()?).await?;
        let transport = HttpTransport::from_config(config)?;
        let ledger = Self::with_parts_named(
            Arc::new(db),
            Arc::new(transport),
            Arc::new(JsonDecoder),
            &config.queue.name,
        )?;

        info!(queue = %config.queue.name, "Ledger opened");
        Ok(ledger)
    }

    /// Builds a ledger over an already open store with custom collaborators.
    pub fn with_parts(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
    ) -> SyncResult<Self> {
        Self::with_parts_named(db, transport, decoder, "tether")
    }

    fn with_parts_named(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
        name: &str,
    ) -> SyncResult<Self> {
        let fetcher = Fetcher::new(transport, decoder);
        let queue = WorkQueue::spawn(Arc::clone(&db), fetcher.clone(), name)?;
        Ok(Ledger { db, queue, fetcher })
    }

    /// Access to one typed entity collection.
    pub fn model<E: PersistableEntity>(&self) -> Model<E> {
        self.model_with(EntitySpec::of::<E>())
    }

    /// Access to a collection described only at runtime.
    pub fn model_for(&self, spec: EntitySpec) -> Model<Record> {
        self.model_with(spec)
    }

    fn model_with<E>(&self, spec: EntitySpec) -> Model<E> {
        Model {
            spec,
            queue: self.queue.clone(),
            db: Arc::clone(&self.db),
            fetcher: self.fetcher.clone(),
            _entity: PhantomData,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Queues a wipe of every stored record.
    pub fn clear_disk_storage(&self) -> Ticket<u64> {
        self.queue.clear()
    }

    /// Wipes every stored record on the caller's task.
    pub async fn direct_clear_disk_storage(&self) -> SyncResult<u64> {
        operations::clear(&self.db).await
    }

    /// See [`WorkQueue::stop_operations`].
    pub fn stop_operations(&self) {
        self.queue.stop_operations();
    }

    /// See [`WorkQueue::wait`].
    pub async fn wait(&self) -> SyncResult<()> {
        self.queue.wait().await
    }

    /// See [`WorkQueue::wait_blocking`].
    pub fn wait_blocking(&self) -> SyncResult<()> {
        self.queue.wait_blocking()
    }

    /// Drains the queue, stops its worker and closes the store.
    pub async fn close(self) -> SyncResult<()> {
        self.queue.wait().await?;
        // The worker may already be gone if every other handle was dropped.
        let _ = self.queue.shutdown().await;
        self.db.close().await;
        info!("Ledger closed");
        Ok(())
    }
}

// =============================================================================
// Model (queued)
// =============================================================================

/// Queued operations on one entity collection.
///
/// `E` is the Rust type the collection maps to, or [`Record`] for a
/// collection built from an [`EntitySpec`] alone.
pub struct Model<E> {
    spec: EntitySpec,
    queue: WorkQueue,
    db: Arc<Database>,
    fetcher: Fetcher,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Model<E> {
    fn clone(&self) -> Self {
        Model {
            spec: self.spec.clone(),
            queue: self.queue.clone(),
            db: Arc::clone(&self.db),
            fetcher: self.fetcher.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for Model<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("spec", &self.spec).finish()
    }
}

impl<E> Model<E> {
    pub fn spec(&self) -> &EntitySpec {
        &self.spec
    }

    pub fn entity_name(&self) -> &str {
        &self.spec.name
    }

    pub fn primary_key(&self) -> &str {
        &self.spec.primary_key
    }

    /// Empty record of this entity. Not stored until saved.
    pub fn new_object(&self) -> Record {
        self.spec.new_record()
    }

    pub fn new_object_with(&self, fields: FieldMap) -> Record {
        self.spec.new_record_with(fields)
    }

    /// The same collection, bypassing the queue.
    pub fn direct(&self) -> Direct<E> {
        Direct {
            spec: self.spec.clone(),
            db: Arc::clone(&self.db),
            fetcher: self.fetcher.clone(),
            _entity: PhantomData,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn all(&self) -> Ticket<Vec<Record>> {
        self.find_query(Query::all())
    }

    pub fn all_sorted(&self, sort: impl IntoIterator<Item = SortKey>) -> Ticket<Vec<Record>> {
        self.find_query(Query::all().sorted(sort))
    }

    pub fn find(&self, predicate: Predicate) -> Ticket<Vec<Record>> {
        self.find_query(Query::filter(predicate))
    }

    pub fn find_sorted(
        &self,
        predicate: Predicate,
        sort: impl IntoIterator<Item = SortKey>,
    ) -> Ticket<Vec<Record>> {
        self.find_query(Query::filter(predicate).sorted(sort))
    }

    pub fn find_limited(
        &self,
        predicate: Predicate,
        sort: impl IntoIterator<Item = SortKey>,
        limit: u32,
    ) -> Ticket<Vec<Record>> {
        self.find_query(Query::filter(predicate).sorted(sort).limit(limit))
    }

    pub fn find_query(&self, query: Query) -> Ticket<Vec<Record>> {
        self.queue.query(&self.spec.name, query)
    }

    pub fn is_duplicate(&self, record: Record) -> Ticket<bool> {
        if let Err(e) = owned_by(&self.spec, &record) {
            return Ticket::failed(e);
        }
        self.queue.is_duplicate(record)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Inserts `record`, or writes it back if it is already stored.
    ///
    /// Fails with `DedupViolation` when another stored record holds its key.
    pub fn save(&self, record: Record) -> Ticket<Record> {
        self.save_objects(vec![record]).and_then(first)
    }

    pub fn save_objects(&self, records: Vec<Record>) -> Ticket<Vec<Record>> {
        self.queue.save(self.spec.clone(), records, UpsertMode::Insert)
    }

    /// Inserts `record`, or merges it into the stored record with its key.
    pub fn save_or_update(&self, record: Record) -> Ticket<Record> {
        self.update_objects(vec![record]).and_then(first)
    }

    /// Like [`save_or_update`](Self::save_or_update), copying only `properties`
    /// onto an existing record.
    pub fn save_or_update_properties<I, S>(&self, record: Record, properties: I) -> Ticket<Record>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_objects_properties(vec![record], properties)
            .and_then(first)
    }

    pub fn update_objects(&self, records: Vec<Record>) -> Ticket<Vec<Record>> {
        self.queue.save(self.spec.clone(), records, UpsertMode::merge())
    }

    pub fn update_objects_properties<I, S>(&self, records: Vec<Record>, properties: I) -> Ticket<Vec<Record>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue.save(
            self.spec.clone(),
            records,
            UpsertMode::merge_properties(properties),
        )
    }

    /// Creates and inserts a record from a field mapping.
    pub fn create(&self, fields: FieldMap) -> Ticket<Record> {
        self.queue.create(self.spec.clone(), fields)
    }

    /// Resolves to whether the record was stored and is now removed.
    pub fn destroy(&self, record: Record) -> Ticket<bool> {
        self.destroy_objects(vec![record]).map(|removed| removed == 1)
    }

    /// Resolves to how many of the records were removed.
    pub fn destroy_objects(&self, records: Vec<Record>) -> Ticket<usize> {
        self.queue.destroy(self.spec.clone(), records)
    }

    // -------------------------------------------------------------------------
    // Fetches
    // -------------------------------------------------------------------------

    /// Fetches exactly one entity and merges it into the store.
    pub fn get(&self, request: impl Into<FetchRequest>) -> Ticket<Record> {
        self.fetch(request, FetchRoute::Single)
            .and_then(FetchReport::into_single)
    }

    /// Fetches a collection and merges every mappable element.
    pub fn get_all(&self, request: impl Into<FetchRequest>) -> Ticket<FetchReport> {
        self.fetch(request, FetchRoute::Collection)
    }

    /// Fetches and reshapes without mapping or storing.
    pub fn get_raw(&self, request: impl Into<FetchRequest>) -> Ticket<ParseTree> {
        self.queue.fetch_raw(request.into())
    }

    pub fn fetch(&self, request: impl Into<FetchRequest>, route: FetchRoute) -> Ticket<FetchReport> {
        self.queue.fetch(self.spec.clone(), request.into(), route)
    }
}

impl<E: PersistableEntity> Model<E> {
    /// Converts a typed value into a new, unsaved record.
    pub fn record_from(&self, entity: &E) -> SyncResult<Record> {
        Ok(entity.to_record()?)
    }

    /// Queues an insert of a typed value.
    pub fn save_entity(&self, entity: &E) -> Ticket<Record> {
        match self.record_from(entity) {
            Ok(record) => self.save(record),
            Err(e) => Ticket::failed(e),
        }
    }

    /// Maps stored records back to typed values.
    pub fn decode_all(&self, records: &[Record]) -> SyncResult<Vec<E>> {
        records
            .iter()
            .map(|record| E::from_record(record).map_err(SyncError::from))
            .collect()
    }
}

fn owned_by(spec: &EntitySpec, record: &Record) -> SyncResult<()> {
    if record.entity() != spec.name {
        return Err(SyncError::Programmer(format!(
            "{} record passed to the {} model",
            record.entity(),
            spec.name
        )));
    }
    Ok(())
}

// =============================================================================
// Direct (unqueued)
// =============================================================================

/// The same operations as [`Model`], run inline on the caller's task.
///
/// Not ordered against queued work. On an in-memory store a direct call made
/// while the queue holds the connection waits for the queue's item to finish.
pub struct Direct<E> {
    spec: EntitySpec,
    db: Arc<Database>,
    fetcher: Fetcher,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Direct<E> {
    fn clone(&self) -> Self {
        Direct {
            spec: self.spec.clone(),
            db: Arc::clone(&self.db),
            fetcher: self.fetcher.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for Direct<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Direct").field("spec", &self.spec).finish()
    }
}

impl<E> Direct<E> {
    pub async fn all(&self) -> SyncResult<Vec<Record>> {
        self.find_query(&Query::all()).await
    }

    pub async fn all_sorted(&self, sort: impl IntoIterator<Item = SortKey>) -> SyncResult<Vec<Record>> {
        self.find_query(&Query::all().sorted(sort)).await
    }

    pub async fn find(&self, predicate: Predicate) -> SyncResult<Vec<Record>> {
        self.find_query(&Query::filter(predicate)).await
    }

    pub async fn find_sorted(
        &self,
        predicate: Predicate,
        sort: impl IntoIterator<Item = SortKey>,
    ) -> SyncResult<Vec<Record>> {
        self.find_query(&Query::filter(predicate).sorted(sort)).await
    }

    pub async fn find_limited(
        &self,
        predicate: Predicate,
        sort: impl IntoIterator<Item = SortKey>,
        limit: u32,
    ) -> SyncResult<Vec<Record>> {
        self.find_query(&Query::filter(predicate).sorted(sort).limit(limit))
            .await
    }

    pub async fn find_query(&self, query: &Query) -> SyncResult<Vec<Record>> {
        operations::query(&self.db, &self.spec.name, query).await
    }

    pub async fn is_duplicate(&self, record: &Record) -> SyncResult<bool> {
        owned_by(&self.spec, record)?;
        operations::is_duplicate(&self.db, record).await
    }

    pub async fn save(&self, record: Record) -> SyncResult<Record> {
        first(self.save_objects(vec![record]).await?)
    }

    pub async fn save_objects(&self, records: Vec<Record>) -> SyncResult<Vec<Record>> {
        operations::save(&self.db, &self.spec, records, &UpsertMode::Insert).await
    }

    pub async fn save_or_update(&self, record: Record) -> SyncResult<Record> {
        first(self.update_objects(vec![record]).await?)
    }

    pub async fn save_or_update_properties<I, S>(&self, record: Record, properties: I) -> SyncResult<Record>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        first(self.update_objects_properties(vec![record], properties).await?)
    }

    pub async fn update_objects(&self, records: Vec<Record>) -> SyncResult<Vec<Record>> {
        operations::save(&self.db, &self.spec, records, &UpsertMode::merge()).await
    }

    pub async fn update_objects_properties<I, S>(&self, records: Vec<Record>, properties: I) -> SyncResult<Vec<Record>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mode = UpsertMode::merge_properties(properties);
        operations::save(&self.db, &self.spec, records, &mode).await
    }

    pub async fn create(&self, fields: FieldMap) -> SyncResult<Record> {
        self.save(self.spec.new_record_with(fields)).await
    }

    pub async fn destroy(&self, record: Record) -> SyncResult<bool> {
        self.destroy_objects(vec![record]).await
    }

    /// True when every record was stored and is now removed.
    pub async fn destroy_objects(&self, records: Vec<Record>) -> SyncResult<bool> {
        let removed = operations::destroy(&self.db, &self.spec, &records).await?;
        Ok(removed == records.len())
    }

    pub async fn get(&self, request: impl Into<FetchRequest>) -> SyncResult<Record> {
        self.fetch(request, FetchRoute::Single).await?.into_single()
    }

    pub async fn get_all(&self, request: impl Into<FetchRequest>) -> SyncResult<FetchReport> {
        self.fetch(request, FetchRoute::Collection).await
    }

    pub async fn get_raw(&self, request: impl Into<FetchRequest>) -> SyncResult<ParseTree> {
        operations::fetch_raw(&self.fetcher, &request.into()).await
    }

    pub async fn fetch(&self, request: impl Into<FetchRequest>, route: FetchRoute) -> SyncResult<FetchReport> {
        operations::fetch(&self.db, &self.fetcher, &self.spec, &request.into(), route).await
    }
}
