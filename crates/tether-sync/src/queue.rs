//! # Work Queue
//!
//! Serializes every queued store mutation, query and fetch through one
//! background task. Items run strictly in submission order, one at a time.
//!
//! ## Queue Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Work Queue Flow                                 │
//! │                                                                         │
//! │  caller task(s)                         worker task (one per store)     │
//! │  ──────────────                         ───────────────────────────     │
//! │                                                                         │
//! │  WorkQueue::save(..)                                                    │
//! │     │  outstanding += 1                                                 │
//! │     ├─────── WorkItem ──── mpsc ──────► recv()                          │
//! │     │                                     │                             │
//! │     ▼                                     ├── stopped? ──► Cancelled    │
//! │  Ticket<T> ◄──────── oneshot ─────────────┤                             │
//! │  (await, or on_complete)                  └── CURRENT_QUEUE.scope(      │
//! │                                                  operations::*)         │
//! │  WorkQueue::wait()                                │                     │
//! │     │  watch: outstanding == 0 ◄──────────────────┘ outstanding -= 1    │
//! │     ▼                                                                   │
//! │  returns                                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stopping
//! `stop_operations()` lets the in-flight item finish (its session commits
//! or rolls back as usual). Items still queued resolve with `Cancelled`;
//! items submitted afterwards resolve with `QueueStopped` without being
//! queued at all.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_core::{EntitySpec, FieldMap, ParseTree, Query, Record};
use tether_db::{Database, QueueClaim};

use crate::dedup::UpsertMode;
use crate::error::{SyncError, SyncResult};
use crate::fetch::{FetchReport, FetchRequest, FetchRoute, Fetcher};
use crate::operations;

tokio::task_local! {
    /// Id of the queue whose worker is running the current task.
    static CURRENT_QUEUE: Uuid;
}

// =============================================================================
// Tickets
// =============================================================================

/// Completion handle for one work item.
///
/// Await it, or hand it a callback with [`Ticket::on_complete`]. Dropping a
/// ticket does not cancel the item.
#[must_use = "a ticket does nothing unless awaited or given a callback"]
pub struct Ticket<T> {
    id: Uuid,
    inner: Pin<Box<dyn Future<Output = SyncResult<T>> + Send>>,
}

impl<T: Send + 'static> Ticket<T> {
    fn pending(id: Uuid, rx: oneshot::Receiver<SyncResult<T>>) -> Self {
        Ticket {
            id,
            inner: Box::pin(async move {
                rx.await.unwrap_or_else(|_| {
                    Err(SyncError::ChannelError(
                        "work item dropped without a result".into(),
                    ))
                })
            }),
        }
    }

    /// A ticket that is already resolved with `err`.
    pub fn failed(err: SyncError) -> Self {
        Ticket {
            id: Uuid::new_v4(),
            inner: Box::pin(futures::future::ready(Err(err))),
        }
    }

    /// Id of the work item this ticket tracks.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn map<U, F>(self, f: F) -> Ticket<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Ticket {
            id: self.id,
            inner: Box::pin(self.inner.map(|result| result.map(f))),
        }
    }

    pub fn and_then<U, F>(self, f: F) -> Ticket<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> SyncResult<U> + Send + 'static,
    {
        Ticket {
            id: self.id,
            inner: Box::pin(self.inner.map(|result| result.and_then(f))),
        }
    }

    /// Runs `callback` with the outcome on a spawned task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_complete<F>(self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(SyncResult<T>) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.await) })
    }
}

impl<T> Future for Ticket<T> {
    type Output = SyncResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket").field("id", &self.id).finish()
    }
}

// =============================================================================
// Work Items
// =============================================================================

/// What a work item does. Recorded on log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Save,
    SaveBatch,
    Update,
    Destroy,
    Create,
    FetchSingle,
    FetchCollection,
    FetchRaw,
    Query,
    Clear,
}

type Reply<T> = oneshot::Sender<SyncResult<T>>;

enum Job {
    Save {
        spec: EntitySpec,
        records: Vec<Record>,
        mode: UpsertMode,
        reply: Reply<Vec<Record>>,
    },
    Destroy {
        spec: EntitySpec,
        records: Vec<Record>,
        reply: Reply<usize>,
    },
    Query {
        entity: String,
        query: Query,
        reply: Reply<Vec<Record>>,
    },
    Duplicate {
        record: Record,
        reply: Reply<bool>,
    },
    Fetch {
        spec: EntitySpec,
        request: FetchRequest,
        route: FetchRoute,
        reply: Reply<FetchReport>,
    },
    FetchRaw {
        request: FetchRequest,
        reply: Reply<ParseTree>,
    },
    Clear {
        reply: Reply<u64>,
    },
}

/// How a work item ended. Recorded on log lines.
enum Outcome {
    Finished,
    Failed(String),
    Panicked,
}

/// Runs `work` and sends its outcome. A panic resolves the ticket with
/// `Internal` instead of dropping the reply.
async fn deliver<T, F>(reply: Reply<T>, work: F) -> Outcome
where
    F: Future<Output = SyncResult<T>>,
{
    let (result, outcome) = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(value)) => (Ok(value), Outcome::Finished),
        Ok(Err(err)) => {
            let reason = err.to_string();
            (Err(err), Outcome::Failed(reason))
        }
        Err(_) => (
            Err(SyncError::Internal("work item panicked".into())),
            Outcome::Panicked,
        ),
    };
    // The ticket may have been dropped; the item still ran.
    let _ = reply.send(result);
    outcome
}

impl Job {
    async fn execute(self, db: &Database, fetcher: &Fetcher) -> Outcome {
        match self {
            Job::Save {
                spec,
                records,
                mode,
                reply,
            } => deliver(reply, operations::save(db, &spec, records, &mode)).await,
            Job::Destroy {
                spec,
                records,
                reply,
            } => deliver(reply, operations::destroy(db, &spec, &records)).await,
            Job::Query {
                entity,
                query,
                reply,
            } => deliver(reply, operations::query(db, &entity, &query)).await,
            Job::Duplicate { record, reply } => {
                deliver(reply, operations::is_duplicate(db, &record)).await
            }
            Job::Fetch {
                spec,
                request,
                route,
                reply,
            } => deliver(reply, operations::fetch(db, fetcher, &spec, &request, route)).await,
            Job::FetchRaw { request, reply } => {
                deliver(reply, operations::fetch_raw(fetcher, &request)).await
            }
            Job::Clear { reply } => deliver(reply, operations::clear(db)).await,
        }
    }

    fn cancel(self) {
        match self {
            Job::Save { reply, .. } | Job::Query { reply, .. } => refuse(reply),
            Job::Destroy { reply, .. } => refuse(reply),
            Job::Duplicate { reply, .. } => refuse(reply),
            Job::Fetch { reply, .. } => refuse(reply),
            Job::FetchRaw { reply, .. } => refuse(reply),
            Job::Clear { reply } => refuse(reply),
        }
    }
}

fn refuse<T>(reply: Reply<T>) {
    let _ = reply.send(Err(SyncError::Cancelled));
}

struct WorkItem {
    id: Uuid,
    kind: WorkKind,
    job: Job,
}

/// State shared between the handles and the worker.
#[derive(Debug)]
struct QueueState {
    stopped: AtomicBool,
    /// Items submitted and not yet finished or discarded.
    outstanding: watch::Sender<usize>,
}

impl QueueState {
    fn finished_one(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// =============================================================================
// Queue Worker
// =============================================================================

/// Background task that drains the queue.
pub struct QueueWorker {
    queue_id: Uuid,
    name: String,
    db: Arc<Database>,
    fetcher: Fetcher,
    state: Arc<QueueState>,
    rx: mpsc::UnboundedReceiver<WorkItem>,
    shutdown_rx: mpsc::Receiver<()>,
    /// Held for the worker's lifetime.
    _claim: QueueClaim,
}

impl QueueWorker {
    /// Runs until every handle is dropped or `WorkQueue::shutdown` is called.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(queue = %self.name, id = %self.queue_id, "Work queue starting");

        loop {
            tokio::select! {
                item = self.rx.recv() => {
                    match item {
                        Some(item) => self.process(item).await,
                        None => break,
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!(queue = %self.name, "Work queue shutting down");
                    self.discard_remaining();
                    break;
                }
            }
        }

        info!(queue = %self.name, "Work queue stopped");
    }

    async fn process(&self, item: WorkItem) {
        let WorkItem { id, kind, job } = item;

        if self.state.stopped.load(Ordering::Acquire) {
            debug!(queue = %self.name, item = %id, ?kind, "Discarding work item after stop");
            job.cancel();
            self.state.finished_one();
            return;
        }

        debug!(queue = %self.name, item = %id, ?kind, "Work item started");

        let run = CURRENT_QUEUE.scope(self.queue_id, job.execute(&self.db, &self.fetcher));
        match run.await {
            Outcome::Finished => debug!(queue = %self.name, item = %id, ?kind, "Work item finished"),
            Outcome::Failed(reason) => warn!(
                queue = %self.name,
                item = %id,
                ?kind,
                error = %reason,
                "Work item failed"
            ),
            Outcome::Panicked => error!(queue = %self.name, item = %id, ?kind, "Work item panicked"),
        }

        self.state.finished_one();
    }

    fn discard_remaining(&mut self) {
        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            item.job.cancel();
            self.state.finished_one();
        }
    }
}

// =============================================================================
// Work Queue Handle
// =============================================================================

/// Handle for submitting work. Cheap to clone; all clones feed one worker.
#[derive(Clone)]
pub struct WorkQueue {
    id: Uuid,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<WorkItem>,
    shutdown_tx: mpsc::Sender<()>,
    state: Arc<QueueState>,
}

impl WorkQueue {
    /// Creates a queue for `db` and returns the worker to be spawned.
    ///
    /// ## Returns
    /// * `Err(Store(QueueAlreadyAttached))` - another queue already drains this store
    pub fn new(
        db: Arc<Database>,
        fetcher: Fetcher,
        name: impl Into<String>,
    ) -> SyncResult<(QueueWorker, WorkQueue)> {
        let claim = db.claim_queue()?;
        let name = name.into();
        let id = Uuid::new_v4();

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (outstanding, _) = watch::channel(0usize);
        let state = Arc::new(QueueState {
            stopped: AtomicBool::new(false),
            outstanding,
        });

        let worker = QueueWorker {
            queue_id: id,
            name: name.clone(),
            db,
            fetcher,
            state: Arc::clone(&state),
            rx,
            shutdown_rx,
            _claim: claim,
        };

        let handle = WorkQueue {
            id,
            name: name.into(),
            tx,
            shutdown_tx,
            state,
        };

        Ok((worker, handle))
    }

    /// Creates the queue and spawns its worker on the current runtime.
    pub fn spawn(db: Arc<Database>, fetcher: Fetcher, name: impl Into<String>) -> SyncResult<Self> {
        let (worker, handle) = Self::new(db, fetcher, name)?;
        tokio::spawn(worker.run());
        Ok(handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    /// Items submitted and not yet finished.
    pub fn pending(&self) -> usize {
        *self.state.outstanding.borrow()
    }

    fn submit<T: Send + 'static>(
        &self,
        kind: WorkKind,
        make_job: impl FnOnce(Reply<T>) -> Job,
    ) -> Ticket<T> {
        if self.is_stopped() {
            return Ticket::failed(SyncError::QueueStopped);
        }

        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        let item = WorkItem {
            id,
            kind,
            job: make_job(reply),
        };

        self.state.outstanding.send_modify(|n| *n += 1);
        if self.tx.send(item).is_err() {
            self.state.finished_one();
            return Ticket::failed(SyncError::ChannelError("work queue closed".into()));
        }

        debug!(queue = %self.name, item = %id, ?kind, "Work item queued");
        Ticket::pending(id, rx)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Queues an upsert of `records`.
    pub fn save(&self, spec: EntitySpec, records: Vec<Record>, mode: UpsertMode) -> Ticket<Vec<Record>> {
        let kind = match (&mode, records.len()) {
            (UpsertMode::Merge { .. }, _) => WorkKind::Update,
            (UpsertMode::Insert, 1) => WorkKind::Save,
            (UpsertMode::Insert, _) => WorkKind::SaveBatch,
        };
        self.submit(kind, |reply| Job::Save {
            spec,
            records,
            mode,
            reply,
        })
    }

    /// Queues creation of a new record from a field mapping.
    pub fn create(&self, spec: EntitySpec, fields: FieldMap) -> Ticket<Record> {
        let record = spec.new_record_with(fields);
        self.submit(WorkKind::Create, |reply| Job::Save {
            spec,
            records: vec![record],
            mode: UpsertMode::Insert,
            reply,
        })
        .and_then(first)
    }

    pub fn destroy(&self, spec: EntitySpec, records: Vec<Record>) -> Ticket<usize> {
        self.submit(WorkKind::Destroy, |reply| Job::Destroy {
            spec,
            records,
            reply,
        })
    }

    pub fn query(&self, entity: impl Into<String>, query: Query) -> Ticket<Vec<Record>> {
        let entity = entity.into();
        self.submit(WorkKind::Query, |reply| Job::Query {
            entity,
            query,
            reply,
        })
    }

    pub fn is_duplicate(&self, record: Record) -> Ticket<bool> {
        self.submit(WorkKind::Query, |reply| Job::Duplicate { record, reply })
    }

    pub fn fetch(&self, spec: EntitySpec, request: FetchRequest, route: FetchRoute) -> Ticket<FetchReport> {
        let kind = match route {
            FetchRoute::Single => WorkKind::FetchSingle,
            FetchRoute::Collection => WorkKind::FetchCollection,
        };
        self.submit(kind, |reply| Job::Fetch {
            spec,
            request,
            route,
            reply,
        })
    }

    pub fn fetch_raw(&self, request: FetchRequest) -> Ticket<ParseTree> {
        self.submit(WorkKind::FetchRaw, |reply| Job::FetchRaw { request, reply })
    }

    pub fn clear(&self) -> Ticket<u64> {
        self.submit(WorkKind::Clear, |reply| Job::Clear { reply })
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Discards queued work and refuses new work. The in-flight item finishes.
    pub fn stop_operations(&self) {
        if !self.state.stopped.swap(true, Ordering::AcqRel) {
            info!(queue = %self.name, pending = self.pending(), "Stopping queued operations");
        }
    }

    fn inside_own_worker(&self) -> bool {
        CURRENT_QUEUE.try_with(|id| *id == self.id).unwrap_or(false)
    }

    fn check_not_reentrant(&self) -> SyncResult<()> {
        if self.inside_own_worker() {
            return Err(SyncError::Programmer(format!(
                "wait() called from inside work queue '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Resolves once every item submitted so far has finished or been discarded.
    ///
    /// ## Returns
    /// * `Err(Programmer)` - called from inside one of this queue's own items
    pub async fn wait(&self) -> SyncResult<()> {
        self.check_not_reentrant()?;
        let mut outstanding = self.state.outstanding.subscribe();
        outstanding
            .wait_for(|n| *n == 0)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::ChannelError("queue state dropped".into()))
    }

    /// Blocking form of [`wait`](Self::wait).
    ///
    /// Parks the calling thread. On a multi-thread runtime's worker the
    /// thread's queued tasks are handed to another worker first
    /// (`block_in_place`), so the queue keeps draining.
    ///
    /// ## Returns
    /// * `Err(Programmer)` - called from inside one of this queue's own items,
    ///   or from a current-thread runtime, whose only thread runs the worker
    pub fn wait_blocking(&self) -> SyncResult<()> {
        self.check_not_reentrant()?;

        let Ok(runtime) = Handle::try_current() else {
            return futures::executor::block_on(self.wait());
        };
        match runtime.runtime_flavor() {
            RuntimeFlavor::CurrentThread => Err(SyncError::Programmer(format!(
                "wait_blocking() on a current-thread runtime would deadlock work queue '{}'; await wait() instead",
                self.name
            ))),
            _ => tokio::task::block_in_place(|| futures::executor::block_on(self.wait())),
        }
    }

    /// Stops the worker after the item it is running. Anything still queued
    /// resolves with `Cancelled`.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .field("pending", &self.pending())
            .finish()
    }
}

/// First record of a single-record save.
pub(crate) fn first(mut records: Vec<Record>) -> SyncResult<Record> {
    if records.is_empty() {
        return Err(SyncError::Internal("save returned no record".into()));
    }
    Ok(records.swap_remove(0))
}
