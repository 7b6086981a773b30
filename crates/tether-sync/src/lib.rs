//! # tether-sync: Work Queue, Fetch Pipeline and Facade for Tether
//!
//! Everything that decides *when* and *how* records reach the store:
//! the serialized work queue, the dedup/upsert engine, the network fetch
//! pipeline and the queued/direct API applications call.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Ledger (facade)                                │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Model<E>  (queued → Ticket<T>)      Direct<E>  (inline async)    │  │
//! │  └───────────────┬──────────────────────────────────┬───────────────┘  │
//! │                  ▼                                  │                   │
//! │  ┌────────────────────────────┐                     │                   │
//! │  │ WorkQueue / QueueWorker    │                     │                   │
//! │  │ one tokio task, FIFO,      │                     │                   │
//! │  │ stop_operations / wait     │                     │                   │
//! │  └───────────────┬────────────┘                     │                   │
//! │                  ▼                                  ▼                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ operations: query · save · destroy · fetch · fetch_raw · clear   │  │
//! │  └───────┬──────────────────────────────┬───────────────────────────┘  │
//! │          ▼                              ▼                               │
//! │  ┌────────────────┐            ┌────────────────────────────────────┐  │
//! │  │ dedup          │            │ fetch                              │  │
//! │  │ insert / merge │            │ Transport → Decoder → parse fn →   │  │
//! │  │ by primary key │            │ map_single / map_collection        │  │
//! │  └───────┬────────┘            └────────────────────────────────────┘  │
//! │          ▼                                                              │
//! │  tether-db StoreSession (one transaction per work item)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`ledger`] - `Ledger`, `Model`, `Direct`
//! - [`queue`] - `WorkQueue`, `QueueWorker`, `Ticket`
//! - [`operations`] - The work each queued or direct call performs
//! - [`dedup`] - Insert-or-merge by primary key
//! - [`fetch`] - Transport, decoding and entity mapping
//! - [`config`] - `TetherConfig` (TOML + environment)
//! - [`error`] - `SyncError`

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod operations;
pub mod queue;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::TetherConfig;
pub use dedup::UpsertMode;
pub use error::{SyncError, SyncResult};
pub use fetch::{
    Decoder, FetchReport, FetchRequest, FetchRoute, Fetcher, HttpTransport, JsonDecoder, ParseFn,
    Transport,
};
pub use ledger::{Direct, Ledger, Model};
pub use queue::{QueueWorker, Ticket, WorkKind, WorkQueue};
