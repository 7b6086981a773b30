//! # tether-db: Store Adapter for Tether
//!
//! Persists [`tether_core::Record`]s in embedded SQLite through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tether Data Flow                                 │
//! │                                                                         │
//! │  Work Queue item / Direct call (tether-sync)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tether-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │ StoreSession  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │ (session.rs)  │    │  (embedded)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ SqlitePool    │───►│ one tx per    │    │ 001_records  │  │   │
//! │  │   │ QueueClaim    │    │ work item     │    │              │  │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │                                │ sql.rs: Predicate → SQL       │   │
//! │  └────────────────────────────────┼────────────────────────────────┘   │
//! │                                   ▼                                     │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   SQLite: records(entity, primary_key, fields JSON, ...)        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - `Database`, `DbConfig`, queue claim guard
//! - [`session`] - `StoreSession`, the transactional record operations
//! - [`sql`] - Predicate and sort compilation
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_db::{Database, DbConfig};
//! use tether_core::Query;
//!
//! let db = Database::new(DbConfig::in_memory()).await?;
//!
//! let mut session = db.begin().await?;
//! let articles = session.query("Article", &Query::all()).await?;
//! session.commit().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod session;
pub mod sql;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig, QueueClaim};
pub use session::StoreSession;
