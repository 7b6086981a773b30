//! # tether-core: Pure Record Model for Tether
//!
//! This crate holds the types every other tether crate speaks in. It has
//! zero I/O dependencies: no database, no network, no file system.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tether Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            tether-sync (queue, dedup, fetch, facade)            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                tether-db (SQLite store adapter)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tether-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  record   │  │  entity   │  │   query   │  │   merge   │  │   │
//! │  │   │  Record   │  │Persistable│  │ Predicate │  │  field    │  │   │
//! │  │   │ field bag │  │  Entity   │  │  SortKey  │  │  LWW      │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - `Record`, the untyped field bag with identity and dirty state
//! - [`entity`] - `PersistableEntity` trait and `EntitySpec`
//! - [`query`] - `Predicate`, `SortKey`, `Query`
//! - [`merge`] - Field-level merge used by the upsert engine
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use tether_core::{PersistableEntity, Predicate, Query, SortKey};
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
//! assert_eq!(Article::entity_name(), "Article");
//! assert_eq!(Article::primary_key(), "objID");
//!
//! let record = Article { id: 7, title: "Hello".into() }.to_record().unwrap();
//! assert!(record.is_new());
//!
//! let query = Query::filter(Predicate::contains("title", "Hel"))
//!     .sort_by(SortKey::descending("objID"))
//!     .limit(10);
//! assert_eq!(query.limit, Some(10));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod entity;
pub mod error;
pub mod merge;
pub mod query;
pub mod record;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use entity::{EntitySpec, PersistableEntity};
pub use error::{CoreError, CoreResult};
pub use merge::merge_fields;
pub use query::{Comparison, Predicate, Query, SortDirection, SortKey};
pub use record::{FieldMap, ParseTree, Record};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Field used for identity comparison when an entity does not override it.
pub const DEFAULT_PRIMARY_KEY: &str = "objID";
