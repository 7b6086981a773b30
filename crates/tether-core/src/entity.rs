//! # Persistable Entities
//!
//! Attaches record behavior to a Rust type through a trait instead of a base
//! class. The trait only describes naming and field mapping; every storage or
//! network operation lives in `tether-sync` and works on [`Record`]s.
//!
//! ## Defaults
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  entity_name()           short type name   (my_app::Article → Article) │
//! │  primary_key()           "objID"                                       │
//! │  requires_primary_key()  false                                         │
//! │  to_fields / from_record serde_json round trip                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::record::{value_kind, FieldMap, Record};
use crate::DEFAULT_PRIMARY_KEY;

/// A Rust type whose instances can be stored as [`Record`]s.
///
/// ## Usage
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use tether_core::PersistableEntity;
///
/// #[derive(Serialize, Deserialize)]
/// struct Comment {
///     uuid: String,
///     body: String,
/// }
///
/// impl PersistableEntity for Comment {
///     fn entity_name() -> String {
///         "comments".to_string()
///     }
///
///     fn primary_key() -> &'static str {
///         "uuid"
///     }
/// }
///
/// let record = Comment::new_object();
/// assert_eq!(record.entity(), "comments");
/// assert_eq!(record.primary_key_field(), "uuid");
/// ```
pub trait PersistableEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection name. Defaults to the type name.
    fn entity_name() -> String {
        short_type_name(std::any::type_name::<Self>()).to_string()
    }

    /// Field used for dedup.
    fn primary_key() -> &'static str {
        DEFAULT_PRIMARY_KEY
    }

    /// When true, records without a primary key are rejected instead of inserted.
    fn requires_primary_key() -> bool {
        false
    }

    fn to_fields(&self) -> CoreResult<FieldMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(CoreError::NotAnObject {
                entity: Self::entity_name(),
                found: value_kind(&other).to_string(),
            }),
        }
    }

    fn from_record(record: &Record) -> CoreResult<Self> {
        serde_json::from_value(Value::Object(record.fields().clone())).map_err(|e| {
            CoreError::mapping(Self::entity_name(), e.to_string())
        })
    }

    /// Creates an empty record of this entity. Not stored until saved.
    fn new_object() -> Record {
        EntitySpec::of::<Self>().new_record()
    }

    /// Creates a record pre-populated from a field mapping. Not stored until saved.
    fn new_object_with(fields: FieldMap) -> Record {
        Self::new_object().with_fields(fields)
    }

    /// Converts this value into a new, unsaved record.
    fn to_record(&self) -> CoreResult<Record> {
        Ok(Self::new_object_with(self.to_fields()?))
    }
}

/// Runtime description of an entity collection.
///
/// Built from a [`PersistableEntity`] type, or by hand for collections that
/// have no Rust type (e.g. the `tether-fetch` binary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpec {
    pub name: String,
    pub primary_key: String,
    pub requires_primary_key: bool,
}

impl EntitySpec {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        EntitySpec {
            name: name.into(),
            primary_key: primary_key.into(),
            requires_primary_key: false,
        }
    }

    pub fn of<E: PersistableEntity>() -> Self {
        EntitySpec {
            name: E::entity_name(),
            primary_key: E::primary_key().to_string(),
            requires_primary_key: E::requires_primary_key(),
        }
    }

    pub fn requiring_primary_key(mut self, required: bool) -> Self {
        self.requires_primary_key = required;
        self
    }

    pub fn new_record(&self) -> Record {
        Record::new(&self.name, &self.primary_key)
    }

    pub fn new_record_with(&self, fields: FieldMap) -> Record {
        self.new_record().with_fields(fields)
    }

    /// Checks that a record belongs to this collection and carries a key if one is required.
    pub fn check(&self, record: &Record) -> CoreResult<()> {
        if record.entity() != self.name {
            return Err(CoreError::mapping(
                &self.name,
                format!("record belongs to '{}'", record.entity()),
            ));
        }
        if self.requires_primary_key && record.primary_key().is_none() {
            return Err(CoreError::MissingPrimaryKey {
                entity: self.name.clone(),
                field: self.primary_key.clone(),
            });
        }
        Ok(())
    }
}

/// `my_crate::models::Article` → `Article`, `Wrapper<a::B>` → `Wrapper`.
fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
