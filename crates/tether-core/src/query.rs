//! # Query Model
//!
//! Search criteria, sort ordering and result limits for `all` / `find`.
//! This module only *describes* a query; `tether-db` compiles it to SQL.
//!
//! ```text
//! Query
//! ├── predicate: Option<Predicate>   None = every record of the entity
//! ├── sort:      Vec<SortKey>        applied in order, ties by insertion
//! └── limit:     Option<u32>         None = unbounded
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Comparison operator for [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Structured search criterion over record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        field: String,
        op: Comparison,
        value: Value,
    },
    /// Substring match (ASCII case-insensitive).
    Contains { field: String, needle: String },
    BeginsWith { field: String, prefix: String },
    In { field: String, values: Vec<Value> },
    /// Field absent or JSON null.
    IsNull(String),
    NotNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(field: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Ge, value)
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Predicate::Contains {
            field: field.into(),
            needle: needle.into(),
        }
    }

    pub fn begins_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Predicate::BeginsWith {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    pub fn one_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull(field.into())
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Predicate::NotNull(field.into())
    }

    /// Combines with another predicate; nested `And`s are flattened.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut items) => {
                items.push(other);
                Predicate::And(items)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Combines with another predicate; nested `Or`s are flattened.
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut items) => {
                items.push(other);
                Predicate::Or(items)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Every field name referenced by this predicate, depth first.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { field, .. }
            | Predicate::Contains { field, .. }
            | Predicate::BeginsWith { field, .. }
            | Predicate::In { field, .. }
            | Predicate::IsNull(field)
            | Predicate::NotNull(field) => out.push(field),
            Predicate::And(items) | Predicate::Or(items) => {
                for item in items {
                    item.collect_fields(out);
                }
            }
            Predicate::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Rejects field names the store cannot address.
    pub fn validate(&self) -> CoreResult<()> {
        self.fields().into_iter().try_for_each(validate_field)
    }
}

/// Field names must be non-empty and free of double quotes.
pub fn validate_field(field: &str) -> CoreResult<()> {
    if field.is_empty() {
        return Err(CoreError::InvalidField {
            field: field.to_string(),
            reason: "field name is empty".into(),
        });
    }
    if field.contains('"') {
        return Err(CoreError::InvalidField {
            field: field.to_string(),
            reason: "field name contains a double quote".into(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// One sort key. A query applies its keys in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn ascending(field: impl Into<String>) -> Self {
        SortKey {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        SortKey {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Search criterion, sort ordering and limit for one read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub predicate: Option<Predicate>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    pub limit: Option<u32>,
}

impl Query {
    /// Every record of the entity, in insertion order.
    pub fn all() -> Self {
        Query::default()
    }

    pub fn filter(predicate: Predicate) -> Self {
        Query {
            predicate: Some(predicate),
            ..Query::default()
        }
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn sorted(mut self, keys: impl IntoIterator<Item = SortKey>) -> Self {
        self.sort.extend(keys);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if let Some(predicate) = &self.predicate {
            predicate.validate()?;
        }
        self.sort
            .iter()
            .try_for_each(|key| validate_field(&key.field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_and_flattens() {
        let p = Predicate::eq("a", 1)
            .and(Predicate::eq("b", 2))
            .and(Predicate::eq("c", 3));

        match p {
            Predicate::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_fields_collects_nested() {
        let p = Predicate::eq("name", "A")
            .or(Predicate::gt("age", 5).negate())
            .and(Predicate::one_of("tag", ["x", "y"]));

        assert_eq!(p.fields(), vec!["name", "age", "tag"]);
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        assert!(Predicate::eq("name", json!("A")).validate().is_ok());
        assert!(Predicate::eq("", 1).validate().is_err());
        assert!(Predicate::is_null("bad\"name").validate().is_err());

        let query = Query::all().sort_by(SortKey::ascending(""));
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_query_builder() {
        let query = Query::filter(Predicate::not_null("title"))
            .sorted([SortKey::descending("rank"), SortKey::ascending("title")])
            .limit(5);

        assert_eq!(query.sort.len(), 2);
        assert_eq!(query.sort[0].direction, SortDirection::Descending);
        assert_eq!(query.limit, Some(5));
        assert_eq!(Query::all().limit, None);
    }
}
