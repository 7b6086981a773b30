//! # Predicate Compilation
//!
//! Turns [`Predicate`] and [`SortKey`] descriptions into SQL over the
//! `records.fields` JSON column. Every field path and value is bound as a
//! parameter; only operators and parentheses are pushed as SQL text.
//!
//! ```text
//! Predicate::eq("name", "A").and(Predicate::gt("age", 5))
//!
//!   (json_extract(fields, ?) = ? AND json_extract(fields, ?) > ?)
//!    binds: $."name", "A", $."age", 5
//! ```
//!
//! ## Value Semantics
//! - strings bind as TEXT, integers as INTEGER, other numbers as REAL
//! - booleans bind as 0 / 1, which is what `json_extract` yields for them
//! - arrays and objects compare against their compact JSON text
//! - `eq(field, null)` / `ne(field, null)` become `IS NULL` / `IS NOT NULL`
//! - `Contains` and `BeginsWith` use LIKE (ASCII case-insensitive)

use serde_json::{Number, Value};
use sqlx::{QueryBuilder, Sqlite};

use tether_core::query::validate_field;
use tether_core::{Comparison, Predicate, SortDirection, SortKey};

use crate::error::DbResult;

/// Canonical text form of a primary-key value, or `None` for JSON null.
///
/// Keys compare by their compact JSON text, so `1` and `"1"` are different keys.
/// Integral floats are written as integers first, so `1.0` and `1` are one key.
pub fn canonical_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Number(number) => Some(canonical_number(number)),
        other => Some(other.to_string()),
    }
}

/// Largest magnitude below which every integral `f64` is exact as `i64`.
const EXACT_INTEGRAL_F64: f64 = 9_007_199_254_740_992.0;

fn canonical_number(number: &Number) -> String {
    match number.as_f64() {
        Some(f) if number.is_f64() && f.fract() == 0.0 && f.abs() < EXACT_INTEGRAL_F64 => {
            (f as i64).to_string()
        }
        _ => number.to_string(),
    }
}

/// `name` → `$."name"`, the JSON path used by `json_extract`.
pub fn json_path(field: &str) -> DbResult<String> {
    validate_field(field)?;
    Ok(format!("$.\"{}\"", field))
}

/// Escapes LIKE wildcards so user text matches literally under `ESCAPE '\'`.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn push_extract(builder: &mut QueryBuilder<'_, Sqlite>, field: &str) -> DbResult<()> {
    builder.push("json_extract(fields, ");
    builder.push_bind(json_path(field)?);
    builder.push(")");
    Ok(())
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            builder.push("NULL");
        }
        Value::Bool(flag) => {
            builder.push_bind(*flag);
        }
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                builder.push_bind(int);
            } else if let Some(float) = number.as_f64() {
                builder.push_bind(float);
            } else {
                builder.push_bind(number.to_string());
            }
        }
        Value::String(text) => {
            builder.push_bind(text.clone());
        }
        other => {
            builder.push_bind(other.to_string());
        }
    }
}

fn operator(op: Comparison) -> &'static str {
    match op {
        Comparison::Eq => " = ",
        Comparison::Ne => " != ",
        Comparison::Lt => " < ",
        Comparison::Le => " <= ",
        Comparison::Gt => " > ",
        Comparison::Ge => " >= ",
    }
}

fn push_like(builder: &mut QueryBuilder<'_, Sqlite>, field: &str, pattern: String) -> DbResult<()> {
    push_extract(builder, field)?;
    builder.push(" LIKE ");
    builder.push_bind(pattern);
    builder.push(" ESCAPE '\\'");
    Ok(())
}

fn push_joined(
    builder: &mut QueryBuilder<'_, Sqlite>,
    items: &[Predicate],
    joiner: &str,
    empty: &str,
) -> DbResult<()> {
    if items.is_empty() {
        builder.push(empty);
        return Ok(());
    }
    builder.push("(");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            builder.push(joiner);
        }
        push_predicate(builder, item)?;
    }
    builder.push(")");
    Ok(())
}

/// Appends a boolean SQL expression for `predicate`.
pub fn push_predicate(builder: &mut QueryBuilder<'_, Sqlite>, predicate: &Predicate) -> DbResult<()> {
    match predicate {
        Predicate::Compare { field, op, value } => {
            if value.is_null() {
                match op {
                    Comparison::Eq => {
                        push_extract(builder, field)?;
                        builder.push(" IS NULL");
                    }
                    Comparison::Ne => {
                        push_extract(builder, field)?;
                        builder.push(" IS NOT NULL");
                    }
                    // Ordering against null never matches.
                    _ => {
                        builder.push("0");
                    }
                }
            } else {
                push_extract(builder, field)?;
                builder.push(operator(*op));
                push_value(builder, value);
            }
        }
        Predicate::Contains { field, needle } => {
            push_like(builder, field, format!("%{}%", escape_like(needle)))?;
        }
        Predicate::BeginsWith { field, prefix } => {
            push_like(builder, field, format!("{}%", escape_like(prefix)))?;
        }
        Predicate::In { field, values } => {
            if values.is_empty() {
                builder.push("0");
            } else {
                push_extract(builder, field)?;
                builder.push(" IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    push_value(builder, value);
                }
                builder.push(")");
            }
        }
        Predicate::IsNull(field) => {
            push_extract(builder, field)?;
            builder.push(" IS NULL");
        }
        Predicate::NotNull(field) => {
            push_extract(builder, field)?;
            builder.push(" IS NOT NULL");
        }
        Predicate::And(items) => push_joined(builder, items, " AND ", "1")?,
        Predicate::Or(items) => push_joined(builder, items, " OR ", "0")?,
        Predicate::Not(inner) => {
            builder.push("NOT (");
            push_predicate(builder, inner)?;
            builder.push(")");
        }
    }
    Ok(())
}

/// Appends `ORDER BY`; insertion order (`id`) breaks ties.
pub fn push_order(builder: &mut QueryBuilder<'_, Sqlite>, sort: &[SortKey]) -> DbResult<()> {
    builder.push(" ORDER BY ");
    for key in sort {
        push_extract(builder, &key.field)?;
        builder.push(match key.direction {
            SortDirection::Ascending => " ASC, ",
            SortDirection::Descending => " DESC, ",
        });
    }
    builder.push("id ASC");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(predicate: &Predicate) -> String {
        let mut builder = QueryBuilder::<Sqlite>::new("");
        push_predicate(&mut builder, predicate).unwrap();
        builder.sql().to_string()
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key(&json!(1)), Some("1".to_string()));
        assert_eq!(canonical_key(&json!("1")), Some("\"1\"".to_string()));
        assert_eq!(canonical_key(&Value::Null), None);
    }

    #[test]
    fn test_canonical_key_folds_integral_floats() {
        assert_eq!(canonical_key(&json!(1.0)), canonical_key(&json!(1)));
        assert_eq!(canonical_key(&json!(-42.0)), Some("-42".to_string()));
        assert_eq!(canonical_key(&json!(-0.0)), Some("0".to_string()));
        assert_eq!(canonical_key(&json!(1.5)), Some("1.5".to_string()));
        assert_eq!(canonical_key(&json!(1e300)), Some(json!(1e300).to_string()));
    }

    #[test]
    fn test_json_path() {
        assert_eq!(json_path("objID").unwrap(), "$.\"objID\"");
        assert!(json_path("").is_err());
        assert!(json_path("a\"b").is_err());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn test_compare_compiles_to_bound_params() {
        let sql = compile(&Predicate::eq("name", "A").and(Predicate::gt("age", 5)));
        assert_eq!(
            sql,
            "(json_extract(fields, ?) = ? AND json_extract(fields, ?) > ?)"
        );
    }

    #[test]
    fn test_null_comparisons() {
        assert_eq!(
            compile(&Predicate::eq("a", Value::Null)),
            "json_extract(fields, ?) IS NULL"
        );
        assert_eq!(
            compile(&Predicate::ne("a", Value::Null)),
            "json_extract(fields, ?) IS NOT NULL"
        );
        assert_eq!(compile(&Predicate::lt("a", Value::Null)), "0");
    }

    #[test]
    fn test_empty_groups() {
        assert_eq!(compile(&Predicate::And(vec![])), "1");
        assert_eq!(compile(&Predicate::Or(vec![])), "0");
        assert_eq!(compile(&Predicate::one_of("a", Vec::<Value>::new())), "0");
    }

    #[test]
    fn test_in_and_not() {
        let sql = compile(&Predicate::one_of("tag", ["x", "y"]).negate());
        assert_eq!(sql, "NOT (json_extract(fields, ?) IN (?, ?))");
    }

    #[test]
    fn test_order_appends_id_tiebreak() {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT id FROM records");
        push_order(&mut builder, &[SortKey::descending("rank")]).unwrap();
        assert_eq!(
            builder.sql(),
            "SELECT id FROM records ORDER BY json_extract(fields, ?) DESC, id ASC"
        );
    }
}
