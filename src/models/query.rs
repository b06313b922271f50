//! Query-related data models.
//!
//! This module defines parameter values, result rows and the inputs for
//! transactions and stored procedure calls.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// One result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Objects and arrays, bound as the vendor's JSON type (or JSON text)
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }

    /// Convert a JSON value into the closest parameter type.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Parameters for an ad-hoc statement.
///
/// Named parameters are referenced as `:name` in the SQL and rewritten to the
/// vendor's placeholder syntax before execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryParams {
    #[default]
    None,
    Positional(Vec<QueryParam>),
    Named(HashMap<String, QueryParam>),
}

impl QueryParams {
    pub fn positional(params: impl IntoIterator<Item = QueryParam>) -> Self {
        Self::Positional(params.into_iter().collect())
    }

    pub fn named<K: Into<String>>(params: impl IntoIterator<Item = (K, QueryParam)>) -> Self {
        Self::Named(params.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build from a JSON array (positional) or object (named).
    pub fn from_json(value: &JsonValue) -> DbResult<Self> {
        match value {
            JsonValue::Null => Ok(Self::None),
            JsonValue::Array(items) => Ok(Self::Positional(
                items.iter().map(QueryParam::from_json).collect(),
            )),
            JsonValue::Object(map) => Ok(Self::Named(
                map.iter()
                    .map(|(k, v)| (k.clone(), QueryParam::from_json(v)))
                    .collect(),
            )),
            other => Err(DbError::validation(format!(
                "Query parameters must be an array or an object, got {}",
                other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(p) => p.is_empty(),
            Self::Named(p) => p.is_empty(),
        }
    }
}

/// One named argument of a stored procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureParam {
    pub name: String,
    pub value: QueryParam,
}

/// Ordered procedure arguments. Order is the caller's key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcedureParams(pub Vec<ProcedureParam>);

impl ProcedureParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.0.push(ProcedureParam {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Build from a JSON object, keeping key order.
    pub fn from_json_map(map: &serde_json::Map<String, JsonValue>) -> Self {
        Self(
            map.iter()
                .map(|(k, v)| ProcedureParam {
                    name: k.clone(),
                    value: QueryParam::from_json(v),
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcedureParam> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values in call order, applying the legacy null coercion if requested.
    pub fn bound_values(&self, options: &ProcedureOptions) -> Vec<QueryParam> {
        self.0
            .iter()
            .map(|p| match &p.value {
                QueryParam::Null if options.legacy_null_as_empty => {
                    QueryParam::String(String::new())
                }
                v => v.clone(),
            })
            .collect()
    }
}

/// Per-call options for stored procedure execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcedureOptions {
    /// Legacy client compatibility: bind null arguments as empty strings.
    /// Off unless a caller opts in.
    pub legacy_null_as_empty: bool,
}

/// One statement inside a transaction.
#[derive(Debug, Clone)]
pub struct TransactionOperation {
    pub sql: String,
    pub params: QueryParams,
}

impl TransactionOperation {
    pub fn new(sql: impl Into<String>, params: QueryParams) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn from_rows(columns: Vec<ColumnMetadata>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms,
        }
    }

    /// Create a result for write operations (INSERT/UPDATE/DELETE).
    pub fn write_result(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
            execution_time_ms,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rows_affected.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
    }

    #[test]
    fn test_query_param_from_json() {
        assert_eq!(QueryParam::from_json(&json!(5)), QueryParam::Int(5));
        assert_eq!(QueryParam::from_json(&json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(QueryParam::from_json(&json!(null)), QueryParam::Null);
        assert_eq!(
            QueryParam::from_json(&json!({"a": 1})),
            QueryParam::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_query_params_from_json() {
        let p = QueryParams::from_json(&json!([1, "x"])).unwrap();
        assert_eq!(
            p,
            QueryParams::positional([QueryParam::Int(1), QueryParam::from("x")])
        );
        let p = QueryParams::from_json(&json!({"id": 5})).unwrap();
        assert_eq!(p, QueryParams::named([("id", QueryParam::Int(5))]));
        assert!(QueryParams::from_json(&json!("nope")).is_err());
        assert!(QueryParams::from_json(&json!(null)).unwrap().is_empty());
    }

    #[test]
    fn test_procedure_params_keep_key_order() {
        let map = json!({"zeta": 1, "alpha": 2, "mid": 3});
        let params = ProcedureParams::from_json_map(map.as_object().unwrap());
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_legacy_null_coercion_is_opt_in() {
        let params = ProcedureParams::new()
            .with("a", QueryParam::Null)
            .with("b", 7i64);

        let strict = params.bound_values(&ProcedureOptions::default());
        assert_eq!(strict, vec![QueryParam::Null, QueryParam::Int(7)]);

        let legacy = params.bound_values(&ProcedureOptions {
            legacy_null_as_empty: true,
        });
        assert_eq!(
            legacy,
            vec![QueryParam::String(String::new()), QueryParam::Int(7)]
        );
    }

    #[test]
    fn test_query_result_write() {
        let result = QueryResult::write_result(5, 20);
        assert!(!result.is_empty());
        assert_eq!(result.rows_affected, Some(5));
        assert!(QueryResult::default().is_empty());
    }
}
