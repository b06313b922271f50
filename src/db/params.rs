//! Parameter handling shared by all drivers.
//!
//! - `:name` placeholders are rewritten to the vendor's positional syntax with a
//!   tokenizing regex, so `:id` never matches inside `:identifier`, string
//!   literals or PostgreSQL `::type` casts.
//! - `QueryParam` values are bound to sqlx queries per vendor.
//! - Procedure and argument names are validated and quoted per vendor.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, QueryParams};
use regex::Regex;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};
use std::sync::LazyLock;

/// String literals and `::` pass through; `:name` is captured.
static NAMED_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'(?:[^']|'')*'|::|:([A-Za-z_][A-Za-z0-9_]*)").expect("named parameter regex")
});

/// An identifier, optionally schema-qualified.
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("identifier regex")
});

/// Positional placeholder syntax of a vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` (MySQL, SQLite); one value per occurrence
    Question,
    /// `$1, $2, ...` (PostgreSQL); a repeated name reuses its index
    Dollar,
    /// `@P1, @P2, ...` (SQL Server); a repeated name reuses its index
    AtP,
}

impl PlaceholderStyle {
    pub fn for_database(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::MySQL | DatabaseType::SQLite => Self::Question,
            DatabaseType::PostgreSQL => Self::Dollar,
            DatabaseType::MSSQL => Self::AtP,
        }
    }

    /// Placeholder for the 1-based position `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Question => "?".to_string(),
            Self::Dollar => format!("${}", n),
            Self::AtP => format!("@P{}", n),
        }
    }
}

/// Rewrite `sql` and flatten `params` into the vendor's positional form.
///
/// Positional parameters are passed through untouched; the caller already
/// wrote native placeholders.
pub fn prepare_statement(
    sql: &str,
    params: &QueryParams,
    style: PlaceholderStyle,
) -> DbResult<(String, Vec<QueryParam>)> {
    match params {
        QueryParams::None => Ok((sql.to_string(), Vec::new())),
        QueryParams::Positional(values) => Ok((sql.to_string(), values.clone())),
        QueryParams::Named(named) => {
            let mut values: Vec<QueryParam> = Vec::new();
            let mut indexes: Vec<(String, usize)> = Vec::new();
            let mut missing: Option<String> = None;

            let rewritten = NAMED_PARAM.replace_all(sql, |caps: &regex::Captures<'_>| {
                let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                    return caps[0].to_string();
                };
                let Some(value) = named.get(name) else {
                    missing.get_or_insert_with(|| name.to_string());
                    return caps[0].to_string();
                };

                if style != PlaceholderStyle::Question {
                    if let Some((_, idx)) = indexes.iter().find(|(n, _)| n == name) {
                        return style.placeholder(*idx);
                    }
                }
                values.push(value.clone());
                indexes.push((name.to_string(), values.len()));
                style.placeholder(values.len())
            });

            if let Some(name) = missing {
                return Err(DbError::validation(format!(
                    "Missing value for named parameter ':{}'",
                    name
                )));
            }
            Ok((rewritten.into_owned(), values))
        }
    }
}

/// Check that a caller-supplied procedure or argument name is a plain identifier.
pub fn validate_identifier(kind: &str, name: &str) -> DbResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(DbError::validation(format!(
            "Invalid {} name '{}': only letters, digits and underscores are allowed",
            kind, name
        )))
    }
}

/// Quote a validated (optionally schema-qualified) identifier for a vendor.
pub fn quote_identifier(db_type: DatabaseType, name: &str) -> String {
    name.split('.')
        .map(|part| match db_type {
            DatabaseType::MySQL => format!("`{}`", part),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => format!("\"{}\"", part),
            DatabaseType::MSSQL => format!("[{}]", part),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

/// Bind a parameter to a SQL Server query.
pub(crate) fn bind_mssql_param<'a>(query: &mut tiberius::Query<'a>, param: &'a QueryParam) {
    match param {
        QueryParam::Null => query.bind(Option::<&str>::None),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(pairs: &[(&str, QueryParam)]) -> QueryParams {
        QueryParams::named(pairs.iter().cloned())
    }

    #[test]
    fn test_rewrite_single_named_param() {
        let (sql, values) = prepare_statement(
            "SELECT * FROM t WHERE id = :id",
            &named(&[("id", QueryParam::Int(5))]),
            PlaceholderStyle::Question,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id = ?");
        assert_eq!(values, vec![QueryParam::Int(5)]);
    }

    #[test]
    fn test_rewrite_whole_token_only() {
        let params = named(&[
            ("id", QueryParam::Int(1)),
            ("identifier", QueryParam::from("abc")),
        ]);
        let (sql, values) = prepare_statement(
            "SELECT * FROM t WHERE identifier = :identifier AND id = :id",
            &params,
            PlaceholderStyle::Dollar,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE identifier = $1 AND id = $2");
        assert_eq!(values, vec![QueryParam::from("abc"), QueryParam::Int(1)]);
    }

    #[test]
    fn test_rewrite_repeated_name() {
        let params = named(&[("v", QueryParam::Int(3))]);

        let (sql, values) =
            prepare_statement("SELECT :v + :v", &params, PlaceholderStyle::Question).unwrap();
        assert_eq!(sql, "SELECT ? + ?");
        assert_eq!(values.len(), 2);

        let (sql, values) =
            prepare_statement("SELECT :v + :v", &params, PlaceholderStyle::AtP).unwrap();
        assert_eq!(sql, "SELECT @P1 + @P1");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_rewrite_skips_literals_and_casts() {
        let params = named(&[("id", QueryParam::Int(1))]);
        let (sql, values) = prepare_statement(
            "SELECT ':id', 'it''s :id', created::date FROM t WHERE id = :id",
            &params,
            PlaceholderStyle::Dollar,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT ':id', 'it''s :id', created::date FROM t WHERE id = $1"
        );
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_rewrite_missing_param_is_validation_error() {
        let err = prepare_statement(
            "SELECT * FROM t WHERE id = :id",
            &named(&[]),
            PlaceholderStyle::Question,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
        assert!(err.to_string().contains(":id"));
    }

    #[test]
    fn test_positional_passthrough() {
        let params = QueryParams::positional([QueryParam::Int(1)]);
        let (sql, values) =
            prepare_statement("SELECT $1", &params, PlaceholderStyle::Dollar).unwrap();
        assert_eq!(sql, "SELECT $1");
        assert_eq!(values, vec![QueryParam::Int(1)]);
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("procedure", "get_orders").is_ok());
        assert!(validate_identifier("procedure", "dbo.get_orders").is_ok());
        assert!(validate_identifier("procedure", "get orders").is_err());
        assert!(validate_identifier("procedure", "x; DROP TABLE t").is_err());
        assert!(validate_identifier("procedure", "a.b.c").is_err());
        assert!(validate_identifier("parameter", "1abc").is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier(DatabaseType::MySQL, "p"), "`p`");
        assert_eq!(
            quote_identifier(DatabaseType::PostgreSQL, "public.p"),
            "\"public\".\"p\""
        );
        assert_eq!(quote_identifier(DatabaseType::MSSQL, "dbo.p"), "[dbo].[p]");
    }
}
