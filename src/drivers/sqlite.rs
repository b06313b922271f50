//! SQLite driver.
//!
//! The configured database is a file path (or `:memory:`). SQLite has no
//! stored procedures; attached databases are addressed as schemas.

use super::{DatabaseDriver, DriverContext, bounded, connect_error, elapsed_ms, returns_rows};
use crate::db::params::bind_sqlite_param;
use crate::db::types::normalize_type_name;
use crate::db::{
    DbPool, PlaceholderStyle, RowToJson, prepare_statement, quote_identifier, validate_identifier,
};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDescriptor, ConnectionConfig, DatabaseObjectDescriptor, DatabaseType, ObjectCategory,
    ProcedureOptions, ProcedureParams, QueryParam, QueryParams, QueryResult, Row,
    TransactionOperation,
};
use async_trait::async_trait;
use regex::Regex;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MEMORY_DATABASE: &str = ":memory:";

/// `VARCHAR(255)` or `DECIMAL(10, 2)`
static TYPE_MODIFIERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([^(]+?)\s*\(\s*(\d+)\s*(?:,\s*(\d+)\s*)?\)").expect("type modifier regex")
});

type ColumnRow = (i64, String, String, i64, Option<String>);

#[derive(Debug)]
pub struct SqliteDriver {
    config: ConnectionConfig,
    context: DriverContext,
}

impl SqliteDriver {
    pub fn new(config: ConnectionConfig, context: DriverContext) -> Self {
        Self { config, context }
    }

    fn connect_options(&self, database: Option<&str>) -> DbResult<SqliteConnectOptions> {
        let path = database
            .or(self.config.database.as_deref())
            .unwrap_or(MEMORY_DATABASE);
        if path == MEMORY_DATABASE {
            return SqliteConnectOptions::from_str("sqlite::memory:").map_err(DbError::from);
        }
        Ok(SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true))
    }

    fn query_timeout(&self) -> Duration {
        self.context.query_timeout_for(&self.config)
    }
}

fn sqlite_pool(pool: &DbPool) -> DbResult<&SqlitePool> {
    match pool {
        DbPool::SQLite(p) => Ok(p),
        other => Err(DbError::internal(format!(
            "SQLite driver was handed a {} pool",
            other.db_type()
        ))),
    }
}

/// Schema prefix for catalog queries: `main` unless an attached schema is named.
fn catalog_schema(database: Option<&str>) -> DbResult<String> {
    match database {
        Some(db) if db != "main" && !db.contains(['/', '\\']) && db != MEMORY_DATABASE => {
            validate_identifier("schema", db)?;
            Ok(quote_identifier(DatabaseType::SQLite, db))
        }
        _ => Ok("main".to_string()),
    }
}

/// Split a declared type such as `DECIMAL(10,2)` into name, first and second modifier.
fn parse_declared_type(declared: &str) -> (String, Option<i64>, Option<i64>) {
    match TYPE_MODIFIERS.captures(declared) {
        Some(caps) => (
            caps[1].to_string(),
            caps.get(2).and_then(|m| m.as_str().parse().ok()),
            caps.get(3).and_then(|m| m.as_str().parse().ok()),
        ),
        None => (declared.trim().to_string(), None, None),
    }
}

fn column_descriptor(row: ColumnRow) -> ColumnDescriptor {
    let (cid, name, declared, not_null, default) = row;
    let (base, first, second) = parse_declared_type(&declared);
    let data_type = if base.is_empty() {
        String::new()
    } else {
        normalize_type_name(&base)
    };
    let upper = base.to_ascii_uppercase();
    let is_numeric = ["DEC", "NUM", "REAL", "DOUBLE", "FLOAT"]
        .iter()
        .any(|p| upper.contains(p));

    let column = ColumnDescriptor::new(name, data_type, not_null == 0)
        .with_default(default)
        .with_position(cid + 1);
    if is_numeric {
        column.with_precision(first, second)
    } else {
        column.with_max_length(first)
    }
}

async fn run_statement(
    conn: &mut SqliteConnection,
    sql: &str,
    values: &[QueryParam],
) -> DbResult<QueryResult> {
    let started = Instant::now();
    let mut query = sqlx::query(sql);
    for value in values {
        query = bind_sqlite_param(query, value);
    }

    if returns_rows(sql) {
        let rows = query.fetch_all(&mut *conn).await?;
        let columns = rows.first().map(|r| r.column_metadata()).unwrap_or_default();
        let rows = rows.iter().map(|r| r.to_json_map()).collect();
        Ok(QueryResult::from_rows(columns, rows, elapsed_ms(started)))
    } else {
        let done = query.execute(&mut *conn).await?;
        Ok(QueryResult::write_result(
            done.rows_affected(),
            elapsed_ms(started),
        ))
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn context(&self) -> &DriverContext {
        &self.context
    }

    async fn create_connection(&self, database: Option<&str>) -> DbResult<DbPool> {
        let pool_opts = &self.config.pool_options;
        let options = self.connect_options(database)?;
        let pool = SqlitePoolOptions::new()
            .min_connections(pool_opts.min_connections_or_default())
            .max_connections(pool_opts.max_connections_or_default(true))
            .acquire_timeout(Duration::from_secs(pool_opts.acquire_timeout_or_default()))
            .idle_timeout(Some(Duration::from_secs(pool_opts.idle_timeout_or_default())))
            .test_before_acquire(pool_opts.test_before_acquire_or_default())
            .connect_with(options)
            .await
            .map_err(|e| connect_error(DatabaseType::SQLite, e.into()))?;
        Ok(DbPool::SQLite(pool))
    }

    async fn server_version(&self, pool: &DbPool) -> DbResult<String> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(sqlite_pool(pool)?)
            .await?;
        debug!(version = %version, "Got server version");
        Ok(version)
    }

    async fn execute_query(
        &self,
        pool: &DbPool,
        sql: &str,
        params: &QueryParams,
    ) -> DbResult<QueryResult> {
        let pool = sqlite_pool(pool)?;
        let (sql, values) = prepare_statement(sql, params, PlaceholderStyle::Question)?;
        debug!(sql = %sql, params = values.len(), "Executing SQLite statement");

        bounded(self.query_timeout(), "query", async {
            let mut conn = pool.acquire().await?;
            run_statement(&mut conn, &sql, &values).await
        })
        .await
    }

    async fn execute_stored_procedure(
        &self,
        _pool: &DbPool,
        name: &str,
        _params: &ProcedureParams,
        _options: &ProcedureOptions,
    ) -> DbResult<Vec<Row>> {
        Err(DbError::procedure_execution(
            name,
            "Stored procedures are not supported by SQLite",
            None,
        ))
    }

    async fn execute_transaction(
        &self,
        pool: &DbPool,
        operations: &[TransactionOperation],
    ) -> DbResult<Vec<QueryResult>> {
        let pool = sqlite_pool(pool)?;
        let prepared = operations
            .iter()
            .map(|op| prepare_statement(&op.sql, &op.params, PlaceholderStyle::Question))
            .collect::<DbResult<Vec<_>>>()?;

        bounded(self.query_timeout(), "transaction", async {
            let mut tx = pool.begin().await?;
            let mut results = Vec::with_capacity(prepared.len());
            for (index, (sql, values)) in prepared.iter().enumerate() {
                match run_statement(&mut tx, sql, values).await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        warn!(statement = index, error = %e, "Transaction statement failed, rolling back");
                        if let Err(rollback) = tx.rollback().await {
                            warn!(error = %rollback, "Rollback failed");
                        }
                        return Err(e);
                    }
                }
            }
            tx.commit().await?;
            Ok::<_, DbError>(results)
        })
        .await
    }

    /// Schemas of the connection: `main` plus attached databases.
    async fn get_database_list(&self, pool: &DbPool) -> DbResult<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_database_list WHERE name <> 'temp'")
                .fetch_all(sqlite_pool(pool)?)
                .await?;
        Ok(names)
    }

    async fn get_database_objects(
        &self,
        pool: &DbPool,
        database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        let schema = catalog_schema(database)?;
        let sql = format!(
            "SELECT name, type FROM {}.sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
            schema
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .fetch_all(sqlite_pool(pool)?)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, label)| {
                let category = ObjectCategory::parse(&label)?;
                Some(DatabaseObjectDescriptor::new(name, None, category, label))
            })
            .collect())
    }

    async fn get_table_columns(
        &self,
        pool: &DbPool,
        database: Option<&str>,
        table: &str,
    ) -> DbResult<Vec<ColumnDescriptor>> {
        validate_identifier("table", table)?;
        let (schema, table) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (database, table),
        };
        let schema = catalog_schema(schema)?;
        let rows: Vec<ColumnRow> = sqlx::query_as(
            "SELECT cid, name, type, \"notnull\", dflt_value \
             FROM pragma_table_info(?1, ?2) ORDER BY cid",
        )
        .bind(table)
        .bind(schema.trim_matches('"'))
        .fetch_all(sqlite_pool(pool)?)
        .await?;

        Ok(rows.into_iter().map(column_descriptor).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declared_type() {
        assert_eq!(
            parse_declared_type("VARCHAR(255)"),
            ("VARCHAR".to_string(), Some(255), None)
        );
        assert_eq!(
            parse_declared_type("DECIMAL(10, 2)"),
            ("DECIMAL".to_string(), Some(10), Some(2))
        );
        assert_eq!(parse_declared_type("TEXT"), ("TEXT".to_string(), None, None));
    }

    #[test]
    fn test_catalog_schema() {
        assert_eq!(catalog_schema(None).unwrap(), "main");
        assert_eq!(catalog_schema(Some("/tmp/app.db")).unwrap(), "main");
        assert_eq!(catalog_schema(Some("archive")).unwrap(), "\"archive\"");
        assert!(catalog_schema(Some("bad name")).is_err());
    }

    async fn driver_with_pool() -> (SqliteDriver, DbPool) {
        let driver = SqliteDriver::new(ConnectionConfig::sqlite(":memory:"), DriverContext::default());
        let pool = driver.create_connection(None).await.unwrap();
        (driver, pool)
    }

    #[tokio::test]
    async fn test_procedures_not_supported() {
        let (driver, pool) = driver_with_pool().await;
        let err = driver
            .execute_stored_procedure(
                &pool,
                "anything",
                &ProcedureParams::new(),
                &ProcedureOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ProcedureExecution { .. }));
    }

    #[tokio::test]
    async fn test_introspection() {
        let (driver, pool) = driver_with_pool().await;
        driver
            .execute_query(
                &pool,
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, note VARCHAR(40) NOT NULL, total DECIMAL(10,2) DEFAULT 0)",
                &QueryParams::None,
            )
            .await
            .unwrap();
        driver
            .execute_query(
                &pool,
                "CREATE VIEW big_orders AS SELECT * FROM orders WHERE total > 100",
                &QueryParams::None,
            )
            .await
            .unwrap();

        let tables = driver.get_tables(&pool, None).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "orders");

        let views = driver.get_views(&pool, None).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].category, ObjectCategory::View);

        let columns = driver.get_table_columns(&pool, None, "orders").await.unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[0].position, 1);
        assert_eq!(columns[1].max_length, Some(40));
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].precision, Some(10));
        assert_eq!(columns[2].scale, Some(2));
        assert_eq!(columns[2].default_value.as_deref(), Some("0"));

        assert_eq!(driver.get_database_list(&pool).await.unwrap(), vec!["main"]);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_transaction_rolls_back() {
        let (driver, pool) = driver_with_pool().await;
        driver
            .execute_query(&pool, "CREATE TABLE t (id INTEGER PRIMARY KEY)", &QueryParams::None)
            .await
            .unwrap();

        let ops = vec![
            TransactionOperation::new(
                "INSERT INTO t (id) VALUES (:id)",
                QueryParams::named([("id", QueryParam::Int(1))]),
            ),
            TransactionOperation::new(
                "INSERT INTO t (id) VALUES (:id)",
                QueryParams::named([("id", QueryParam::Int(1))]),
            ),
        ];
        assert!(driver.execute_transaction(&pool, &ops).await.is_err());

        let result = driver
            .execute_query(&pool, "SELECT COUNT(*) AS n FROM t", &QueryParams::None)
            .await
            .unwrap();
        assert_eq!(result.rows[0]["n"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_test_connection_reports_success() {
        let driver = SqliteDriver::new(ConnectionConfig::sqlite(":memory:"), DriverContext::default());
        let result = driver.test_connection().await;
        assert!(result.success);
        assert!(result.server_version.is_some());
    }
}
