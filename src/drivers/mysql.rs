//! MySQL / MariaDB driver.
//!
//! MySQL treats databases as schemas, so catalog queries for another
//! database run on the existing pool with a schema qualifier instead of
//! opening a secondary pool.

use super::{DatabaseDriver, DriverContext, bounded, connect_error, elapsed_ms, returns_rows};
use crate::db::params::bind_mysql_param;
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
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPoolOptions, MySqlSslMode};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LIST_DATABASES: &str = r#"
    SELECT CONVERT(SCHEMA_NAME USING utf8mb4) AS name
    FROM information_schema.SCHEMATA
    WHERE SCHEMA_NAME NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')
    ORDER BY SCHEMA_NAME
"#;

const LIST_OBJECTS: &str = r#"
    SELECT
        CONVERT(TABLE_NAME USING utf8mb4) AS name,
        CONVERT(TABLE_SCHEMA USING utf8mb4) AS schema_name,
        CONVERT(TABLE_TYPE USING utf8mb4) AS type_label
    FROM information_schema.TABLES
    WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
    UNION ALL
    SELECT
        CONVERT(ROUTINE_NAME USING utf8mb4),
        CONVERT(ROUTINE_SCHEMA USING utf8mb4),
        CONVERT(ROUTINE_TYPE USING utf8mb4)
    FROM information_schema.ROUTINES
    WHERE ROUTINE_SCHEMA = COALESCE(?, DATABASE())
    ORDER BY name
"#;

const DESCRIBE_COLUMNS: &str = r#"
    SELECT
        CONVERT(COLUMN_NAME USING utf8mb4) AS column_name,
        CONVERT(DATA_TYPE USING utf8mb4) AS data_type,
        CONVERT(IS_NULLABLE USING utf8mb4) AS is_nullable,
        CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS max_length,
        CAST(NUMERIC_PRECISION AS SIGNED) AS numeric_precision,
        CAST(NUMERIC_SCALE AS SIGNED) AS numeric_scale,
        CONVERT(COLUMN_DEFAULT USING utf8mb4) AS column_default,
        CAST(ORDINAL_POSITION AS SIGNED) AS ordinal_position
    FROM information_schema.COLUMNS
    WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION
"#;

type ColumnRow = (
    String,
    String,
    String,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    i64,
);

#[derive(Debug)]
pub struct MySqlDriver {
    config: ConnectionConfig,
    context: DriverContext,
}

impl MySqlDriver {
    pub fn new(config: ConnectionConfig, context: DriverContext) -> Self {
        Self { config, context }
    }

    fn connect_options(&self, database: Option<&str>) -> MySqlConnectOptions {
        let password = self.context.codec.reveal(&self.config.password);
        let ssl_mode = if self.config.ssl {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        };
        let mut options = MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.effective_port().unwrap_or(3306))
            .username(&self.config.username)
            .password(password.as_str())
            .charset("utf8mb4")
            .ssl_mode(ssl_mode);
        if let Some(db) = database.or(self.config.database.as_deref()) {
            options = options.database(db);
        }
        options
    }

    fn query_timeout(&self) -> Duration {
        self.context.query_timeout_for(&self.config)
    }
}

fn mysql_pool(pool: &DbPool) -> DbResult<&MySqlPool> {
    match pool {
        DbPool::MySql(p) => Ok(p),
        other => Err(DbError::internal(format!(
            "MySQL driver was handed a {} pool",
            other.db_type()
        ))),
    }
}

/// Split `schema.table`; a bare name belongs to `database`.
fn split_table<'a>(database: Option<&'a str>, table: &'a str) -> (Option<&'a str>, &'a str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (database, table),
    }
}

async fn run_statement(
    conn: &mut MySqlConnection,
    sql: &str,
    values: &[QueryParam],
) -> DbResult<QueryResult> {
    let started = Instant::now();
    let mut query = sqlx::query(sql);
    for value in values {
        query = bind_mysql_param(query, value);
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
impl DatabaseDriver for MySqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn context(&self) -> &DriverContext {
        &self.context
    }

    async fn create_connection(&self, database: Option<&str>) -> DbResult<DbPool> {
        let pool_opts = &self.config.pool_options;
        let pool = MySqlPoolOptions::new()
            .min_connections(pool_opts.min_connections_or_default())
            .max_connections(pool_opts.max_connections_or_default(false))
            .acquire_timeout(Duration::from_secs(pool_opts.acquire_timeout_or_default()))
            .idle_timeout(Some(Duration::from_secs(pool_opts.idle_timeout_or_default())))
            .test_before_acquire(pool_opts.test_before_acquire_or_default())
            .connect_with(self.connect_options(database))
            .await
            .map_err(|e| connect_error(DatabaseType::MySQL, e.into()))?;
        Ok(DbPool::MySql(pool))
    }

    async fn server_version(&self, pool: &DbPool) -> DbResult<String> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(mysql_pool(pool)?)
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
        let pool = mysql_pool(pool)?;
        let (sql, values) = prepare_statement(sql, params, PlaceholderStyle::Question)?;
        debug!(sql = %sql, params = values.len(), "Executing MySQL statement");

        bounded(self.query_timeout(), "query", async {
            let mut conn = pool.acquire().await?;
            run_statement(&mut conn, &sql, &values).await
        })
        .await
    }

    async fn execute_stored_procedure(
        &self,
        pool: &DbPool,
        name: &str,
        params: &ProcedureParams,
        options: &ProcedureOptions,
    ) -> DbResult<Vec<Row>> {
        validate_identifier("procedure", name)?;
        for param in params.iter() {
            validate_identifier("parameter", &param.name)?;
        }
        let pool = mysql_pool(pool)?;
        let placeholders = vec!["?"; params.len()].join(", ");
        let sql = format!(
            "CALL {}({})",
            quote_identifier(DatabaseType::MySQL, name),
            placeholders
        );
        let values = params.bound_values(options);
        debug!(procedure = %name, params = values.len(), "Calling MySQL procedure");

        let rows = bounded(self.query_timeout(), "procedure call", async {
            let mut query = sqlx::query(&sql);
            for value in &values {
                query = bind_mysql_param(query, value);
            }
            Ok::<_, DbError>(query.fetch_all(pool).await?)
        })
        .await
        .map_err(|e| e.into_procedure_error(name))?;

        Ok(rows.iter().map(|r| r.to_json_map()).collect())
    }

    async fn execute_transaction(
        &self,
        pool: &DbPool,
        operations: &[TransactionOperation],
    ) -> DbResult<Vec<QueryResult>> {
        let pool = mysql_pool(pool)?;
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

    async fn get_database_list(&self, pool: &DbPool) -> DbResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(LIST_DATABASES)
            .fetch_all(mysql_pool(pool)?)
            .await?;
        Ok(names)
    }

    async fn get_database_objects(
        &self,
        pool: &DbPool,
        database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(LIST_OBJECTS)
            .bind(database)
            .bind(database)
            .fetch_all(mysql_pool(pool)?)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, schema, label)| {
                let category = ObjectCategory::parse(&label)?;
                Some(DatabaseObjectDescriptor::new(name, Some(schema), category, label))
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
        let (schema, table) = split_table(database, table);
        let rows: Vec<ColumnRow> = sqlx::query_as(DESCRIBE_COLUMNS)
            .bind(schema)
            .bind(table)
            .fetch_all(mysql_pool(pool)?)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(name, data_type, nullable, max_length, precision, scale, default, position)| {
                    ColumnDescriptor::new(name, normalize_type_name(&data_type), nullable == "YES")
                        .with_max_length(max_length)
                        .with_precision(precision, scale)
                        .with_default(default)
                        .with_position(position)
                },
            )
            .collect())
    }
}
