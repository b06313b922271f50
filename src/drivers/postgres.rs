//! PostgreSQL driver.
//!
//! A PostgreSQL connection is bound to one database, so catalog queries for
//! another database go through a secondary pool opened for the call.
//! Stored routines are called as set-returning functions.

use super::{
    DatabaseDriver, DriverContext, bounded, connect_error, elapsed_ms, returns_rows, scoped_pool,
};
use crate::db::params::bind_postgres_param;
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
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgSslMode};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LIST_DATABASES: &str = r#"
    SELECT datname::text
    FROM pg_database
    WHERE datistemplate = false AND datallowconn
    ORDER BY datname
"#;

const LIST_OBJECTS: &str = r#"
    SELECT t.table_name::text, t.table_schema::text, t.table_type::text
    FROM information_schema.tables t
    WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')
      AND t.table_schema NOT LIKE 'pg\_toast%'
      AND t.table_schema NOT LIKE 'pg\_temp%'
    UNION ALL
    SELECT r.routine_name::text, r.routine_schema::text, COALESCE(r.routine_type, 'FUNCTION')::text
    FROM information_schema.routines r
    WHERE r.routine_schema NOT IN ('pg_catalog', 'information_schema')
    ORDER BY 2, 1
"#;

const DESCRIBE_COLUMNS: &str = r#"
    SELECT
        c.column_name::text,
        c.data_type::text,
        c.is_nullable::text,
        c.character_maximum_length::int8,
        c.numeric_precision::int8,
        c.numeric_scale::int8,
        c.column_default::text,
        c.ordinal_position::int8
    FROM information_schema.columns c
    WHERE c.table_schema = COALESCE($1, current_schema()) AND c.table_name = $2
    ORDER BY c.ordinal_position
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
pub struct PostgresDriver {
    config: ConnectionConfig,
    context: DriverContext,
}

impl PostgresDriver {
    pub fn new(config: ConnectionConfig, context: DriverContext) -> Self {
        Self { config, context }
    }

    fn connect_options(&self, database: Option<&str>) -> PgConnectOptions {
        let password = self.context.codec.reveal(&self.config.password);
        let ssl_mode = if self.config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        let mut options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.effective_port().unwrap_or(5432))
            .username(&self.config.username)
            .password(password.as_str())
            .ssl_mode(ssl_mode);
        if let Some(db) = database.or(self.config.database.as_deref()) {
            options = options.database(db);
        }
        options
    }

    fn query_timeout(&self) -> Duration {
        self.context.query_timeout_for(&self.config)
    }

    async fn fetch_objects(&self, pool: &DbPool) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(LIST_OBJECTS)
            .fetch_all(pg_pool(pool)?)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, schema, label)| {
                let category = ObjectCategory::parse(&label)?;
                Some(DatabaseObjectDescriptor::new(name, Some(schema), category, label))
            })
            .collect())
    }

    async fn fetch_columns(
        &self,
        pool: &DbPool,
        schema: Option<&str>,
        table: &str,
    ) -> DbResult<Vec<ColumnDescriptor>> {
        let rows: Vec<ColumnRow> = sqlx::query_as(DESCRIBE_COLUMNS)
            .bind(schema)
            .bind(table)
            .fetch_all(pg_pool(pool)?)
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

fn pg_pool(pool: &DbPool) -> DbResult<&PgPool> {
    match pool {
        DbPool::Postgres(p) => Ok(p),
        other => Err(DbError::internal(format!(
            "PostgreSQL driver was handed a {} pool",
            other.db_type()
        ))),
    }
}

/// `SELECT * FROM "schema"."fn"($1, $2, ...)`
fn function_call_sql(name: &str, arg_count: usize) -> String {
    let placeholders = (1..=arg_count)
        .map(|n| PlaceholderStyle::Dollar.placeholder(n))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT * FROM {}({})",
        quote_identifier(DatabaseType::PostgreSQL, name),
        placeholders
    )
}

async fn run_statement(
    conn: &mut PgConnection,
    sql: &str,
    values: &[QueryParam],
) -> DbResult<QueryResult> {
    let started = Instant::now();
    let mut query = sqlx::query(sql);
    for value in values {
        query = bind_postgres_param(query, value);
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
impl DatabaseDriver for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn context(&self) -> &DriverContext {
        &self.context
    }

    async fn create_connection(&self, database: Option<&str>) -> DbResult<DbPool> {
        let pool_opts = &self.config.pool_options;
        let pool = PgPoolOptions::new()
            .min_connections(pool_opts.min_connections_or_default())
            .max_connections(pool_opts.max_connections_or_default(false))
            .acquire_timeout(Duration::from_secs(pool_opts.acquire_timeout_or_default()))
            .idle_timeout(Some(Duration::from_secs(pool_opts.idle_timeout_or_default())))
            .test_before_acquire(pool_opts.test_before_acquire_or_default())
            .connect_with(self.connect_options(database))
            .await
            .map_err(|e| connect_error(DatabaseType::PostgreSQL, e.into()))?;
        Ok(DbPool::Postgres(pool))
    }

    async fn server_version(&self, pool: &DbPool) -> DbResult<String> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(pg_pool(pool)?)
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
        let pool = pg_pool(pool)?;
        let (sql, values) = prepare_statement(sql, params, PlaceholderStyle::Dollar)?;
        debug!(sql = %sql, params = values.len(), "Executing PostgreSQL statement");

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
        let pool = pg_pool(pool)?;
        let sql = function_call_sql(name, params.len());
        let values = params.bound_values(options);
        debug!(procedure = %name, params = values.len(), "Calling PostgreSQL function");

        let rows = bounded(self.query_timeout(), "procedure call", async {
            let mut query = sqlx::query(&sql);
            for value in &values {
                query = bind_postgres_param(query, value);
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
        let pool = pg_pool(pool)?;
        let prepared = operations
            .iter()
            .map(|op| prepare_statement(&op.sql, &op.params, PlaceholderStyle::Dollar))
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
            .fetch_all(pg_pool(pool)?)
            .await?;
        Ok(names)
    }

    async fn get_database_objects(
        &self,
        pool: &DbPool,
        database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        let scoped = scoped_pool(self, pool, database).await?;
        let result = self.fetch_objects(scoped.pool()).await;
        scoped.release().await;
        result
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
            None => (None, table),
        };

        let scoped = scoped_pool(self, pool, database).await?;
        let result = self.fetch_columns(scoped.pool(), schema, table).await;
        scoped.release().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_call_sql() {
        assert_eq!(
            function_call_sql("get_orders", 2),
            r#"SELECT * FROM "get_orders"($1, $2)"#
        );
        assert_eq!(
            function_call_sql("sales.top_customers", 0),
            r#"SELECT * FROM "sales"."top_customers"()"#
        );
    }

    #[test]
    fn test_driver_capabilities() {
        let config = ConnectionConfig::new(
            DatabaseType::PostgreSQL,
            "localhost",
            None,
            "app",
            Default::default(),
            Some("shop".into()),
        );
        let driver = PostgresDriver::new(config, DriverContext::default());
        assert_eq!(driver.database_type(), DatabaseType::PostgreSQL);
        assert_eq!(driver.default_port(), Some(5432));
    }
}
