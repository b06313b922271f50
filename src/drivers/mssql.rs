//! SQL Server driver.
//!
//! Connections come from a bb8 pool of tiberius clients. Procedures are
//! called with `EXEC` and named arguments. Transactions run on a dedicated
//! connection so a statement that times out never returns a half-finished
//! transaction to the pool.

use super::{
    DatabaseDriver, DriverContext, bounded, connect_error, elapsed_ms, returns_rows, scoped_pool,
};
use crate::db::params::bind_mssql_param;
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
use bb8::Pool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

type TdsClient = Client<Compat<TcpStream>>;

const LIST_DATABASES: &str = r#"
    SELECT name
    FROM sys.databases
    WHERE database_id > 4 AND state = 0
    ORDER BY name
"#;

const LIST_OBJECTS: &str = r#"
    SELECT o.name, s.name AS schema_name, RTRIM(o.type) AS type_code, o.type_desc
    FROM sys.objects o
    JOIN sys.schemas s ON s.schema_id = o.schema_id
    WHERE o.type IN ('U', 'V', 'P', 'FN', 'IF', 'TF')
      AND o.is_ms_shipped = 0
      AND s.name NOT IN ('sys', 'INFORMATION_SCHEMA')
    ORDER BY s.name, o.name
"#;

const DESCRIBE_COLUMNS: &str = r#"
    SELECT
        COLUMN_NAME,
        DATA_TYPE,
        IS_NULLABLE,
        CAST(CHARACTER_MAXIMUM_LENGTH AS BIGINT) AS max_length,
        CAST(NUMERIC_PRECISION AS BIGINT) AS numeric_precision,
        CAST(NUMERIC_SCALE AS BIGINT) AS numeric_scale,
        COLUMN_DEFAULT,
        CAST(ORDINAL_POSITION AS BIGINT) AS ordinal_position
    FROM INFORMATION_SCHEMA.COLUMNS
    WHERE TABLE_SCHEMA = COALESCE(@P1, SCHEMA_NAME()) AND TABLE_NAME = @P2
    ORDER BY ORDINAL_POSITION
"#;

/// bb8 connection manager for tiberius clients.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: Config,
}

impl TiberiusConnectionManager {
    fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();

        Client::connect(self.config.clone(), tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pool of SQL Server connections.
///
/// bb8 has no close operation, so closing only marks the pool; connections
/// are released once the last handle is dropped.
#[derive(Clone)]
pub struct MssqlPool {
    inner: Pool<TiberiusConnectionManager>,
    closed: Arc<AtomicBool>,
}

impl MssqlPool {
    fn new(inner: Pool<TiberiusConnectionManager>) -> Self {
        Self {
            inner,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn get(&self) -> DbResult<bb8::PooledConnection<'_, TiberiusConnectionManager>> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        Ok(self.inner.get().await?)
    }

    /// A connection outside the pool, closed when dropped.
    async fn dedicated(&self) -> DbResult<TdsClient> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        Ok(self.inner.dedicated_connection().await?)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open and idle connection counts.
    pub fn stats(&self) -> (u32, u32) {
        let state = self.inner.state();
        (state.connections, state.idle_connections)
    }
}

impl std::fmt::Debug for MssqlPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlPool")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug)]
pub struct MssqlDriver {
    config: ConnectionConfig,
    context: DriverContext,
}

impl MssqlDriver {
    pub fn new(config: ConnectionConfig, context: DriverContext) -> Self {
        Self { config, context }
    }

    fn tds_config(&self, database: Option<&str>) -> Config {
        let password = self.context.codec.reveal(&self.config.password);
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.effective_port().unwrap_or(1433));
        if let Some(db) = database.or(self.config.database.as_deref()) {
            config.database(db);
        }
        config.authentication(AuthMethod::sql_server(
            &self.config.username,
            password.as_str(),
        ));

        if self.config.ssl {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        if self.config.trust_server_certificate {
            config.trust_cert();
        }
        config
    }

    fn query_timeout(&self) -> Duration {
        self.context.query_timeout_for(&self.config)
    }

    async fn fetch_objects(&self, pool: &DbPool) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        let pool = mssql_pool(pool)?;
        let mut conn = pool.get().await?;
        let rows = conn.simple_query(LIST_OBJECTS).await?.into_first_result().await?;

        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = text(row, 0)?.unwrap_or_default();
            let schema = text(row, 1)?;
            let code = text(row, 2)?.unwrap_or_default();
            let label = text(row, 3)?.unwrap_or_else(|| code.clone());
            if let Some(category) = ObjectCategory::parse(&code) {
                objects.push(DatabaseObjectDescriptor::new(name, schema, category, label));
            }
        }
        Ok(objects)
    }

    async fn fetch_columns(
        &self,
        pool: &DbPool,
        schema: Option<&str>,
        table: &str,
    ) -> DbResult<Vec<ColumnDescriptor>> {
        let pool = mssql_pool(pool)?;
        let mut conn = pool.get().await?;
        let mut query = Query::new(DESCRIBE_COLUMNS);
        query.bind(schema);
        query.bind(table);
        let rows = query.query(&mut *conn).await?.into_first_result().await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = text(row, 0)?.unwrap_or_default();
            let data_type = text(row, 1)?.unwrap_or_default();
            let nullable = text(row, 2)?.is_some_and(|v| v == "YES");
            columns.push(
                ColumnDescriptor::new(name, normalize_type_name(&data_type), nullable)
                    .with_max_length(row.try_get::<i64, _>(3)?)
                    .with_precision(row.try_get::<i64, _>(4)?, row.try_get::<i64, _>(5)?)
                    .with_default(text(row, 6)?)
                    .with_position(row.try_get::<i64, _>(7)?.unwrap_or_default()),
            );
        }
        Ok(columns)
    }
}

fn mssql_pool(pool: &DbPool) -> DbResult<&MssqlPool> {
    match pool {
        DbPool::Mssql(p) => Ok(p),
        other => Err(DbError::internal(format!(
            "SQL Server driver was handed a {} pool",
            other.db_type()
        ))),
    }
}

fn text(row: &tiberius::Row, idx: usize) -> DbResult<Option<String>> {
    Ok(row.try_get::<&str, _>(idx)?.map(str::to_string))
}

/// `EXEC [schema].[proc] @a = @P1, @b = @P2`
fn exec_sql(name: &str, params: &ProcedureParams) -> String {
    let args = params
        .iter()
        .enumerate()
        .map(|(i, p)| format!("@{} = {}", p.name, PlaceholderStyle::AtP.placeholder(i + 1)))
        .collect::<Vec<_>>()
        .join(", ");
    let target = quote_identifier(DatabaseType::MSSQL, name);
    if args.is_empty() {
        format!("EXEC {}", target)
    } else {
        format!("EXEC {} {}", target, args)
    }
}

async fn run_statement(
    conn: &mut TdsClient,
    sql: &str,
    values: &[QueryParam],
) -> DbResult<QueryResult> {
    let started = Instant::now();
    let mut query = Query::new(sql);
    for value in values {
        bind_mssql_param(&mut query, value);
    }

    if returns_rows(sql) {
        let rows = query.query(conn).await?.into_first_result().await?;
        let columns = rows.first().map(|r| r.column_metadata()).unwrap_or_default();
        let rows = rows.iter().map(|r| r.to_json_map()).collect();
        Ok(QueryResult::from_rows(columns, rows, elapsed_ms(started)))
    } else {
        let done = query.execute(conn).await?;
        Ok(QueryResult::write_result(done.total(), elapsed_ms(started)))
    }
}

async fn simple(conn: &mut TdsClient, sql: &str) -> DbResult<()> {
    conn.simple_query(sql).await?.into_results().await?;
    Ok(())
}

#[async_trait]
impl DatabaseDriver for MssqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MSSQL
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn context(&self) -> &DriverContext {
        &self.context
    }

    async fn create_connection(&self, database: Option<&str>) -> DbResult<DbPool> {
        let pool_opts = &self.config.pool_options;
        let manager = TiberiusConnectionManager::new(self.tds_config(database));
        let pool = Pool::builder()
            .max_size(pool_opts.max_connections_or_default(false))
            .min_idle(Some(pool_opts.min_connections_or_default()))
            .connection_timeout(Duration::from_secs(pool_opts.acquire_timeout_or_default()))
            .idle_timeout(Some(Duration::from_secs(pool_opts.idle_timeout_or_default())))
            .test_on_check_out(pool_opts.test_before_acquire_or_default())
            .build(manager)
            .await
            .map_err(|e| connect_error(DatabaseType::MSSQL, e.into()))?;
        let pool = MssqlPool::new(pool);

        // bb8 fills min_idle in the background; surface login failures now.
        pool.get()
            .await
            .map_err(|e| connect_error(DatabaseType::MSSQL, e))?;
        Ok(DbPool::Mssql(pool))
    }

    async fn server_version(&self, pool: &DbPool) -> DbResult<String> {
        let pool = mssql_pool(pool)?;
        let mut conn = pool.get().await?;
        let row = conn.simple_query("SELECT @@VERSION").await?.into_row().await?;
        let version = row
            .as_ref()
            .map(|r| text(r, 0))
            .transpose()?
            .flatten()
            .unwrap_or_default();
        debug!(version = %version, "Got server version");
        Ok(version)
    }

    async fn execute_query(
        &self,
        pool: &DbPool,
        sql: &str,
        params: &QueryParams,
    ) -> DbResult<QueryResult> {
        let pool = mssql_pool(pool)?;
        let (sql, values) = prepare_statement(sql, params, PlaceholderStyle::AtP)?;
        debug!(sql = %sql, params = values.len(), "Executing SQL Server statement");

        bounded(self.query_timeout(), "query", async {
            let mut conn = pool.get().await?;
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
        let pool = mssql_pool(pool)?;
        let sql = exec_sql(name, params);
        let values = params.bound_values(options);
        debug!(procedure = %name, params = values.len(), "Calling SQL Server procedure");

        let result_sets = bounded(self.query_timeout(), "procedure call", async {
            let mut conn = pool.get().await?;
            let mut query = Query::new(sql.as_str());
            for value in &values {
                bind_mssql_param(&mut query, value);
            }
            Ok::<_, DbError>(query.query(&mut *conn).await?.into_results().await?)
        })
        .await
        .map_err(|e| e.into_procedure_error(name))?;

        Ok(result_sets
            .iter()
            .flatten()
            .map(|r| r.to_json_map())
            .collect())
    }

    async fn execute_transaction(
        &self,
        pool: &DbPool,
        operations: &[TransactionOperation],
    ) -> DbResult<Vec<QueryResult>> {
        let pool = mssql_pool(pool)?;
        let prepared = operations
            .iter()
            .map(|op| prepare_statement(&op.sql, &op.params, PlaceholderStyle::AtP))
            .collect::<DbResult<Vec<_>>>()?;

        bounded(self.query_timeout(), "transaction", async {
            let mut conn = pool.dedicated().await?;
            simple(&mut conn, "SET XACT_ABORT ON; BEGIN TRANSACTION").await?;

            let mut results = Vec::with_capacity(prepared.len());
            for (index, (sql, values)) in prepared.iter().enumerate() {
                match run_statement(&mut conn, sql, values).await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        warn!(statement = index, error = %e, "Transaction statement failed, rolling back");
                        if let Err(rollback) =
                            simple(&mut conn, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
                        {
                            warn!(error = %rollback, "Rollback failed");
                        }
                        return Err(e);
                    }
                }
            }
            simple(&mut conn, "COMMIT TRANSACTION").await?;
            Ok::<_, DbError>(results)
        })
        .await
    }

    async fn get_database_list(&self, pool: &DbPool) -> DbResult<Vec<String>> {
        let pool = mssql_pool(pool)?;
        let mut conn = pool.get().await?;
        let rows = conn
            .simple_query(LIST_DATABASES)
            .await?
            .into_first_result()
            .await?;
        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(name) = text(row, 0)? {
                names.push(name);
            }
        }
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
    fn test_exec_sql_named_arguments() {
        let params = ProcedureParams::new()
            .with("customer_id", 7i64)
            .with("status", "open");
        assert_eq!(
            exec_sql("dbo.get_orders", &params),
            "EXEC [dbo].[get_orders] @customer_id = @P1, @status = @P2"
        );
        assert_eq!(
            exec_sql("refresh_stats", &ProcedureParams::new()),
            "EXEC [refresh_stats]"
        );
    }

    #[test]
    fn test_driver_capabilities() {
        let config = ConnectionConfig::new(
            DatabaseType::MSSQL,
            "localhost",
            None,
            "sa",
            Default::default(),
            Some("master".into()),
        )
        .with_trust_server_certificate(true);
        let driver = MssqlDriver::new(config, DriverContext::default());
        assert_eq!(driver.database_type(), DatabaseType::MSSQL);
        assert_eq!(driver.default_port(), Some(1433));
        assert_eq!(driver.tds_config(None).get_addr(), "localhost:1433");
    }
}
