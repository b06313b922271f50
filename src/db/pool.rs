//! Connection pool management.
//!
//! Pools are created lazily, one per canonical [`ConnectionKey`], and shared
//! by every caller that asks for an equivalent configuration. Creation is
//! single-flight: concurrent first requests for one key await the same shared
//! creation future and all observe its result, success or error.

use crate::config::PoolOptions;
use crate::drivers::{DatabaseDriver, DriverFactory, MssqlPool, bounded};
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionConfig, ConnectionKey, DatabaseType, ProcedureOptions, ProcedureParams,
    QueryParams, QueryResult, Row, TransactionOperation,
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts to obtain a live pool before giving up on a key whose pool keeps
/// turning out closed.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Pool information returned by `active_connections` (no secrets exposed).
#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct ConnectionSummary {
    /// Canonical connection signature, e.g. "mysql://app@db:3306/shop"
    pub connection: String,
    pub db_type: DatabaseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Open connections in the pool
    pub size: u32,
    /// Idle connections in the pool
    pub idle: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
    Mssql(MssqlPool),
}

impl DbPool {
    /// Close the connection pool. Idempotent.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
            DbPool::Mssql(pool) => pool.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            DbPool::MySql(pool) => pool.is_closed(),
            DbPool::Postgres(pool) => pool.is_closed(),
            DbPool::SQLite(pool) => pool.is_closed(),
            DbPool::Mssql(pool) => pool.is_closed(),
        }
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
            DbPool::Mssql(_) => DatabaseType::MSSQL,
        }
    }

    /// Open and idle connection counts.
    pub fn stats(&self) -> (u32, u32) {
        match self {
            DbPool::MySql(pool) => (pool.size(), pool.num_idle() as u32),
            DbPool::Postgres(pool) => (pool.size(), pool.num_idle() as u32),
            DbPool::SQLite(pool) => (pool.size(), pool.num_idle() as u32),
            DbPool::Mssql(pool) => pool.stats(),
        }
    }
}

/// A live pool together with the driver that created it.
pub struct PooledConnection {
    key: ConnectionKey,
    driver: Arc<dyn DatabaseDriver>,
    pool: DbPool,
    pool_options: PoolOptions,
    created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
    options_mismatch_logged: AtomicBool,
}

impl PooledConnection {
    fn new(
        key: ConnectionKey,
        driver: Arc<dyn DatabaseDriver>,
        pool: DbPool,
        pool_options: PoolOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            driver,
            pool,
            pool_options,
            created_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
            options_mismatch_logged: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn driver(&self) -> &dyn DatabaseDriver {
        self.driver.as_ref()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Options the pool was built with. Later configs for the same key reuse them.
    pub fn pool_options(&self) -> &PoolOptions {
        &self.pool_options
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_used_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    fn touch(&self) {
        self.last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Warn once when a config sharing this key asks for other pool options.
    fn check_options(&self, requested: &PoolOptions) {
        if *requested != self.pool_options
            && !self.options_mismatch_logged.swap(true, Ordering::Relaxed)
        {
            warn!(
                connection = %self.key,
                active = ?self.pool_options,
                requested = ?requested,
                "Pool options differ from the shared pool's; keeping the existing pool"
            );
        }
    }

    fn summary(&self) -> ConnectionSummary {
        let (size, idle) = self.pool.stats();
        ConnectionSummary {
            connection: self.key.to_string(),
            db_type: self.key.db_type,
            database: self.key.database.clone(),
            size,
            idle,
            created_at: self.created_at,
            last_used: self.last_used(),
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key.to_string())
            .field("closed", &self.is_closed())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// In-flight or finished pool creation, shared by every caller for one key.
type PoolSlot = Shared<BoxFuture<'static, DbResult<Arc<PooledConnection>>>>;

fn slot_result(slot: &PoolSlot) -> Option<&Arc<PooledConnection>> {
    slot.peek().and_then(|created| created.as_ref().ok())
}

/// Manages database connection pools keyed by connection signature.
#[derive(Clone)]
pub struct ConnectionManager {
    factory: Arc<dyn DriverFactory>,
    pools: Arc<RwLock<HashMap<ConnectionKey, PoolSlot>>>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn DriverFactory>, connect_timeout: Duration) -> Self {
        Self {
            factory,
            pools: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
        }
    }

    /// Get the shared pool for `config`, creating it on first use.
    ///
    /// Equivalent configurations (same canonical key) share one pool. A pool
    /// found closed is evicted and replaced transparently. Callers that arrive
    /// while a creation is in flight share its outcome; a failed creation
    /// leaves nothing registered, so a later call tries again.
    pub async fn get_connection(
        &self,
        config: &ConnectionConfig,
    ) -> DbResult<Arc<PooledConnection>> {
        config.validate()?;
        let key = config.key();

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let slot = self.slot_for(config, &key).await;
            let created = slot.clone().await;

            match created {
                Ok(conn) if conn.is_closed() => {
                    debug!(connection = %key, "Found closed pool, recreating");
                    self.evict(&key, &slot).await;
                }
                Ok(conn) => {
                    self.ensure_registered(&key, &slot).await;
                    conn.check_options(&config.pool_options);
                    conn.touch();
                    return Ok(conn);
                }
                Err(e) => {
                    self.evict(&key, &slot).await;
                    return Err(e);
                }
            }
        }

        Err(DbError::PoolClosed)
    }

    /// Execute a statement, recovering once if the pool was closed underneath.
    pub async fn execute_query(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        params: &QueryParams,
    ) -> DbResult<QueryResult> {
        self.with_connection(config, |conn| async move {
            conn.driver.execute_query(&conn.pool, sql, params).await
        })
        .await
    }

    /// Like `execute_query`, but abandons the statement when `cancel` fires.
    pub async fn execute_query_cancellable(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        params: &QueryParams,
        cancel: CancellationToken,
    ) -> DbResult<QueryResult> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(connection = %config.key(), "Query cancelled");
                Err(DbError::cancelled("query"))
            }
            result = self.execute_query(config, sql, params) => result,
        }
    }

    pub async fn execute_procedure(
        &self,
        config: &ConnectionConfig,
        name: &str,
        params: &ProcedureParams,
        options: &ProcedureOptions,
    ) -> DbResult<Vec<Row>> {
        self.with_connection(config, |conn| async move {
            conn.driver
                .execute_stored_procedure(&conn.pool, name, params, options)
                .await
        })
        .await
    }

    pub async fn execute_transaction(
        &self,
        config: &ConnectionConfig,
        operations: &[TransactionOperation],
    ) -> DbResult<Vec<QueryResult>> {
        self.with_connection(config, |conn| async move {
            conn.driver.execute_transaction(&conn.pool, operations).await
        })
        .await
    }

    /// Close and forget the pool for `config`. Closing twice is a no-op.
    pub async fn close_connection(&self, config: &ConnectionConfig) {
        let key = config.key();
        let slot = self.pools.write().await.remove(&key);
        if let Some(conn) = slot.as_ref().and_then(slot_result) {
            info!(connection = %key, "Closing connection pool");
            conn.driver.close_connection(&conn.pool).await;
        }
    }

    /// Close every pool. Closing twice is a no-op.
    pub async fn close_all_connections(&self) {
        let drained: Vec<(ConnectionKey, PoolSlot)> =
            self.pools.write().await.drain().collect();
        for (key, slot) in drained {
            if let Some(conn) = slot_result(&slot) {
                info!(connection = %key, "Closing connection pool");
                conn.driver.close_connection(&conn.pool).await;
            }
        }
        info!("All connections closed");
    }

    /// Number of live pools.
    pub async fn connection_count(&self) -> usize {
        self.pools
            .read()
            .await
            .values()
            .filter(|slot| slot_result(slot).is_some_and(|c| !c.is_closed()))
            .count()
    }

    /// Summaries of every live pool.
    pub async fn active_connections(&self) -> Vec<ConnectionSummary> {
        let pools = self.pools.read().await;
        let mut summaries: Vec<ConnectionSummary> = pools
            .values()
            .filter_map(slot_result)
            .filter(|c| !c.is_closed())
            .map(|c| c.summary())
            .collect();
        summaries.sort_by(|a, b| a.connection.cmp(&b.connection));
        summaries
    }

    /// Run `op` against the pool for `config`, recovering once if the pool was
    /// closed underneath.
    pub async fn with_connection<T, F, Fut>(&self, config: &ConnectionConfig, op: F) -> DbResult<T>
    where
        F: Fn(Arc<PooledConnection>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let conn = self.get_connection(config).await?;
        match op(Arc::clone(&conn)).await {
            Err(DbError::PoolClosed) => {
                warn!(connection = %conn.key, "Pool closed during operation, retrying once");
                self.evict_closed(&conn).await;
                let conn = self.get_connection(config).await?;
                op(conn).await
            }
            other => other,
        }
    }

    /// The registered slot for `key`, or a new one whose creation starts when
    /// first awaited.
    async fn slot_for(&self, config: &ConnectionConfig, key: &ConnectionKey) -> PoolSlot {
        if let Some(slot) = self.pools.read().await.get(key) {
            return slot.clone();
        }
        let mut pools = self.pools.write().await;
        pools
            .entry(key.clone())
            .or_insert_with(|| {
                create_pooled(
                    Arc::clone(&self.factory),
                    config.clone(),
                    key.clone(),
                    self.connect_timeout,
                )
                .boxed()
                .shared()
            })
            .clone()
    }

    /// Remove `slot` if it is still the one registered for `key`.
    async fn evict(&self, key: &ConnectionKey, slot: &PoolSlot) {
        let mut pools = self.pools.write().await;
        if pools.get(key).is_some_and(|s| s.ptr_eq(slot)) {
            pools.remove(key);
        }
    }

    async fn evict_closed(&self, conn: &PooledConnection) {
        let mut pools = self.pools.write().await;
        let stale = pools
            .get(&conn.key)
            .and_then(slot_result)
            .is_some_and(|c| c.is_closed());
        if stale {
            pools.remove(&conn.key);
        }
    }

    /// Re-register a slot that was evicted while its creation was in flight.
    async fn ensure_registered(&self, key: &ConnectionKey, slot: &PoolSlot) {
        if self.pools.read().await.contains_key(key) {
            return;
        }
        self.pools
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| slot.clone());
    }
}

async fn create_pooled(
    factory: Arc<dyn DriverFactory>,
    config: ConnectionConfig,
    key: ConnectionKey,
    connect_timeout: Duration,
) -> DbResult<Arc<PooledConnection>> {
    let driver = factory.create(&config)?;
    info!(
        connection = %key,
        db_type = %config.db_type,
        "Creating connection pool"
    );
    let pool = bounded(connect_timeout, "connect", driver.create_connection(None))
        .await
        .inspect_err(|e| warn!(connection = %key, error = %e, "Failed to create connection pool"))?;
    info!(connection = %key, "Connection pool ready");
    Ok(Arc::new(PooledConnection::new(
        key,
        driver,
        pool,
        config.pool_options,
    )))
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
