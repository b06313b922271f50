//! Integration tests for connection pool sharing and lifecycle.
//!
//! These run against SQLite files so no server is needed.

use async_trait::async_trait;
use db_gateway::config::PoolOptions;
use db_gateway::db::{ConnectionManager, DbPool};
use db_gateway::drivers::{DatabaseDriver, DriverContext, DriverFactory, VendorDriverFactory};
use db_gateway::error::{DbError, DbResult};
use db_gateway::models::{
    ColumnDescriptor, ConnectionConfig, DatabaseObjectDescriptor, DatabaseType,
    ProcedureOptions, ProcedureParams, QueryParam, QueryParams, QueryResult, Row,
    TransactionOperation,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A server that takes 200ms to refuse every login.
#[derive(Debug)]
struct UnreachableDriver {
    config: ConnectionConfig,
    context: DriverContext,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl DatabaseDriver for UnreachableDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn context(&self) -> &DriverContext {
        &self.context
    }

    async fn create_connection(&self, _database: Option<&str>) -> DbResult<DbPool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err(DbError::connection_with_code(
            "password authentication failed for user \"app\"",
            Some("28P01".to_string()),
            "Verify username and password are correct",
        ))
    }

    async fn server_version(&self, _pool: &DbPool) -> DbResult<String> {
        Err(DbError::PoolClosed)
    }

    async fn execute_query(
        &self,
        _pool: &DbPool,
        _sql: &str,
        _params: &QueryParams,
    ) -> DbResult<QueryResult> {
        Err(DbError::PoolClosed)
    }

    async fn execute_stored_procedure(
        &self,
        _pool: &DbPool,
        _name: &str,
        _params: &ProcedureParams,
        _options: &ProcedureOptions,
    ) -> DbResult<Vec<Row>> {
        Err(DbError::PoolClosed)
    }

    async fn execute_transaction(
        &self,
        _pool: &DbPool,
        _operations: &[TransactionOperation],
    ) -> DbResult<Vec<QueryResult>> {
        Err(DbError::PoolClosed)
    }

    async fn get_database_list(&self, _pool: &DbPool) -> DbResult<Vec<String>> {
        Err(DbError::PoolClosed)
    }

    async fn get_database_objects(
        &self,
        _pool: &DbPool,
        _database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        Err(DbError::PoolClosed)
    }

    async fn get_table_columns(
        &self,
        _pool: &DbPool,
        _database: Option<&str>,
        _table: &str,
    ) -> DbResult<Vec<ColumnDescriptor>> {
        Err(DbError::PoolClosed)
    }
}

#[derive(Default)]
struct UnreachableFactory {
    attempts: Arc<AtomicUsize>,
}

impl DriverFactory for UnreachableFactory {
    fn create(&self, config: &ConnectionConfig) -> DbResult<Arc<dyn DatabaseDriver>> {
        Ok(Arc::new(UnreachableDriver {
            config: config.clone(),
            context: DriverContext::default(),
            attempts: Arc::clone(&self.attempts),
        }))
    }
}

fn manager() -> ConnectionManager {
    let factory: Arc<dyn DriverFactory> =
        Arc::new(VendorDriverFactory::new(DriverContext::default()));
    ConnectionManager::new(factory, Duration::from_secs(5))
}

/// A fresh SQLite file with a seeded `items` table.
async fn setup_test_db(manager: &ConnectionManager) -> (TempDir, ConnectionConfig) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.db");
    let config = ConnectionConfig::sqlite(path.to_string_lossy());

    let empty = QueryParams::default();
    manager
        .execute_query(
            &config,
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            &empty,
        )
        .await
        .unwrap();
    manager
        .execute_query(
            &config,
            "INSERT INTO items (id, name) VALUES (1, 'alpha'), (5, 'five'), (12, 'twelve')",
            &empty,
        )
        .await
        .unwrap();
    (dir, config)
}

#[tokio::test]
async fn test_same_config_shares_pool() {
    let manager = manager();
    let (_dir, config) = setup_test_db(&manager).await;

    let first = manager.get_connection(&config).await.unwrap();
    let second = manager.get_connection(&config.clone()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.connection_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_first_use_creates_one_pool() {
    let manager = manager();
    let dir = tempfile::tempdir().unwrap();
    let config = ConnectionConfig::sqlite(dir.path().join("race.db").to_string_lossy());

    let before = manager.connection_count().await;
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let manager = manager.clone();
            let config = config.clone();
            tokio::spawn(async move { manager.get_connection(&config).await })
        })
        .collect();

    let mut pools = Vec::new();
    for handle in handles {
        pools.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(manager.connection_count().await, before + 1);
    assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
}

#[tokio::test]
async fn test_self_heals_after_close_all() {
    let manager = manager();
    let (_dir, config) = setup_test_db(&manager).await;

    manager.close_all_connections().await;
    assert_eq!(manager.connection_count().await, 0);

    let result = manager
        .execute_query(&config, "SELECT 2 AS test", &QueryParams::default())
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get("test"), Some(&json!(2)));
    assert_eq!(manager.connection_count().await, 1);
}

#[tokio::test]
async fn test_close_connection_is_idempotent() {
    let manager = manager();
    let (_dir, config) = setup_test_db(&manager).await;

    manager.close_connection(&config).await;
    manager.close_connection(&config).await;
    manager
        .close_connection(&ConnectionConfig::sqlite("never-opened.db"))
        .await;
    manager.close_all_connections().await;
    manager.close_all_connections().await;
    assert_eq!(manager.connection_count().await, 0);
}

#[tokio::test]
async fn test_externally_closed_pool_is_replaced() {
    let manager = manager();
    let (_dir, config) = setup_test_db(&manager).await;

    let stale = manager.get_connection(&config).await.unwrap();
    stale.pool().close().await;

    let fresh = manager.get_connection(&config).await.unwrap();
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert!(!fresh.is_closed());
}

#[tokio::test]
async fn test_named_parameter_rewrite() {
    let manager = manager();
    let (_dir, config) = setup_test_db(&manager).await;

    let params = QueryParams::named([("id", QueryParam::Int(5))]);
    let result = manager
        .execute_query(&config, "SELECT id, name FROM items WHERE id = :id", &params)
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get("name"), Some(&json!("five")));

    // :id must not clobber :identifier
    let params = QueryParams::named([
        ("id", QueryParam::Int(1)),
        ("identifier", QueryParam::Int(12)),
    ]);
    let result = manager
        .execute_query(
            &config,
            "SELECT name FROM items WHERE id = :id OR id = :identifier ORDER BY id",
            &params,
        )
        .await
        .unwrap();
    let names: Vec<_> = result.rows.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("alpha"), json!("twelve")]);
}

#[tokio::test]
async fn test_failed_creation_leaves_nothing_registered() {
    let manager = manager();
    let config = ConnectionConfig::sqlite("/nonexistent-dir/sub/gateway.db");

    let err = manager.get_connection(&config).await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }), "got {err:?}");
    assert_eq!(manager.connection_count().await, 0);
    assert!(manager.active_connections().await.is_empty());
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let manager = manager();
    let (_dir, config) = setup_test_db(&manager).await;

    let committed = manager
        .execute_transaction(
            &config,
            &[
                TransactionOperation::new(
                    "INSERT INTO items (id, name) VALUES (:id, :name)",
                    QueryParams::named([
                        ("id", QueryParam::Int(20)),
                        ("name", QueryParam::String("twenty".into())),
                    ]),
                ),
                TransactionOperation::new("SELECT COUNT(*) AS n FROM items", QueryParams::default()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[0].rows_affected, Some(1));
    assert_eq!(committed[1].rows[0].get("n"), Some(&json!(4)));

    let err = manager
        .execute_transaction(
            &config,
            &[
                TransactionOperation::new(
                    "INSERT INTO items (id, name) VALUES (30, 'thirty')",
                    QueryParams::default(),
                ),
                TransactionOperation::new(
                    "INSERT INTO items (id, name) VALUES (30, 'duplicate')",
                    QueryParams::default(),
                ),
            ],
        )
        .await;
    assert!(err.is_err());

    let count = manager
        .execute_query(
            &config,
            "SELECT COUNT(*) AS n FROM items WHERE id = 30",
            &QueryParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(count.rows[0].get("n"), Some(&json!(0)));
}

#[tokio::test]
async fn test_active_connections_summaries() {
    let manager = manager();
    let (_dir, config) = setup_test_db(&manager).await;

    let summaries = manager.active_connections().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].connection, config.key().to_string());
    assert!(summaries[0].last_used >= summaries[0].created_at);
}

#[tokio::test]
async fn test_concurrent_callers_share_failed_creation() {
    let factory = Arc::new(UnreachableFactory::default());
    let attempts = Arc::clone(&factory.attempts);
    let manager = ConnectionManager::new(factory, Duration::from_secs(5));
    let config = ConnectionConfig::new(
        DatabaseType::PostgreSQL,
        "db.internal",
        None,
        "app",
        Default::default(),
        Some("shop".to_string()),
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let manager = manager.clone();
            let config = config.clone();
            tokio::spawn(async move { manager.get_connection(&config).await })
        })
        .collect();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        match err {
            DbError::Connection { code, .. } => assert_eq!(code.as_deref(), Some("28P01")),
            other => panic!("unexpected: {other:?}"),
        }
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "callers waited {:?}",
        started.elapsed()
    );
    assert_eq!(manager.connection_count().await, 0);

    // A later call is not served the stale failure
    assert!(manager.get_connection(&config).await.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shared_pool_keeps_first_pool_options() {
    let manager = manager();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("options.db");
    let narrow = ConnectionConfig::sqlite(path.to_string_lossy()).with_pool_options(PoolOptions {
        max_connections: Some(1),
        ..Default::default()
    });
    let wide = ConnectionConfig::sqlite(path.to_string_lossy()).with_pool_options(PoolOptions {
        max_connections: Some(4),
        ..Default::default()
    });

    let first = manager.get_connection(&narrow).await.unwrap();
    let second = manager.get_connection(&wide).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.pool_options().max_connections, Some(1));
    assert_eq!(manager.connection_count().await, 1);
}
