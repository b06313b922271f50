//! Vendor-agnostic introspection and ad-hoc queries over pooled connections.
//!
//! Which database a catalog call targets is routed by each driver; this
//! layer presents one signature for every vendor and caches object lists.

use crate::db::ConnectionManager;
use crate::drivers::{DriverFactory, connection_suggestion, filter_objects};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDescriptor, ConnectionConfig, ConnectionKey, ConnectionTestResult,
    DatabaseObjectDescriptor, ObjectCategory, QueryParams, QueryResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

type CacheKey = (ConnectionKey, Option<String>);

#[derive(Debug)]
struct CachedObjects {
    fetched_at: Instant,
    objects: Arc<Vec<DatabaseObjectDescriptor>>,
}

/// Introspection and query entry point shared by the dispatcher, the catalog
/// and the tool surface.
#[derive(Clone)]
pub struct DatabaseService {
    manager: ConnectionManager,
    factory: Arc<dyn DriverFactory>,
    cache_ttl: Duration,
    cache: Arc<RwLock<HashMap<CacheKey, CachedObjects>>>,
}

impl DatabaseService {
    /// A zero `cache_ttl` disables the object cache.
    pub fn new(
        manager: ConnectionManager,
        factory: Arc<dyn DriverFactory>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            manager,
            factory,
            cache_ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Probe `config` with a throwaway pool. Never fails.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionTestResult {
        match self.factory.create(config) {
            Ok(driver) => driver.test_connection().await,
            Err(e) => ConnectionTestResult::failed(&e, 0),
        }
    }

    /// Like `test_connection`, but a failed probe becomes a `Connection` error
    /// carrying the vendor code.
    pub async fn verify_connection(
        &self,
        config: &ConnectionConfig,
    ) -> DbResult<ConnectionTestResult> {
        config.validate()?;
        let result = self.test_connection(config).await;
        if result.success {
            return Ok(result);
        }
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "Connection test failed".to_string());
        let suggestion = connection_suggestion(config.db_type, &message);
        Err(DbError::connection_with_code(
            message,
            result.code.clone(),
            suggestion,
        ))
    }

    pub async fn execute_query(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        params: &QueryParams,
    ) -> DbResult<QueryResult> {
        self.manager.execute_query(config, sql, params).await
    }

    pub async fn get_database_list(&self, config: &ConnectionConfig) -> DbResult<Vec<String>> {
        self.manager
            .with_connection(config, |conn| async move {
                conn.driver().get_database_list(conn.pool()).await
            })
            .await
    }

    /// Tables, views, procedures and functions of `database` (the configured
    /// database when None).
    pub async fn get_database_objects(
        &self,
        config: &ConnectionConfig,
        database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        let objects = self.cached_objects(config, database).await?;
        Ok(objects.as_ref().clone())
    }

    pub async fn get_tables(
        &self,
        config: &ConnectionConfig,
        database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        self.objects_of(config, database, &[ObjectCategory::Table])
            .await
    }

    pub async fn get_views(
        &self,
        config: &ConnectionConfig,
        database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        self.objects_of(config, database, &[ObjectCategory::View])
            .await
    }

    pub async fn get_procedures(
        &self,
        config: &ConnectionConfig,
        database: Option<&str>,
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        self.objects_of(
            config,
            database,
            &[ObjectCategory::Procedure, ObjectCategory::Function],
        )
        .await
    }

    pub async fn get_table_columns(
        &self,
        config: &ConnectionConfig,
        database: Option<&str>,
        table: &str,
    ) -> DbResult<Vec<ColumnDescriptor>> {
        self.manager
            .with_connection(config, |conn| async move {
                conn.driver()
                    .get_table_columns(conn.pool(), database, table)
                    .await
            })
            .await
    }

    /// Drop cached object lists for `config`, or for every connection.
    pub async fn invalidate(&self, config: Option<&ConnectionConfig>) {
        let mut cache = self.cache.write().await;
        match config {
            Some(config) => {
                let key = config.key();
                cache.retain(|(k, _), _| *k != key);
                debug!(connection = %key, "Introspection cache invalidated");
            }
            None => {
                cache.clear();
                info!("Introspection cache cleared");
            }
        }
    }

    async fn objects_of(
        &self,
        config: &ConnectionConfig,
        database: Option<&str>,
        categories: &[ObjectCategory],
    ) -> DbResult<Vec<DatabaseObjectDescriptor>> {
        let objects = self.cached_objects(config, database).await?;
        Ok(filter_objects(objects.as_ref().clone(), categories))
    }

    async fn cached_objects(
        &self,
        config: &ConnectionConfig,
        database: Option<&str>,
    ) -> DbResult<Arc<Vec<DatabaseObjectDescriptor>>> {
        let key: CacheKey = (config.key(), database.map(String::from));

        if !self.cache_ttl.is_zero() {
            if let Some(entry) = self.cache.read().await.get(&key) {
                if entry.fetched_at.elapsed() < self.cache_ttl {
                    debug!(connection = %key.0, database = ?database, "Introspection cache hit");
                    return Ok(Arc::clone(&entry.objects));
                }
            }
        }

        let objects = self
            .manager
            .with_connection(config, |conn| async move {
                conn.driver()
                    .get_database_objects(conn.pool(), database)
                    .await
            })
            .await?;
        let objects = Arc::new(objects);

        if !self.cache_ttl.is_zero() {
            self.cache.write().await.insert(
                key,
                CachedObjects {
                    fetched_at: Instant::now(),
                    objects: Arc::clone(&objects),
                },
            );
        }
        Ok(objects)
    }
}

impl std::fmt::Debug for DatabaseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseService")
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{DriverContext, VendorDriverFactory};

    fn service(ttl: Duration) -> DatabaseService {
        let factory: Arc<dyn DriverFactory> =
            Arc::new(VendorDriverFactory::new(DriverContext::default()));
        let manager = ConnectionManager::new(Arc::clone(&factory), Duration::from_secs(5));
        DatabaseService::new(manager, factory, ttl)
    }

    fn sqlite_file() -> (tempfile::TempDir, ConnectionConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("introspect.db");
        (dir, ConnectionConfig::sqlite(path.to_string_lossy()))
    }

    #[tokio::test]
    async fn test_test_connection_never_fails_on_invalid_config() {
        let svc = service(Duration::ZERO);
        let config = ConnectionConfig::new(
            crate::models::DatabaseType::MySQL,
            "",
            None,
            "",
            Default::default(),
            None,
        );
        let result = svc.test_connection(&config).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_verify_connection_sqlite() {
        let svc = service(Duration::ZERO);
        let (_dir, config) = sqlite_file();
        let result = svc.verify_connection(&config).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_objects_cached_until_invalidated() {
        let svc = service(Duration::from_secs(60));
        let (_dir, config) = sqlite_file();
        let empty = QueryParams::default();

        svc.execute_query(&config, "CREATE TABLE a (id INTEGER)", &empty)
            .await
            .unwrap();
        assert_eq!(svc.get_tables(&config, None).await.unwrap().len(), 1);

        svc.execute_query(&config, "CREATE TABLE b (id INTEGER)", &empty)
            .await
            .unwrap();
        assert_eq!(svc.get_tables(&config, None).await.unwrap().len(), 1);

        svc.invalidate(Some(&config)).await;
        let names: Vec<String> = svc
            .get_tables(&config, None)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let svc = service(Duration::ZERO);
        let (_dir, config) = sqlite_file();
        let empty = QueryParams::default();

        svc.execute_query(&config, "CREATE TABLE a (id INTEGER)", &empty)
            .await
            .unwrap();
        assert_eq!(svc.get_tables(&config, None).await.unwrap().len(), 1);
        svc.execute_query(&config, "CREATE VIEW v AS SELECT id FROM a", &empty)
            .await
            .unwrap();
        assert_eq!(svc.get_views(&config, None).await.unwrap().len(), 1);
        assert!(svc.get_procedures(&config, None).await.unwrap().is_empty());
    }
}
