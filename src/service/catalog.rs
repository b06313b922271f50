//! Persisted connection definitions.
//!
//! A connection is stored only after a successful probe, with its password
//! sealed by the credential codec. Services created from a connection depend
//! on it; deleting a connection with dependents requires `force`.

use super::database::DatabaseService;
use super::registry::ServiceRegistry;
use crate::credentials::CredentialCodec;
use crate::error::{DbError, DbResult};
use crate::models::{
    AccessPolicy, ColumnDescriptor, ConnectionConfig, Environment, ServiceBinding,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A named connection as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConnection {
    pub id: String,
    pub name: String,
    pub config: ConnectionConfig,
    /// Result of the last `refresh_connection_databases`
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub databases_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for stored connections.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, id: &str) -> DbResult<Option<StoredConnection>>;
    async fn list(&self) -> DbResult<Vec<StoredConnection>>;
    /// Insert or replace by id.
    async fn save(&self, connection: StoredConnection) -> DbResult<()>;
    /// Returns whether a row was removed.
    async fn delete(&self, id: &str) -> DbResult<bool>;
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct InMemoryConnectionStore {
    rows: RwLock<HashMap<String, StoredConnection>>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn get(&self, id: &str) -> DbResult<Option<StoredConnection>> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn list(&self) -> DbResult<Vec<StoredConnection>> {
        let mut rows: Vec<StoredConnection> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn save(&self, connection: StoredConnection) -> DbResult<()> {
        self.rows
            .write()
            .await
            .insert(connection.id.clone(), connection);
        Ok(())
    }

    async fn delete(&self, id: &str) -> DbResult<bool> {
        Ok(self.rows.write().await.remove(id).is_some())
    }
}

/// `{success, columns}` or `{success: false, error}`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TableColumnsResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a delete removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub removed_services: usize,
}

pub struct ConnectionCatalog {
    store: Arc<dyn ConnectionStore>,
    registry: Arc<ServiceRegistry>,
    database: DatabaseService,
    codec: Arc<CredentialCodec>,
}

impl ConnectionCatalog {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        registry: Arc<ServiceRegistry>,
        database: DatabaseService,
        codec: Arc<CredentialCodec>,
    ) -> Self {
        Self {
            store,
            registry,
            database,
            codec,
        }
    }

    pub async fn get_connection(&self, id: &str) -> DbResult<StoredConnection> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| DbError::connection_not_found(id))
    }

    pub async fn list_connections(&self) -> DbResult<Vec<StoredConnection>> {
        self.store.list().await
    }

    /// Validate, probe, seal the password, then persist.
    ///
    /// Nothing is stored when the probe fails; the caller gets the
    /// `Connection` error with the vendor detail.
    pub async fn create_connection(
        &self,
        name: impl Into<String>,
        mut config: ConnectionConfig,
    ) -> DbResult<StoredConnection> {
        let name = name.into();
        self.database.verify_connection(&config).await?;
        config.password = self.codec.seal(config.password)?;

        let now = Utc::now();
        let stored = StoredConnection {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            config,
            databases: Vec::new(),
            databases_refreshed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save(stored.clone()).await?;
        info!(
            connection_id = %stored.id,
            connection = %stored.config.key(),
            "Connection created"
        );
        Ok(stored)
    }

    /// Replace the definition of `id`.
    ///
    /// The new definition is probed only when the endpoint or credentials
    /// changed; in that case the old pool is closed and dependent services
    /// are repointed.
    pub async fn update_connection(
        &self,
        id: &str,
        name: Option<String>,
        mut config: ConnectionConfig,
    ) -> DbResult<StoredConnection> {
        let existing = self.get_connection(id).await?;
        config.validate()?;

        let changed = self.connection_changed(&existing.config, &config);
        if changed {
            self.database.verify_connection(&config).await?;
        }
        config.password = self.codec.seal(config.password)?;

        let updated = StoredConnection {
            name: name.unwrap_or_else(|| existing.name.clone()),
            config,
            updated_at: Utc::now(),
            ..existing.clone()
        };
        self.store.save(updated.clone()).await?;

        if changed {
            self.database.manager().close_connection(&existing.config).await;
            self.database.invalidate(Some(&existing.config)).await;
            let repointed = self.registry.update_connection(id, &updated.config).await;
            info!(
                connection_id = %id,
                connection = %updated.config.key(),
                services = repointed,
                "Connection updated, old pool closed"
            );
        } else {
            info!(connection_id = %id, "Connection updated without endpoint change");
        }
        Ok(updated)
    }

    /// Delete `id`. With dependents, fails unless `force`, which removes them first.
    pub async fn delete_connection(&self, id: &str, force: bool) -> DbResult<DeleteOutcome> {
        let existing = self.get_connection(id).await?;
        let dependents = self.registry.dependents_of(id).await;

        if !dependents.is_empty() && !force {
            let names: Vec<String> = dependents
                .iter()
                .map(|b| format!("{}@{}", b.name, b.environment))
                .collect();
            return Err(DbError::validation(format!(
                "Connection '{}' is used by {} service(s): {}. Pass force to delete them too",
                existing.name,
                dependents.len(),
                names.join(", ")
            )));
        }

        let removed_services = if force {
            self.registry.remove_dependents(id).await
        } else {
            0
        };
        self.database.manager().close_connection(&existing.config).await;
        self.database.invalidate(Some(&existing.config)).await;
        self.store.delete(id).await?;

        info!(connection_id = %id, removed_services, "Connection deleted");
        Ok(DeleteOutcome { removed_services })
    }

    /// Re-list the server's databases and persist the result.
    pub async fn refresh_connection_databases(&self, id: &str) -> DbResult<StoredConnection> {
        let mut stored = self.get_connection(id).await?;
        let databases = self.database.get_database_list(&stored.config).await?;
        stored.databases = databases;
        stored.databases_refreshed_at = Some(Utc::now());
        self.store.save(stored.clone()).await?;
        info!(
            connection_id = %id,
            databases = stored.databases.len(),
            "Database list refreshed"
        );
        Ok(stored)
    }

    /// Column descriptors of `table`. Never fails: errors are reported in the response.
    pub async fn get_table_columns(
        &self,
        id: &str,
        database: Option<&str>,
        table: &str,
    ) -> TableColumnsResponse {
        let result = async {
            let stored = self.get_connection(id).await?;
            self.database
                .get_table_columns(&stored.config, database, table)
                .await
        }
        .await;

        match result {
            Ok(columns) => TableColumnsResponse {
                success: true,
                columns: Some(columns),
                error: None,
            },
            Err(e) => {
                warn!(connection_id = %id, table = %table, error = %e, "Column lookup failed");
                TableColumnsResponse {
                    success: false,
                    columns: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Bind service `name` in `environment` to stored connection `id`.
    pub async fn bind_service(
        &self,
        name: impl Into<String>,
        environment: Environment,
        id: &str,
        policy: AccessPolicy,
    ) -> DbResult<ServiceBinding> {
        let stored = self.get_connection(id).await?;
        let binding = ServiceBinding::new(name, environment, stored.config)
            .with_policy(policy)
            .with_connection_id(id);
        self.registry.register(binding.clone()).await;
        Ok(binding)
    }

    /// Endpoint or credentials differ. Passwords compare after decryption, so
    /// re-sealing the same secret is not a change.
    fn connection_changed(&self, old: &ConnectionConfig, new: &ConnectionConfig) -> bool {
        if old.key() != new.key() {
            return true;
        }
        if !old.connection_affecting_change(new) {
            return false;
        }
        *self.codec.reveal(&old.password) != *self.codec.reveal(&new.password)
    }
}

impl std::fmt::Debug for ConnectionCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCatalog").finish_non_exhaustive()
    }
}
