//! Logical service name registry.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, Environment, ServiceBinding, ServiceSummary};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

type BindingKey = (String, Environment);

/// Maps `(service name, environment)` to the binding that serves it.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    bindings: RwLock<HashMap<BindingKey, ServiceBinding>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding, returning the one it replaced.
    pub async fn register(&self, binding: ServiceBinding) -> Option<ServiceBinding> {
        info!(
            service = %binding.name,
            environment = %binding.environment,
            connection = %binding.connection.key(),
            "Registering service"
        );
        let key = (binding.name.clone(), binding.environment);
        self.bindings.write().await.insert(key, binding)
    }

    pub async fn resolve(&self, name: &str, environment: Environment) -> Option<ServiceBinding> {
        self.bindings
            .read()
            .await
            .get(&(name.to_string(), environment))
            .cloned()
    }

    /// Whether `name` is bound in any environment.
    pub async fn contains(&self, name: &str) -> bool {
        self.bindings.read().await.keys().any(|(n, _)| n == name)
    }

    pub async fn remove(&self, name: &str, environment: Environment) -> Option<ServiceBinding> {
        self.bindings
            .write()
            .await
            .remove(&(name.to_string(), environment))
    }

    /// Add a grant to every environment of service `name`.
    pub async fn grant<I, S>(&self, name: &str, caller_class: &str, procedures: I) -> DbResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let procedures: Vec<String> = procedures
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        let mut bindings = self.bindings.write().await;
        let mut matched = false;
        for binding in bindings.values_mut().filter(|b| b.name == name) {
            binding.policy.add_grant(caller_class, &procedures);
            matched = true;
        }
        if !matched {
            return Err(DbError::validation(format!(
                "Cannot grant access on unknown service '{}'",
                name
            )));
        }
        Ok(())
    }

    /// Credential-free view of every binding, sorted by name then environment.
    pub async fn list(&self) -> Vec<ServiceSummary> {
        let mut summaries: Vec<ServiceSummary> = self
            .bindings
            .read()
            .await
            .values()
            .map(ServiceSummary::from)
            .collect();
        summaries.sort_by(|a, b| {
            (a.name.as_str(), a.environment.as_str()).cmp(&(b.name.as_str(), b.environment.as_str()))
        });
        summaries
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }

    /// Bindings created from catalog connection `connection_id`.
    pub async fn dependents_of(&self, connection_id: &str) -> Vec<ServiceBinding> {
        self.bindings
            .read()
            .await
            .values()
            .filter(|b| b.connection_id.as_deref() == Some(connection_id))
            .cloned()
            .collect()
    }

    /// Remove every binding created from `connection_id`; returns how many.
    pub async fn remove_dependents(&self, connection_id: &str) -> usize {
        let mut bindings = self.bindings.write().await;
        let before = bindings.len();
        bindings.retain(|_, b| b.connection_id.as_deref() != Some(connection_id));
        let removed = before - bindings.len();
        if removed > 0 {
            info!(connection_id = %connection_id, removed, "Removed dependent services");
        }
        removed
    }

    /// Point every binding created from `connection_id` at `config`.
    pub async fn update_connection(&self, connection_id: &str, config: &ConnectionConfig) -> usize {
        let mut bindings = self.bindings.write().await;
        let mut updated = 0;
        for binding in bindings
            .values_mut()
            .filter(|b| b.connection_id.as_deref() == Some(connection_id))
        {
            binding.connection = config.clone();
            updated += 1;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccessPolicy;

    fn binding(name: &str, environment: Environment) -> ServiceBinding {
        ServiceBinding::new(name, environment, ConnectionConfig::sqlite(":memory:"))
    }

    #[tokio::test]
    async fn test_resolve_by_environment() {
        let registry = ServiceRegistry::new();
        registry.register(binding("orders", Environment::Production)).await;

        assert!(registry.resolve("orders", Environment::Production).await.is_some());
        assert!(registry.resolve("orders", Environment::Staging).await.is_none());
        assert!(registry.resolve("missing", Environment::Production).await.is_none());
        assert!(registry.contains("orders").await);
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let registry = ServiceRegistry::new();
        assert!(registry.register(binding("orders", Environment::Production)).await.is_none());
        assert!(registry.register(binding("orders", Environment::Production)).await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_grant_applies_to_all_environments() {
        let registry = ServiceRegistry::new();
        registry.register(binding("orders", Environment::Production)).await;
        registry.register(binding("orders", Environment::Staging)).await;

        registry.grant("orders", "support", ["get_orders"]).await.unwrap();
        for env in [Environment::Production, Environment::Staging] {
            let b = registry.resolve("orders", env).await.unwrap();
            assert!(b.policy.allows("support", "GET_ORDERS"));
        }

        let err = registry.grant("billing", "support", ["x"]).await.unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_dependents() {
        let registry = ServiceRegistry::new();
        registry
            .register(binding("a", Environment::Production).with_connection_id("conn-1"))
            .await;
        registry
            .register(
                binding("b", Environment::Staging)
                    .with_connection_id("conn-1")
                    .with_policy(AccessPolicy::new().grant("admin", ["*"])),
            )
            .await;
        registry
            .register(binding("c", Environment::Production).with_connection_id("conn-2"))
            .await;

        assert_eq!(registry.dependents_of("conn-1").await.len(), 2);
        assert_eq!(
            registry
                .update_connection("conn-2", &ConnectionConfig::sqlite("other.db"))
                .await,
            1
        );
        assert_eq!(registry.remove_dependents("conn-1").await, 2);
        assert!(registry.dependents_of("conn-1").await.is_empty());

        let names: Vec<String> = registry.list().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["c"]);
    }
}
