//! Service provider contract and registry
//!
//! A provider owns one kind of auxiliary resource and knows how to create
//! and destroy an isolated instance of it per sandbox. Deprovision must be
//! idempotent and tolerate partial prior provisioning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::sandbox::ServiceCredentials;
use crate::error::Result;

/// Capability set of a service provider
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Service type name
    fn service_type(&self) -> &str;

    /// Create resources for a sandbox and return connection credentials
    async fn provision(&self, sandbox_id: &str, service_name: &str) -> Result<ServiceCredentials>;

    /// Remove all resources of a sandbox; idempotent
    async fn deprovision(&self, sandbox_id: &str, service_name: &str) -> Result<()>;

    /// Check that the backing service is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Maps a service name to its provider
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ServiceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under a name. Registration happens once at
    /// startup; lookups are concurrent afterwards.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ServiceProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Health of every registered provider
    pub async fn health_check_all(&self) -> HashMap<String, Result<()>> {
        let mut results = HashMap::new();
        for (name, provider) in &self.providers {
            results.insert(name.clone(), provider.health_check().await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider;

    #[async_trait]
    impl ServiceProvider for NullProvider {
        fn service_type(&self) -> &str {
            "null"
        }

        async fn provision(&self, _: &str, _: &str) -> Result<ServiceCredentials> {
            Ok(ServiceCredentials::default())
        }

        async fn deprovision(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register("null", Arc::new(NullProvider));

        assert!(registry.get("null").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["null".to_string()]);
        assert_eq!(registry.get("null").expect("provider").service_type(), "null");

        let health = registry.health_check_all().await;
        assert!(health["null"].is_ok());
    }
}
