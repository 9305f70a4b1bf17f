//! ServiceRegistry - サービスファクトリの登録
//!
//! A service is what an app runs: the factory is looked up by the app's
//! `service` name when the system boots.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::config::AppConfig;
use super::node::ServiceNode;
use crate::error::{SpindleError, SpindleResult};

/// An app instance running on its own node.
pub trait ServiceApp: Send + Sync {
    /// Register handlers, spawn tasks. Called once, after the node is bound.
    fn start(&self, node: &Arc<ServiceNode>) -> SpindleResult<()>;

    /// Called once on shutdown, before the node stops.
    fn stop(&self, _node: &Arc<ServiceNode>) {}
}

pub type ServiceFactory = Arc<dyn Fn(&AppConfig) -> SpindleResult<Box<dyn ServiceApp>> + Send + Sync>;

/// RegistryError は ServiceRegistry の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("service '{0}' is not registered")]
    NotRegistered(String),
}

impl From<RegistryError> for SpindleError {
    fn from(err: RegistryError) -> Self {
        SpindleError::Argument(err.to_string())
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    factories: RwLock<HashMap<String, ServiceFactory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `factory`. A taken name fails and keeps its factory.
    pub fn register_service<F>(&self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&AppConfig) -> SpindleResult<Box<dyn ServiceApp>> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        debug!(service = %name, "service registered");
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn service_names(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn create(&self, app: &AppConfig) -> SpindleResult<Box<dyn ServiceApp>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&app.service)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(app.service.clone()))?;
        factory(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl ServiceApp for Idle {
        fn start(&self, _node: &Arc<ServiceNode>) -> SpindleResult<()> {
            Ok(())
        }
    }

    fn idle(_: &AppConfig) -> SpindleResult<Box<dyn ServiceApp>> {
        Ok(Box::new(Idle))
    }

    #[test]
    fn duplicate_service_name_fails() {
        let registry = ServiceRegistry::new();
        registry.register_service("idle", idle).unwrap();

        assert_eq!(
            registry.register_service("idle", idle),
            Err(RegistryError::AlreadyRegistered("idle".to_string()))
        );
        assert_eq!(registry.service_names(), vec!["idle".to_string()]);
    }

    #[test]
    fn create_uses_the_factory_of_the_app_service() {
        let registry = ServiceRegistry::new();
        registry.register_service("idle", idle).unwrap();

        assert!(registry.create(&AppConfig::new("a", "idle", 1)).is_ok());
        let missing = registry.create(&AppConfig::new("b", "ghost", 2));
        assert!(matches!(missing, Err(SpindleError::Argument(_))));
    }
}
