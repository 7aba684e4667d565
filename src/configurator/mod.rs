use crate::models::{AppDefinition, InstalledApp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a configurator phase may need about the app it drives.
pub struct ConfiguratorContext {
    pub app: InstalledApp,
    pub definition: Option<AppDefinition>,
}

impl ConfiguratorContext {
    pub fn base_url(&self) -> Option<String> {
        self.app.port.map(|port| format!("http://localhost:{port}"))
    }
}

/// Three-phase contract a per-app configurator implements. PreStart prepares
/// directories and configuration files, HealthCheck waits for the app to
/// answer, PostStart drives the app's own API (download clients, root
/// folders, OIDC providers, LDAP binds, …).
#[async_trait]
pub trait Configurator: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_start(&self, ctx: &ConfiguratorContext) -> anyhow::Result<()>;

    async fn health_check(&self, ctx: &ConfiguratorContext) -> anyhow::Result<()>;

    async fn post_start(&self, ctx: &ConfiguratorContext) -> anyhow::Result<()>;
}

/// app name → configurator. Apps without an entry need no per-app
/// configuration; the reconciler treats every phase as a no-op for them.
#[derive(Clone, Default)]
pub struct ConfiguratorRegistry {
    configurators: HashMap<String, Arc<dyn Configurator>>,
}

impl ConfiguratorRegistry {
    pub fn register(&mut self, configurator: Arc<dyn Configurator>) {
        self.configurators
            .insert(configurator.name().to_string(), configurator);
    }

    pub fn get(&self, app_name: &str) -> Option<Arc<dyn Configurator>> {
        self.configurators.get(app_name).cloned()
    }
}
