use crate::catalog::CatalogCache;
use crate::configurator::{ConfiguratorContext, ConfiguratorRegistry};
use crate::models::{AppName, AppStatus, InstalledApp};
use crate::store::AppStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Topological layering of the installed apps over their
/// `integration_config` edges. Edges to apps that are not installed are
/// ignored. Level 0 has no installed dependencies; level n is
/// `max(level(deps)) + 1`. Apps within a level are sorted by name so the
/// result is stable for a given input.
pub fn compute_levels(apps: &[InstalledApp]) -> Vec<Vec<AppName>> {
    let installed: BTreeSet<&AppName> = apps.iter().map(|app| &app.name).collect();

    let mut remaining: BTreeMap<&AppName, BTreeSet<&AppName>> = apps
        .iter()
        .map(|app| {
            let dependencies = app
                .integration_config
                .values()
                .filter(|source| installed.contains(*source) && **source != app.name)
                .collect();
            (&app.name, dependencies)
        })
        .collect();

    let mut levels = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<AppName> = remaining
            .iter()
            .filter(|(_, dependencies)| dependencies.is_empty())
            .map(|(name, _)| (*name).clone())
            .collect();

        if ready.is_empty() {
            // The graph is acyclic by construction; if a cycle sneaks in
            // through hand-edited state, configure the rest as one level
            // rather than spinning.
            log::warn!(
                "Dependency cycle among {} apps, flattening into one level",
                remaining.len()
            );
            levels.push(remaining.keys().map(|name| (*name).clone()).collect());
            break;
        }

        for name in &ready {
            remaining.remove(name);
        }
        for dependencies in remaining.values_mut() {
            dependencies.retain(|dependency| !ready.contains(*dependency));
        }
        levels.push(ready);
    }

    levels
}

/// Runs the three configuration phases over all installed apps: PreStart for
/// everyone first, then per dependency level HealthCheck and PostStart.
/// Reconciling is idempotent and never mutates the app store; phase failures
/// are logged and the next reconcile retries them.
pub struct Reconciler {
    store: AppStore,
    catalog: Arc<CatalogCache>,
    registry: ConfiguratorRegistry,
    health_check_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: AppStore,
        catalog: Arc<CatalogCache>,
        registry: ConfiguratorRegistry,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            registry,
            health_check_timeout,
        }
    }

    pub async fn reconcile(&self) {
        let apps = match self.store.get_all().await {
            Ok(apps) => apps
                .into_iter()
                .filter(|app| app.status != AppStatus::Uninstalling)
                .collect::<Vec<_>>(),
            Err(err) => {
                log::error!("Cannot load apps for reconciliation: {err}");
                return;
            }
        };

        log::debug!("Reconciling {} apps", apps.len());

        for app in &apps {
            let Some(configurator) = self.registry.get(&app.name) else {
                continue;
            };
            let context = self.context(app);
            if let Err(err) = configurator.pre_start(&context).await {
                log::warn!("PreStart of {} failed: {err}", app.name);
            }
        }

        let by_name: BTreeMap<&AppName, &InstalledApp> =
            apps.iter().map(|app| (&app.name, app)).collect();

        for level in compute_levels(&apps) {
            let configurations = level.iter().filter_map(|name| {
                by_name
                    .get(name)
                    .map(|app| self.configure_app(app))
            });
            futures::future::join_all(configurations).await;
        }
    }

    fn context(&self, app: &InstalledApp) -> ConfiguratorContext {
        ConfiguratorContext {
            app: app.clone(),
            definition: self.catalog.get(&app.name),
        }
    }

    /// HealthCheck bounded by the configured timeout; PostStart only runs
    /// after a healthy answer.
    async fn configure_app(&self, app: &InstalledApp) {
        let Some(configurator) = self.registry.get(&app.name) else {
            return;
        };
        let context = self.context(app);

        let health = tokio::time::timeout(
            self.health_check_timeout,
            configurator.health_check(&context),
        )
        .await;

        match health {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::warn!("HealthCheck of {} failed, skipping PostStart: {err}", app.name);
                return;
            }
            Err(_) => {
                log::warn!(
                    "HealthCheck of {} timed out after {:?}, skipping PostStart",
                    app.name,
                    self.health_check_timeout
                );
                return;
            }
        }

        if let Err(err) = configurator.post_start(&context).await {
            log::warn!("PostStart of {} failed: {err}", app.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurator::recording::RecordingConfigurator;
    use chrono::Utc;
    use std::str::FromStr;
    use std::sync::Mutex;

    fn name(name: &str) -> AppName {
        AppName::from_str(name).unwrap()
    }

    fn installed(app: &str, wiring: &[(&str, &str)]) -> InstalledApp {
        InstalledApp {
            name: name(app),
            display_name: app.to_string(),
            version: String::from("latest"),
            port: Some(8080),
            system: false,
            status: AppStatus::Running,
            integration_config: wiring
                .iter()
                .map(|(integration, source)| (integration.to_string(), name(source)))
                .collect(),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn levels_of_a_chain() {
        let apps = vec![
            installed("a", &[("dep", "b")]),
            installed("b", &[("dep", "c")]),
            installed("c", &[]),
        ];

        assert_eq!(
            compute_levels(&apps),
            vec![vec![name("c")], vec![name("b")], vec![name("a")]]
        );
    }

    #[test]
    fn edges_to_apps_that_are_not_installed_are_ignored() {
        let apps = vec![
            installed("a", &[("dep", "ghost")]),
            installed("b", &[("dep", "gone")]),
        ];

        assert_eq!(compute_levels(&apps), vec![vec![name("a"), name("b")]]);
    }

    #[test]
    fn diamond_dependencies_share_a_level() {
        let apps = vec![
            installed("top", &[("left", "l"), ("right", "r")]),
            installed("l", &[("dep", "base")]),
            installed("r", &[("dep", "base")]),
            installed("base", &[]),
        ];

        assert_eq!(
            compute_levels(&apps),
            vec![
                vec![name("base")],
                vec![name("l"), name("r")],
                vec![name("top")],
            ]
        );
    }

    #[test]
    fn no_apps_means_no_levels() {
        assert!(compute_levels(&[]).is_empty());
    }

    #[test]
    fn hand_edited_cycles_flatten_instead_of_spinning() {
        let apps = vec![
            installed("a", &[("dep", "b")]),
            installed("b", &[("dep", "a")]),
        ];

        assert_eq!(compute_levels(&apps), vec![vec![name("a"), name("b")]]);
    }

    async fn store_with(apps: Vec<InstalledApp>) -> AppStore {
        let store = AppStore::in_memory().await;
        for app in apps {
            store
                .install(
                    &app.name,
                    &app.display_name,
                    &app.version,
                    &app.integration_config,
                    app.port,
                    app.system,
                )
                .await
                .unwrap();
            store.update_status(&app.name, app.status).await.unwrap();
        }
        store
    }

    fn empty_catalog() -> Arc<CatalogCache> {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogCache::load(dir.path()).unwrap());
        // the tempdir may go away, the cache has already read it
        drop(dir);
        catalog
    }

    #[tokio::test]
    async fn health_check_runs_before_dependent_post_start() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConfiguratorRegistry::default();
        registry.register(Arc::new(RecordingConfigurator::new(
            "qbittorrent",
            journal.clone(),
        )));
        registry.register(Arc::new(RecordingConfigurator::new("radarr", journal.clone())));

        let store = store_with(vec![
            installed("radarr", &[("download-client", "qbittorrent")]),
            installed("qbittorrent", &[]),
        ])
        .await;

        let reconciler = Reconciler::new(
            store,
            empty_catalog(),
            registry,
            Duration::from_secs(5),
        );
        reconciler.reconcile().await;

        let journal = journal.lock().unwrap().clone();
        let position = |entry: &str| {
            journal
                .iter()
                .position(|recorded| recorded == entry)
                .unwrap_or_else(|| panic!("missing {entry} in {journal:?}"))
        };

        // PreStart for everyone before any level runs
        assert!(position("pre-start radarr") < position("health-check qbittorrent"));
        assert!(position("pre-start qbittorrent") < position("health-check qbittorrent"));
        // strict level order
        assert!(position("health-check qbittorrent") < position("post-start radarr"));
        assert!(position("post-start qbittorrent") < position("health-check radarr"));
    }

    #[tokio::test]
    async fn failed_health_check_skips_post_start() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConfiguratorRegistry::default();
        registry.register(Arc::new(
            RecordingConfigurator::new("radarr", journal.clone()).with_failing_health_check(),
        ));

        let store = store_with(vec![installed("radarr", &[])]).await;
        let reconciler = Reconciler::new(
            store,
            empty_catalog(),
            registry,
            Duration::from_secs(5),
        );
        reconciler.reconcile().await;

        let journal = journal.lock().unwrap().clone();
        assert!(journal.contains(&String::from("health-check radarr")));
        assert!(!journal.contains(&String::from("post-start radarr")));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_over_store_state() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConfiguratorRegistry::default();
        registry.register(Arc::new(RecordingConfigurator::new("radarr", journal.clone())));

        let store = store_with(vec![installed("radarr", &[])]).await;
        let reconciler = Reconciler::new(
            store.clone(),
            empty_catalog(),
            registry,
            Duration::from_secs(5),
        );

        reconciler.reconcile().await;
        let after_first = store.get_all().await.unwrap();
        reconciler.reconcile().await;
        let after_second = store.get_all().await.unwrap();

        assert_eq!(after_first, after_second);
        // each run fires the same phases once
        assert_eq!(journal.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn uninstalling_apps_are_left_alone() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConfiguratorRegistry::default();
        registry.register(Arc::new(RecordingConfigurator::new("radarr", journal.clone())));

        let store = AppStore::in_memory().await;
        store
            .install(
                &name("radarr"),
                "Radarr",
                "latest",
                &BTreeMap::new(),
                Some(7878),
                false,
            )
            .await
            .unwrap();
        store
            .update_status(&name("radarr"), AppStatus::Uninstalling)
            .await
            .unwrap();

        let reconciler = Reconciler::new(
            store,
            empty_catalog(),
            registry,
            Duration::from_secs(5),
        );
        reconciler.reconcile().await;

        assert!(journal.lock().unwrap().is_empty());
    }
}
