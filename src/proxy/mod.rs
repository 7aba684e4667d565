use crate::models::InstalledApp;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Regenerates the reverse-proxy route fragment from the set of installed
/// apps. Called after every install and uninstall; failures are logged by the
/// caller and never fail the surrounding operation.
#[async_trait]
pub trait RouteGenerator: Send + Sync {
    async fn generate(&self, apps: &[InstalledApp]) -> anyhow::Result<()>;

    /// Whether generated routes should attach the forward-auth middleware.
    fn set_authentik_enabled(&self, enabled: bool);

    fn preview(&self, apps: &[InstalledApp]) -> String;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RouteFragment<'a> {
    authentik_enabled: bool,
    routes: Vec<Route<'a>>,
}

#[derive(Serialize)]
struct Route<'a> {
    app: &'a str,
    port: u16,
}

/// Writes a JSON route fragment the proxy renderer consumes; the actual
/// reverse-proxy configuration is generated outside this crate.
pub struct FileRouteGenerator {
    routes_path: PathBuf,
    authentik_enabled: AtomicBool,
}

impl FileRouteGenerator {
    pub fn new(routes_path: impl Into<PathBuf>) -> Self {
        Self {
            routes_path: routes_path.into(),
            authentik_enabled: AtomicBool::new(false),
        }
    }

    fn fragment<'a>(&self, apps: &'a [InstalledApp]) -> RouteFragment<'a> {
        RouteFragment {
            authentik_enabled: self.authentik_enabled.load(Ordering::Relaxed),
            routes: apps
                .iter()
                .filter_map(|app| {
                    app.port.map(|port| Route {
                        app: app.name.as_str(),
                        port,
                    })
                })
                .collect(),
        }
    }
}

#[async_trait]
impl RouteGenerator for FileRouteGenerator {
    async fn generate(&self, apps: &[InstalledApp]) -> anyhow::Result<()> {
        if let Some(parent) = self.routes_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut rendered = self.preview(apps);
        rendered.push('\n');

        let temp_path = self.routes_path.with_extension("tmp");
        tokio::fs::write(&temp_path, rendered).await?;
        tokio::fs::rename(&temp_path, &self.routes_path).await?;

        log::debug!("Regenerated routes for {} apps", apps.len());
        Ok(())
    }

    fn set_authentik_enabled(&self, enabled: bool) {
        self.authentik_enabled.store(enabled, Ordering::Relaxed);
    }

    fn preview(&self, apps: &[InstalledApp]) -> String {
        serde_json::to_string_pretty(&self.fragment(apps))
            .expect("route fragment serialization is infallible")
    }
}
