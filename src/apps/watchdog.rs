use crate::catalog::CatalogCache;
use crate::models::{AppName, AppStatus, HealthCheckConfig, InstalledApp};
use crate::rebuild::Rebuilder;
use crate::store::AppStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Apps without a configured health check are considered up after this grace
/// period.
const NO_HEALTH_CHECK_GRACE: Duration = Duration::from_secs(3);

fn is_healthy_status(status: reqwest::StatusCode) -> bool {
    // 401/403 mean the service is up but demands auth.
    status.is_success()
        || status.is_redirection()
        || status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
}

/// Spawns detached per-app probes that promote `starting` apps to `running`
/// on the first healthy answer, or to `error` when the deadline passes.
#[derive(Clone)]
pub struct HealthProber {
    store: AppStore,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl HealthProber {
    pub fn new(store: AppStore, http_timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            store,
            client: reqwest::Client::builder()
                .timeout(http_timeout)
                .build()
                .expect("reqwest client construction is infallible"),
            shutdown,
        }
    }

    pub async fn probe_once(&self, port: u16, health_check: &HealthCheckConfig) -> bool {
        let url = format!("http://localhost:{port}{}", health_check.path);
        match self.client.get(&url).send().await {
            Ok(response) => is_healthy_status(response.status()),
            Err(err) => {
                log::debug!("Probe of {url} failed: {err}");
                false
            }
        }
    }

    pub fn spawn(
        &self,
        app: AppName,
        port: Option<u16>,
        health_check: Option<HealthCheckConfig>,
    ) {
        let prober = self.clone();
        tokio::spawn(async move {
            let (port, health_check) = match (port, health_check) {
                (Some(port), Some(health_check)) => (port, health_check),
                _ => {
                    // Nothing to observe; assume the service came up.
                    tokio::select! {
                        _ = tokio::time::sleep(NO_HEALTH_CHECK_GRACE) => {}
                        _ = prober.shutdown.cancelled() => return,
                    }
                    if let Err(err) = prober.store.update_status(&app, AppStatus::Running).await {
                        log::warn!("Cannot promote {app} to running: {err}");
                    }
                    return;
                }
            };

            let interval = Duration::from_secs(health_check.interval_secs);
            let deadline =
                tokio::time::Instant::now() + Duration::from_secs(health_check.timeout_secs);

            loop {
                if prober.probe_once(port, &health_check).await {
                    log::info!("{app} answered its health check, promoting to running");
                    if let Err(err) = prober.store.update_status(&app, AppStatus::Running).await {
                        log::warn!("Cannot promote {app} to running: {err}");
                    }
                    return;
                }

                if tokio::time::Instant::now() + interval >= deadline {
                    log::warn!(
                        "{app} did not become healthy within {}s",
                        health_check.timeout_secs
                    );
                    if let Err(err) = prober.store.update_status(&app, AppStatus::Error).await {
                        log::warn!("Cannot mark {app} as errored: {err}");
                    }
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = prober.shutdown.cancelled() => return,
                }
            }
        });
    }
}

pub struct WatchdogTimeouts {
    pub interval: Duration,
    pub installing: Duration,
    pub starting: Duration,
    pub uninstalling: Duration,
}

impl Default for WatchdogTimeouts {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            installing: Duration::from_secs(600),
            starting: Duration::from_secs(300),
            uninstalling: Duration::from_secs(600),
        }
    }
}

/// Periodic sweep recovering apps stuck in transitional states. The watchdog
/// never deletes rows and never touches integration configs; all it does is
/// move `status` based on `updated_at` age and live health observations.
pub struct StateWatchdog {
    store: AppStore,
    catalog: Arc<CatalogCache>,
    rebuilder: Arc<dyn Rebuilder>,
    prober: HealthProber,
    timeouts: WatchdogTimeouts,
}

impl StateWatchdog {
    pub fn new(
        store: AppStore,
        catalog: Arc<CatalogCache>,
        rebuilder: Arc<dyn Rebuilder>,
        prober: HealthProber,
        timeouts: WatchdogTimeouts,
    ) -> Self {
        Self {
            store,
            catalog,
            rebuilder,
            prober,
            timeouts,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        log::info!(
            "State watchdog running every {:?}",
            self.timeouts.interval
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.timeouts.interval) => {}
                _ = shutdown.cancelled() => {
                    log::info!("Shutting down state watchdog");
                    return;
                }
            }
            self.sweep().await;
        }
    }

    /// One pass over all rows; every decision is based on `updated_at` age
    /// and, where needed, a single live probe.
    pub async fn sweep(&self) {
        let apps = match self.store.get_all().await {
            Ok(apps) => apps,
            Err(err) => {
                log::error!("Watchdog cannot load apps: {err}");
                return;
            }
        };

        for app in apps {
            let age = (Utc::now() - app.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);

            let stuck_after = match app.status {
                AppStatus::Installing => Some(self.timeouts.installing),
                AppStatus::Starting => Some(self.timeouts.starting),
                AppStatus::Uninstalling => Some(self.timeouts.uninstalling),
                _ => None,
            };

            if let Some(stuck_after) = stuck_after {
                if age > stuck_after {
                    log::warn!(
                        "{} stuck in {} for {age:?}, marking as error",
                        app.name,
                        app.status
                    );
                    self.set_status(&app.name, AppStatus::Error).await;
                }
                continue;
            }

            match app.status {
                AppStatus::Running if !app.system => {
                    if let Some(false) = self.observe(&app).await {
                        log::warn!("{} stopped answering its health check", app.name);
                        self.set_status(&app.name, AppStatus::Error).await;
                    }
                }
                AppStatus::Error | AppStatus::Failed => {
                    if let Some(true) = self.observe(&app).await {
                        log::info!("{} answers again, recovering to running", app.name);
                        self.set_status(&app.name, AppStatus::Running).await;
                    }
                }
                _ => {}
            }
        }
    }

    /// Re-checks every errored or failed app right away.
    pub async fn recheck_failed_apps(&self) {
        let apps = match self.store.get_all().await {
            Ok(apps) => apps,
            Err(err) => {
                log::error!("Cannot load apps for recheck: {err}");
                return;
            }
        };

        for app in apps {
            if matches!(app.status, AppStatus::Error | AppStatus::Failed) {
                if let Some(true) = self.observe(&app).await {
                    log::info!("{} answers again, recovering to running", app.name);
                    self.set_status(&app.name, AppStatus::Running).await;
                }
            }
        }
    }

    /// Called once on boot: registers active system apps and repairs rows
    /// the previous run left in transitional states.
    pub async fn startup_reconciliation(&self) {
        for definition in self.catalog.get_all() {
            if !definition.system {
                continue;
            }
            if self.rebuilder.is_service_active(&definition.name).await {
                if let Err(err) = self
                    .store
                    .ensure_system_app(&definition.name, &definition.display_name, definition.port)
                    .await
                {
                    log::warn!("Cannot register system app {}: {err}", definition.name);
                }
            }
        }

        let apps = match self.store.get_all().await {
            Ok(apps) => apps,
            Err(err) => {
                log::error!("Cannot load apps for startup reconciliation: {err}");
                return;
            }
        };

        for app in apps {
            match app.status {
                AppStatus::Installing | AppStatus::Uninstalling => {
                    log::warn!(
                        "{} was {} when the orchestrator stopped, marking as error",
                        app.name,
                        app.status
                    );
                    self.set_status(&app.name, AppStatus::Error).await;
                }
                AppStatus::Starting => {
                    log::info!("Resuming health checks for {}", app.name);
                    self.spawn_probe(&app);
                }
                // System apps included: their registration upsert above is a
                // no-op for an existing row, so this is the only place a
                // stale `running` survives a downtime of the orchestrator.
                AppStatus::Running => {
                    if !self.rebuilder.is_service_active(&app.name).await {
                        log::warn!(
                            "{} claims to be running but its service unit is inactive",
                            app.name
                        );
                        self.set_status(&app.name, AppStatus::Starting).await;
                        self.spawn_probe(&app);
                    }
                }
                _ => {}
            }
        }
    }

    fn spawn_probe(&self, app: &InstalledApp) {
        let health_check = self
            .catalog
            .get(&app.name)
            .and_then(|definition| definition.health_check);
        self.prober.spawn(app.name.clone(), app.port, health_check);
    }

    async fn set_status(&self, app: &AppName, status: AppStatus) {
        if let Err(err) = self.store.update_status(app, status).await {
            log::error!("Watchdog cannot update {app} to {status}: {err}");
        }
    }

    /// `None` when the app exposes nothing to probe.
    async fn observe(&self, app: &InstalledApp) -> Option<bool> {
        let health_check = self
            .catalog
            .get(&app.name)
            .and_then(|definition| definition.health_check)?;
        let port = app.port?;
        Some(self.prober.probe_once(port, &health_check).await)
    }
}
