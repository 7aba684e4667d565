/*-
 * ========================LICENSE_START=================================
 * Hearth Orchestrator
 * %%
 * Copyright (C) 2023 - 2026 Hearth Project Developers
 * %%
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 * =========================LICENSE_END==================================
 */

pub mod queue;
pub mod reconcile;
pub mod task;
pub mod watchdog;

use crate::catalog::graph::{AppGraph, GraphError};
use crate::catalog::CatalogCache;
use crate::data::AppDataJanitor;
use crate::generator::{compose_integration_config, Generator, Transaction};
use crate::models::{
    AppName, AppStatus, InstallRequest, InstallResult, SsoStrategy, UninstallRequest,
    UninstallResult,
};
use crate::proxy::RouteGenerator;
use crate::rebuild::{RebuildEvent, RebuildResult, Rebuilder};
use crate::sso::identity::IdentityClient;
use crate::sso::BlueprintGenerator;
use crate::store::{AppStore, StoreError};
use reconcile::Reconciler;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use watchdog::HealthProber;

/// Drives one install or uninstall end-to-end. Business failures (rejected
/// plans, failed rebuilds, health timeouts) come back inside the result;
/// only infrastructure corruption surfaces as an error.
pub struct AppsService {
    store: AppStore,
    catalog: Arc<CatalogCache>,
    graph: RwLock<AppGraph>,
    generator: Generator,
    rebuilder: Arc<dyn Rebuilder>,
    routes: Arc<dyn RouteGenerator>,
    blueprints: BlueprintGenerator,
    identity: Arc<dyn IdentityClient>,
    reconciler: Arc<Reconciler>,
    prober: HealthProber,
    janitor: AppDataJanitor,
}

impl AppsService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: AppStore,
        catalog: Arc<CatalogCache>,
        generator: Generator,
        rebuilder: Arc<dyn Rebuilder>,
        routes: Arc<dyn RouteGenerator>,
        blueprints: BlueprintGenerator,
        identity: Arc<dyn IdentityClient>,
        reconciler: Arc<Reconciler>,
        prober: HealthProber,
        janitor: AppDataJanitor,
    ) -> Self {
        let graph = RwLock::new(AppGraph::from_definitions(catalog.get_all()));
        Self {
            store,
            catalog,
            graph,
            generator,
            rebuilder,
            routes,
            blueprints,
            identity,
            reconciler,
            prober,
            janitor,
        }
    }

    /// Seeds the planner's installed set from the store; called once at
    /// startup, before the first request is served.
    pub async fn init_installed_set(&self) -> Result<(), AppsServiceError> {
        self.refresh_installed_set().await
    }

    /// Rereads the catalog directory and rebuilds the dependency graph.
    pub async fn refresh_catalog(&self) -> Result<(), AppsServiceError> {
        self.catalog
            .refresh()
            .map_err(|err| AppsServiceError::Catalog {
                error: err.to_string(),
            })?;
        let mut graph = AppGraph::from_definitions(self.catalog.get_all());
        graph.set_installed(self.store.get_installed_names().await?);
        *self.graph.write().expect("graph lock poisoned") = graph;
        Ok(())
    }

    pub async fn install(
        &self,
        ctx: &CancellationToken,
        request: InstallRequest,
    ) -> Result<InstallResult, AppsServiceError> {
        let app = request.app;
        log::info!("Installing {app}");

        let plan = match self.graph.read().expect("graph lock poisoned").plan_install(&app) {
            Ok(plan) => plan,
            Err(GraphError::UnknownApp { .. }) => {
                return Ok(InstallResult::rejected(
                    app.clone(),
                    format!("cannot install {app}: unknown app"),
                ));
            }
        };
        if !plan.can_install {
            return Ok(InstallResult::rejected(
                app.clone(),
                format!(
                    "cannot install {app}: no compatible app provides {}",
                    plan.blockers.join(", ")
                ),
            ));
        }
        let Some(definition) = self.catalog.get(&app) else {
            return Ok(InstallResult::rejected(
                app.clone(),
                format!("cannot install {app}: unknown app"),
            ));
        };

        let config = compose_integration_config(&definition, &request.choices, &plan.auto_config);

        let current = self.generator.load_current()?;
        let mut transaction = current.clone().with_app(&app, config.clone());
        if definition.sso.strategy == SsoStrategy::Ldap {
            transaction.ldap_outpost_enable = true;
        }

        // Intent goes into the store before the fragment is touched so that
        // a crash between the two leaves a recoverable record.
        let mut apps_installed = vec![app.clone()];
        self.store
            .install(
                &app,
                &definition.display_name,
                &definition.version,
                &config,
                definition.port,
                definition.system,
            )
            .await?;
        for source in config.values() {
            if *source == app || self.store.is_installed(source).await? {
                continue;
            }
            let Some(source_definition) = self.catalog.get(source) else {
                log::warn!("Integration source {source} has no catalog entry, skipping");
                continue;
            };
            self.store
                .install(
                    source,
                    &source_definition.display_name,
                    &source_definition.version,
                    &BTreeMap::new(),
                    source_definition.port,
                    source_definition.system,
                )
                .await?;
            apps_installed.push(source.clone());
        }

        self.generate_sso_blueprints(&transaction).await;

        if log::log_enabled!(log::Level::Info) {
            for change in self.generator.diff(&current, &transaction) {
                log::info!("Transaction change: {change}");
            }
        }
        self.generator.apply(&transaction)?;

        let rebuild = self.rebuilder.switch(ctx).await;
        if !rebuild.success {
            log::error!(
                "Rebuild for {app} failed: {}",
                rebuild.error_message.as_deref().unwrap_or("unknown error")
            );
            for name in transaction.apps.keys() {
                if self.store.is_installed(name).await? {
                    self.store.update_status(name, AppStatus::Failed).await?;
                }
            }
            return Ok(InstallResult {
                app,
                success: false,
                error: rebuild
                    .error_message
                    .clone()
                    .or_else(|| Some(String::from("rebuild failed"))),
                apps_installed,
                rebuild_output: Some(rebuild.output),
                generation_info: None,
            });
        }

        if let Err(err) = self.rebuilder.reload_and_restart_apps(ctx).await {
            log::warn!("Cannot reload and restart app services: {err}");
        }

        for (name, _) in transaction.enabled_apps() {
            if !self.store.is_installed(name).await? {
                continue;
            }
            self.store.update_status(name, AppStatus::Starting).await?;
            let probe_definition = self.catalog.get(name);
            self.prober.spawn(
                name.clone(),
                probe_definition.as_ref().and_then(|d| d.port),
                probe_definition.and_then(|d| d.health_check),
            );
        }

        self.refresh_installed_set().await?;
        self.regenerate_routes_best_effort().await;
        self.spawn_reconcile();

        log::info!(
            "Installed {app} in {:?} ({} apps total)",
            rebuild.duration,
            apps_installed.len()
        );
        Ok(InstallResult {
            app,
            success: true,
            error: None,
            apps_installed,
            generation_info: crate::rebuild::generation_info(&rebuild.output),
            rebuild_output: Some(rebuild.output),
        })
    }

    pub async fn uninstall(
        &self,
        ctx: &CancellationToken,
        request: UninstallRequest,
    ) -> Result<UninstallResult, AppsServiceError> {
        let app = request.app;
        log::info!("Uninstalling {app} (clear_data: {})", request.clear_data);

        // Catalog metadata survives for the SSO cleanup even when the app is
        // already gone from the transaction.
        let definition = self.catalog.get(&app);

        if definition.as_ref().map(|d| d.system).unwrap_or(false) {
            return Ok(UninstallResult::rejected(
                app.clone(),
                format!("cannot uninstall {app}: system apps are managed by the platform"),
            ));
        }

        let plan = self.graph.read().expect("graph lock poisoned").plan_remove(&app);
        if !plan.can_remove {
            let blockers = plan
                .blockers
                .iter()
                .map(|dependent| dependent.app.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(UninstallResult::rejected(
                app.clone(),
                format!("cannot uninstall {app}: required by {blockers}"),
            ));
        }

        self.store.update_status(&app, AppStatus::Uninstalling).await?;

        let current = self.generator.load_current()?;
        if current.is_enabled(&app) {
            let mut transaction = current.disabling_app(&app);
            for entry in transaction.apps.values_mut() {
                entry.integrations.retain(|_, source| *source != app);
            }

            self.generator.apply(&transaction)?;
            let rebuild = self.rebuilder.switch(ctx).await;
            if !rebuild.success {
                log::error!(
                    "Rebuild for removing {app} failed: {}",
                    rebuild.error_message.as_deref().unwrap_or("unknown error")
                );
                return Ok(UninstallResult {
                    app,
                    success: false,
                    error: rebuild.error_message,
                    unconfigured: Vec::new(),
                });
            }

            if let Err(err) = self.rebuilder.stop_user_service(ctx, &app).await {
                log::warn!("Cannot stop service of {app}: {err}");
            }
        } else {
            // Orphaned row: nothing in the transaction, just make sure the
            // unit is down.
            if let Err(err) = self.rebuilder.stop_user_service(ctx, &app).await {
                log::warn!("Cannot stop service of {app}: {err}");
            }
        }

        self.store.uninstall(&app).await?;

        // Drop the wiring of optional dependents so no installed app points
        // at a source that no longer exists.
        let mut unconfigured: Vec<AppName> = Vec::new();
        for dependent in &plan.will_unconfigure {
            let Some(mut row) = self.store.get_by_name(&dependent.app).await? else {
                continue;
            };
            if row.integration_config.remove(&dependent.integration).is_some() {
                self.store
                    .update_integration_config(&dependent.app, &row.integration_config)
                    .await?;
            }
            if !unconfigured.contains(&dependent.app) {
                unconfigured.push(dependent.app.clone());
            }
        }

        self.refresh_installed_set().await?;
        self.regenerate_routes_best_effort().await;

        if let Err(err) = self.blueprints.delete_blueprint(&app) {
            log::warn!("Cannot delete SSO blueprint of {app}: {err}");
        }
        if let Some(definition) = &definition {
            if !definition.sso.strategy.is_none() && self.identity.is_available().await {
                if let Err(err) = self
                    .identity
                    .delete_app_sso(&app, &definition.display_name, definition.sso.strategy)
                    .await
                {
                    log::warn!("Cannot delete SSO resources of {app}: {err}");
                }
            }
        }

        if request.clear_data {
            let drop_database = definition
                .as_ref()
                .map(|d| d.uses_shared_database())
                .unwrap_or(false);
            if let Err(err) = self.janitor.clear(&app, drop_database).await {
                log::warn!("Cannot clear data of {app}: {err}");
            }
        }

        self.spawn_reconcile();

        log::info!("Uninstalled {app}");
        Ok(UninstallResult {
            app,
            success: true,
            error: None,
            unconfigured,
        })
    }

    pub async fn regenerate_routes(&self) -> Result<(), AppsServiceError> {
        let apps = self.store.get_all().await?;
        self.routes
            .generate(&apps)
            .await
            .map_err(|err| AppsServiceError::RouteGeneration {
                error: err.to_string(),
            })
    }

    pub async fn rollback(&self, ctx: &CancellationToken) -> RebuildResult {
        self.rebuilder.rollback(ctx).await
    }

    pub async fn rebuild_stream(
        &self,
        ctx: &CancellationToken,
        events: mpsc::Sender<RebuildEvent>,
    ) -> RebuildResult {
        self.rebuilder.switch_stream(ctx, events).await
    }

    pub async fn reconcile_state(&self) {
        self.reconciler.reconcile().await;
    }

    /// Emits the blueprints for every SSO-enabled app of the transaction and,
    /// when the identity API is reachable, materializes what needs the API.
    /// Everything here is best effort; the install proceeds regardless.
    async fn generate_sso_blueprints(&self, transaction: &Transaction) {
        let mut forward_auth_providers = Vec::new();
        let mut ldap_apps = Vec::new();

        for (name, _) in transaction.enabled_apps() {
            let Some(definition) = self.catalog.get(name) else {
                continue;
            };
            if definition.sso.strategy.is_none() {
                continue;
            }

            if let Err(err) = self.blueprints.generate_for_app(&definition) {
                log::warn!("Cannot write SSO blueprint for {name}: {err}");
            }

            match definition.sso.strategy {
                SsoStrategy::ForwardAuth => {
                    forward_auth_providers.push(BlueprintGenerator::provider_name(name));
                }
                SsoStrategy::Ldap => ldap_apps.push(name.clone()),
                _ => {}
            }
        }

        self.routes
            .set_authentik_enabled(!forward_auth_providers.is_empty());

        if let Err(err) = self
            .blueprints
            .generate_outpost_blueprint(&forward_auth_providers)
        {
            log::warn!("Cannot write outpost blueprint: {err}");
        }

        if !forward_auth_providers.is_empty() && self.identity.is_available().await {
            for provider in &forward_auth_providers {
                if let Err(err) = self.identity.add_provider_to_embedded_outpost(provider).await {
                    log::warn!("Cannot attach {provider} to the embedded outpost: {err}");
                }
            }
        }

        if !ldap_apps.is_empty() && self.identity.is_available().await {
            match self.blueprints.get_ldap_bind_password() {
                Ok(bind_password) => {
                    if let Err(err) = self
                        .identity
                        .ensure_ldap_infrastructure(&ldap_apps, &bind_password)
                        .await
                    {
                        log::warn!("Cannot ensure LDAP infrastructure: {err}");
                    }
                }
                Err(err) => log::warn!("Cannot read LDAP bind password: {err}"),
            }
        }
    }

    async fn refresh_installed_set(&self) -> Result<(), AppsServiceError> {
        let names = self.store.get_installed_names().await?;
        self.graph
            .write()
            .expect("graph lock poisoned")
            .set_installed(names);
        Ok(())
    }

    async fn regenerate_routes_best_effort(&self) {
        if let Err(err) = self.regenerate_routes().await {
            log::warn!("{err}");
        }
    }

    fn spawn_reconcile(&self) {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move { reconciler.reconcile().await });
    }
}

/// Defines error cases for the [`AppsService`]. Business rejections are not
/// errors; these are the infrastructure failures of the state database and
/// the generated fragment.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum AppsServiceError {
    #[error("State database failure: {error}")]
    Persistence { error: String },
    #[error("Cannot update the generated fragment: {error}")]
    Fragment { error: String },
    #[error("Cannot read the app catalog: {error}")]
    Catalog { error: String },
    #[error("Cannot regenerate routes: {error}")]
    RouteGeneration { error: String },
    #[error("The operation was cancelled.")]
    Cancelled,
    #[error("The operation queue is shut down.")]
    QueueStopped,
}

impl From<StoreError> for AppsServiceError {
    fn from(err: StoreError) -> Self {
        Self::Persistence {
            error: err.to_string(),
        }
    }
}

impl From<crate::generator::GeneratorError> for AppsServiceError {
    fn from(err: crate::generator::GeneratorError) -> Self {
        Self::Fragment {
            error: err.to_string(),
        }
    }
}
