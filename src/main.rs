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

use clap::Parser;
use hearthd::apps::queue::OperationQueue;
use hearthd::apps::reconcile::Reconciler;
use hearthd::apps::watchdog::{HealthProber, StateWatchdog};
use hearthd::apps::AppsService;
use hearthd::catalog::CatalogCache;
use hearthd::config::{CliArgs, Config};
use hearthd::configurator::ConfiguratorRegistry;
use hearthd::data::AppDataJanitor;
use hearthd::generator::Generator;
use hearthd::proxy::{FileRouteGenerator, RouteGenerator};
use hearthd::rebuild::{CommandRebuilder, Rebuilder};
use hearthd::sso::identity::{AuthentikClient, IdentityClient, UnconfiguredIdentityClient};
use hearthd::sso::BlueprintGenerator;
use hearthd::store::AppStore;
use sqlx::sqlite::SqliteConnectOptions;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = CliArgs::parse();
    let config = match Config::from_figment(&cli) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Cannot load config: {err}");
            process::exit(0x0100);
        }
    };

    if let Err(err) = run(config).await {
        log::error!("Orchestrator failed: {err}");
        process::exit(0x0200);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    if let Some(parent) = config.state_db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pool = AppStore::connect_with_exponential_backoff(
        SqliteConnectOptions::new()
            .filename(&config.state_db)
            .create_if_missing(true),
    )
    .await?;
    AppStore::migrate(&pool).await?;
    let store = AppStore::new(pool);

    let catalog = Arc::new(CatalogCache::load(&config.catalog_dir)?);
    let rebuilder: Arc<dyn Rebuilder> = Arc::new(CommandRebuilder::new(
        config.rebuild.switch_command.clone(),
        config.rebuild.rollback_command.clone(),
        config.rebuild.service_prefix.clone(),
    ));
    let routes: Arc<dyn RouteGenerator> = Arc::new(FileRouteGenerator::new(&config.routes_path));
    let identity: Arc<dyn IdentityClient> = match &config.identity {
        Some(identity) => Arc::new(AuthentikClient::new(
            identity.url.clone(),
            identity.token.clone(),
        )),
        None => Arc::new(UnconfiguredIdentityClient),
    };

    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        catalog.clone(),
        ConfiguratorRegistry::default(),
        config.timeouts.health_check_timeout(),
    ));
    let prober = HealthProber::new(
        store.clone(),
        config.timeouts.probe_http_timeout(),
        shutdown.clone(),
    );

    let service = Arc::new(AppsService::new(
        store.clone(),
        catalog.clone(),
        Generator::new(&config.fragment_path),
        rebuilder.clone(),
        routes,
        BlueprintGenerator::new(&config.blueprint_dir, &config.base_domain),
        identity,
        reconciler,
        prober.clone(),
        AppDataJanitor::new(&config.data_root, config.rebuild.drop_database_command.clone()),
    ));
    service.init_installed_set().await?;

    // Keep the planner's installed set in sync with every store mutation.
    {
        let service = service.clone();
        store.set_on_change(move |app_name| {
            log::debug!("App store changed: {app_name}");
            let service = service.clone();
            tokio::spawn(async move {
                if let Err(err) = service.init_installed_set().await {
                    log::warn!("Cannot refresh the installed set: {err}");
                }
            });
        });
    }

    let watchdog = Arc::new(StateWatchdog::new(
        store,
        catalog,
        rebuilder,
        prober,
        config.timeouts.watchdog(),
    ));
    watchdog.startup_reconciliation().await;
    {
        let watchdog = watchdog.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { watchdog.run(shutdown).await });
    }

    let queue = OperationQueue::start(service.clone(), config.timeouts.batch_wait());

    // Bring already-installed apps back into their configured shape.
    {
        let service = service.clone();
        tokio::spawn(async move { service.reconcile_state().await });
    }

    log::info!("Hearth orchestrator is ready");
    tokio::signal::ctrl_c().await?;

    log::info!("Shutting down");
    queue.stop().await;
    shutdown.cancel();

    Ok(())
}
