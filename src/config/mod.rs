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

use crate::apps::watchdog::WatchdogTimeouts;
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::value::{Dict, Map, Tag, Value};
use figment::{Metadata, Profile};
use secstr::SecUtf8;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Default, Parser)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Sets a custom config file
    #[clap(short, long, value_parser, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sets the catalog directory holding the app definitions
    #[clap(long)]
    catalog_dir: Option<PathBuf>,

    /// Sets the domain apps are served under, e.g. home.example
    #[clap(long)]
    base_domain: Option<String>,
}

impl figment::Provider for CliArgs {
    fn metadata(&self) -> Metadata {
        Metadata::named("cli arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let mut dict = Dict::new();

        if let Some(catalog_dir) = &self.catalog_dir {
            dict.insert(
                String::from("catalogDir"),
                Value::String(Tag::Default, catalog_dir.display().to_string()),
            );
        }

        if let Some(base_domain) = &self.base_domain {
            dict.insert(
                String::from("baseDomain"),
                Value::String(Tag::Default, base_domain.clone()),
            );
        }

        let mut data = Map::new();
        data.insert(Profile::Default, dict);

        Ok(data)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "Config::default_catalog_dir")]
    pub catalog_dir: PathBuf,
    #[serde(default = "Config::default_fragment_path")]
    pub fragment_path: PathBuf,
    #[serde(default = "Config::default_routes_path")]
    pub routes_path: PathBuf,
    #[serde(default = "Config::default_blueprint_dir")]
    pub blueprint_dir: PathBuf,
    #[serde(default = "Config::default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "Config::default_state_db")]
    pub state_db: PathBuf,
    #[serde(default = "Config::default_base_domain")]
    pub base_domain: String,
    #[serde(default)]
    pub identity: Option<IdentityConfig>,
    #[serde(default)]
    pub rebuild: RebuildConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    pub url: Url,
    pub token: SecUtf8,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildConfig {
    #[serde(default = "RebuildConfig::default_switch_command")]
    pub switch_command: Vec<String>,
    #[serde(default = "RebuildConfig::default_rollback_command")]
    pub rollback_command: Vec<String>,
    #[serde(default = "RebuildConfig::default_service_prefix")]
    pub service_prefix: String,
    #[serde(default = "RebuildConfig::default_drop_database_command")]
    pub drop_database_command: Vec<String>,
}

impl RebuildConfig {
    fn default_switch_command() -> Vec<String> {
        vec![String::from("hearth-rebuild"), String::from("switch")]
    }

    fn default_rollback_command() -> Vec<String> {
        vec![String::from("hearth-rebuild"), String::from("rollback")]
    }

    fn default_service_prefix() -> String {
        String::from("hearth-app-")
    }

    fn default_drop_database_command() -> Vec<String> {
        vec![String::from("hearth-dropdb")]
    }
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            switch_command: Self::default_switch_command(),
            rollback_command: Self::default_rollback_command(),
            service_prefix: Self::default_service_prefix(),
            drop_database_command: Self::default_drop_database_command(),
        }
    }
}

/// Every duration here is tunable; the defaults mirror how long a
/// single-host rebuild-and-start cycle reasonably takes.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_batch_wait_secs")]
    pub batch_wait_secs: u64,
    #[serde(default = "Timeouts::default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    #[serde(default = "Timeouts::default_installing_timeout_secs")]
    pub installing_timeout_secs: u64,
    #[serde(default = "Timeouts::default_starting_timeout_secs")]
    pub starting_timeout_secs: u64,
    #[serde(default = "Timeouts::default_uninstalling_timeout_secs")]
    pub uninstalling_timeout_secs: u64,
    #[serde(default = "Timeouts::default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "Timeouts::default_probe_http_timeout_secs")]
    pub probe_http_timeout_secs: u64,
}

impl Timeouts {
    fn default_batch_wait_secs() -> u64 {
        5
    }

    fn default_watchdog_interval_secs() -> u64 {
        30
    }

    fn default_installing_timeout_secs() -> u64 {
        600
    }

    fn default_starting_timeout_secs() -> u64 {
        300
    }

    fn default_uninstalling_timeout_secs() -> u64 {
        600
    }

    fn default_health_check_timeout_secs() -> u64 {
        60
    }

    fn default_probe_http_timeout_secs() -> u64 {
        5
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_secs(self.batch_wait_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn probe_http_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_http_timeout_secs)
    }

    pub fn watchdog(&self) -> WatchdogTimeouts {
        WatchdogTimeouts {
            interval: Duration::from_secs(self.watchdog_interval_secs),
            installing: Duration::from_secs(self.installing_timeout_secs),
            starting: Duration::from_secs(self.starting_timeout_secs),
            uninstalling: Duration::from_secs(self.uninstalling_timeout_secs),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            batch_wait_secs: Self::default_batch_wait_secs(),
            watchdog_interval_secs: Self::default_watchdog_interval_secs(),
            installing_timeout_secs: Self::default_installing_timeout_secs(),
            starting_timeout_secs: Self::default_starting_timeout_secs(),
            uninstalling_timeout_secs: Self::default_uninstalling_timeout_secs(),
            health_check_timeout_secs: Self::default_health_check_timeout_secs(),
            probe_http_timeout_secs: Self::default_probe_http_timeout_secs(),
        }
    }
}

impl Config {
    fn default_catalog_dir() -> PathBuf {
        PathBuf::from("/var/lib/hearth/catalog")
    }

    fn default_fragment_path() -> PathBuf {
        PathBuf::from("/var/lib/hearth/apps.json")
    }

    fn default_routes_path() -> PathBuf {
        PathBuf::from("/var/lib/hearth/routes.json")
    }

    fn default_blueprint_dir() -> PathBuf {
        PathBuf::from("/var/lib/hearth/blueprints")
    }

    fn default_data_root() -> PathBuf {
        PathBuf::from("/var/lib/hearth/data")
    }

    fn default_state_db() -> PathBuf {
        PathBuf::from("/var/lib/hearth/state.db")
    }

    fn default_base_domain() -> String {
        String::from("home.arpa")
    }

    pub fn from_figment(cli: &CliArgs) -> Result<Self, figment::Error> {
        figment::Figment::new()
            .merge(Toml::file(
                cli.config
                    .as_ref()
                    .unwrap_or(&PathBuf::from_str("/etc/hearth/orchestrator.toml").unwrap()),
            ))
            .merge(Env::prefixed("HEARTH_").split("__"))
            .merge(cli)
            .extract::<Config>()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_dir: Self::default_catalog_dir(),
            fragment_path: Self::default_fragment_path(),
            routes_path: Self::default_routes_path(),
            blueprint_dir: Self::default_blueprint_dir(),
            data_root: Self::default_data_root(),
            state_db: Self::default_state_db(),
            base_domain: Self::default_base_domain(),
            identity: None,
            rebuild: RebuildConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}
