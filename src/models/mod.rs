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

mod app_name;
mod definition;

pub use app_name::{AppName, AppNameError};
pub use definition::{
    AppDefinition, CompatibleApp, HealthCheckConfig, IntegrationSpec, SsoConfig, SsoStrategy,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Lifecycle state of an installed app. `running` is only ever reached
/// through a successful health observation.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Installing,
    Starting,
    Running,
    Error,
    Failed,
    Uninstalling,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Installing => "installing",
            AppStatus::Starting => "starting",
            AppStatus::Running => "running",
            AppStatus::Error => "error",
            AppStatus::Failed => "failed",
            AppStatus::Uninstalling => "uninstalling",
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(AppStatus::Installing),
            "starting" => Ok(AppStatus::Starting),
            "running" => Ok(AppStatus::Running),
            "error" => Ok(AppStatus::Error),
            "failed" => Ok(AppStatus::Failed),
            "uninstalling" => Ok(AppStatus::Uninstalling),
            other => Err(format!("unknown app status: {other}")),
        }
    }
}

/// A row of the `apps` table: recorded intent plus the latest observation.
/// The generated transaction is the ground truth of what the system runs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct InstalledApp {
    pub name: AppName,
    pub display_name: String,
    pub version: String,
    pub port: Option<u16>,
    pub system: bool,
    pub status: AppStatus,
    /// integration name → chosen source app. Never contains keys the app's
    /// definition does not declare.
    pub integration_config: BTreeMap<String, AppName>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A required integration the user has to (or may) decide on.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct IntegrationChoice {
    pub integration: String,
    pub options: Vec<AppName>,
    pub recommended: AppName,
}

/// Result of planning an install: either it can go ahead (with the wiring the
/// planner worked out) or the blockers explain why not.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct InstallPlan {
    pub can_install: bool,
    /// Required integrations with no compatible app, installed or available.
    pub blockers: Vec<String>,
    pub choices: Vec<IntegrationChoice>,
    /// Integrations where exactly one compatible app is installed; forced.
    pub auto_config: BTreeMap<String, AppName>,
    /// Installed apps that integrate with this app.
    pub dependents: Vec<AppName>,
}

/// An installed app that points at the app under removal.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct Dependent {
    pub app: AppName,
    pub integration: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RemovePlan {
    pub can_remove: bool,
    /// Dependents whose integration on this app is required.
    pub blockers: Vec<Dependent>,
    /// Optional dependents that will lose their wiring.
    pub will_unconfigure: Vec<Dependent>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct InstallRequest {
    pub app: AppName,
    /// integration name → user-chosen source app.
    #[serde(default)]
    pub choices: BTreeMap<String, AppName>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct InstallResult {
    pub app: AppName,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The target app plus every dependency source that was pulled in.
    pub apps_installed: Vec<AppName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_info: Option<String>,
}

impl InstallResult {
    pub fn rejected(app: AppName, error: impl Into<String>) -> Self {
        Self {
            app,
            success: false,
            error: Some(error.into()),
            apps_installed: Vec::new(),
            rebuild_output: None,
            generation_info: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UninstallRequest {
    pub app: AppName,
    #[serde(default)]
    pub clear_data: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UninstallResult {
    pub app: AppName,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Apps whose optional integration on the removed app was dropped.
    pub unconfigured: Vec<AppName>,
}

impl UninstallResult {
    pub fn rejected(app: AppName, error: impl Into<String>) -> Self {
        Self {
            app,
            success: false,
            error: Some(error.into()),
            unconfigured: Vec::new(),
        }
    }
}
