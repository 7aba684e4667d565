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

use crate::models::AppName;
use serde::{Deserialize, Serialize};

/// An app as described by its catalog file. Immutable at runtime; the catalog
/// cache rereads the directory tree on refresh.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppDefinition {
    pub name: AppName,
    pub display_name: String,
    #[serde(default = "AppDefinition::default_version")]
    pub version: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Infrastructure apps (database, cache, identity, proxy) are registered
    /// on startup and never uninstalled by users.
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub sso: SsoConfig,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    /// Declaration order matters: plans list choices in this order.
    #[serde(default)]
    pub integrations: Vec<IntegrationSpec>,
}

impl AppDefinition {
    fn default_version() -> String {
        String::from("latest")
    }

    pub fn integration(&self, name: &str) -> Option<&IntegrationSpec> {
        self.integrations.iter().find(|spec| spec.name == name)
    }

    pub fn declares_integration(&self, name: &str) -> bool {
        self.integration(name).is_some()
    }

    pub fn uses_shared_database(&self) -> bool {
        self.declares_integration("database")
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SsoConfig {
    #[serde(default)]
    pub strategy: SsoStrategy,
    /// Only meaningful for [`SsoStrategy::NativeOidc`].
    #[serde(default)]
    pub callback_path: Option<String>,
}

/// How an app is glued into the identity provider. The orchestrator treats
/// these as opaque tags selecting which blueprints and API calls are needed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SsoStrategy {
    #[default]
    None,
    NativeOidc,
    ForwardAuth,
    Ldap,
}

impl SsoStrategy {
    pub fn is_none(&self) -> bool {
        matches!(self, SsoStrategy::None)
    }
}

impl std::fmt::Display for SsoStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SsoStrategy::None => write!(f, "none"),
            SsoStrategy::NativeOidc => write!(f, "native-oidc"),
            SsoStrategy::ForwardAuth => write!(f, "forward-auth"),
            SsoStrategy::Ldap => write!(f, "ldap"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(default = "HealthCheckConfig::default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "HealthCheckConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HealthCheckConfig {
    fn default_interval_secs() -> u64 {
        2
    }

    fn default_timeout_secs() -> u64 {
        60
    }
}

/// One integration slot of an app, e.g. radarr's `download-client`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IntegrationSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    /// Whether more than one source may be wired at once. Kept for catalog
    /// compatibility; the planner currently picks a single source.
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub compatible: Vec<CompatibleApp>,
}

impl IntegrationSpec {
    /// The `default = true` entry, falling back to the first listed one.
    pub fn recommended(&self) -> Option<&AppName> {
        self.compatible
            .iter()
            .find(|compatible| compatible.default)
            .or_else(|| self.compatible.first())
            .map(|compatible| &compatible.app)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CompatibleApp {
    pub app: AppName,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub category: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_definition_with_integrations() {
        let definition = toml::from_str::<AppDefinition>(
            r#"
            name = "radarr"
            display_name = "Radarr"
            version = "5.14"
            port = 7878

            [sso]
            strategy = "forward-auth"

            [health_check]
            path = "/ping"

            [[integrations]]
            name = "download-client"
            required = true

            [[integrations.compatible]]
            app = "qbittorrent"
            default = true

            [[integrations.compatible]]
            app = "deluge"
            "#,
        )
        .unwrap();

        assert_eq!(definition.name.as_str(), "radarr");
        assert_eq!(definition.port, Some(7878));
        assert_eq!(definition.sso.strategy, SsoStrategy::ForwardAuth);
        assert_eq!(definition.health_check.as_ref().unwrap().interval_secs, 2);
        assert_eq!(definition.health_check.as_ref().unwrap().timeout_secs, 60);

        let integration = definition.integration("download-client").unwrap();
        assert!(integration.required);
        assert_eq!(integration.recommended().unwrap().as_str(), "qbittorrent");
    }

    #[test]
    fn recommended_falls_back_to_first_listed() {
        let spec = IntegrationSpec {
            name: String::from("download-client"),
            required: true,
            multi: false,
            compatible: vec![
                CompatibleApp {
                    app: "deluge".parse().unwrap(),
                    default: false,
                    category: None,
                },
                CompatibleApp {
                    app: "qbittorrent".parse().unwrap(),
                    default: false,
                    category: None,
                },
            ],
        };

        assert_eq!(spec.recommended().unwrap().as_str(), "deluge");
    }

    #[test]
    fn minimal_definition_uses_defaults() {
        let definition = toml::from_str::<AppDefinition>(
            r#"
            name = "qbittorrent"
            display_name = "qBittorrent"
            port = 8180
            "#,
        )
        .unwrap();

        assert_eq!(definition.version, "latest");
        assert!(!definition.system);
        assert!(definition.sso.strategy.is_none());
        assert!(definition.health_check.is_none());
        assert!(definition.integrations.is_empty());
    }
}
