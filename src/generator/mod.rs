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

use crate::models::{AppDefinition, AppName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The declarative description of which apps are enabled and how they are
/// wired. This is the ground truth of the system; the app store rows are
/// intent plus observation. The system build consumes the fragment file.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default)]
    pub ldap_outpost_enable: bool,
    #[serde(default)]
    pub apps: BTreeMap<AppName, AppEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppEntry {
    pub enabled: bool,
    #[serde(default)]
    pub integrations: BTreeMap<String, AppName>,
}

impl Transaction {
    /// Enables `app` with the given wiring and makes sure every integration
    /// source exists in the map with `enabled = true`, preserving whatever
    /// configuration an existing source entry already carries.
    pub fn with_app(mut self, app: &AppName, integrations: BTreeMap<String, AppName>) -> Self {
        for source in integrations.values() {
            if source == app {
                continue;
            }
            self.apps
                .entry(source.clone())
                .or_insert_with(AppEntry::default)
                .enabled = true;
        }

        self.apps.insert(
            app.clone(),
            AppEntry {
                enabled: true,
                integrations,
            },
        );
        self
    }

    /// Disables `app`, preserving its integrations so a later reinstall can
    /// pick them up again. A transaction that never contained the app is
    /// returned unchanged.
    pub fn disabling_app(mut self, app: &AppName) -> Self {
        if let Some(entry) = self.apps.get_mut(app) {
            entry.enabled = false;
        }
        self
    }

    pub fn is_enabled(&self, app: &AppName) -> bool {
        self.apps.get(app).map(|entry| entry.enabled).unwrap_or(false)
    }

    pub fn enabled_apps(&self) -> impl Iterator<Item = (&AppName, &AppEntry)> {
        self.apps.iter().filter(|(_, entry)| entry.enabled)
    }
}

/// Builds the integration config an install records, in precedence order:
/// user choices first, overwritten by auto-config (a single installed source
/// is required for functionality, the user cannot override it), and for
/// required slots that are still unset the catalog's recommendation.
/// Choices for integrations the app does not declare are discarded.
pub fn compose_integration_config(
    definition: &AppDefinition,
    user_choices: &BTreeMap<String, AppName>,
    auto_config: &BTreeMap<String, AppName>,
) -> BTreeMap<String, AppName> {
    let mut config = BTreeMap::new();

    for (integration, source) in user_choices {
        if definition.declares_integration(integration) {
            config.insert(integration.clone(), source.clone());
        } else {
            log::warn!(
                "Ignoring choice {integration} → {source}: not declared by {}",
                definition.name
            );
        }
    }

    for (integration, source) in auto_config {
        config.insert(integration.clone(), source.clone());
    }

    for spec in &definition.integrations {
        if spec.required && !config.contains_key(&spec.name) {
            if let Some(recommended) = spec.recommended() {
                config.insert(spec.name.clone(), recommended.clone());
            }
        }
    }

    config
}

/// Owns the generated fragment file. Pure data in; the only file-system side
/// effect is `apply`, which replaces the fragment atomically. Rebuilding is
/// someone else's job.
pub struct Generator {
    fragment_path: PathBuf,
}

impl Generator {
    pub fn new(fragment_path: impl Into<PathBuf>) -> Self {
        Self {
            fragment_path: fragment_path.into(),
        }
    }

    /// Parses the last-written fragment; a missing file is an empty
    /// transaction (pristine host).
    pub fn load_current(&self) -> Result<Transaction, GeneratorError> {
        let raw = match std::fs::read_to_string(&self.fragment_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Transaction::default());
            }
            Err(err) => {
                return Err(GeneratorError::Io {
                    path: self.fragment_path.clone(),
                    err,
                });
            }
        };

        serde_json::from_str(&raw).map_err(|err| GeneratorError::Malformed {
            path: self.fragment_path.clone(),
            err,
        })
    }

    pub fn preview(&self, transaction: &Transaction) -> String {
        serde_json::to_string_pretty(transaction).expect("transaction serialization is infallible")
    }

    /// Human-readable description of what `next` changes relative to
    /// `current`; logged before every apply.
    pub fn diff(&self, current: &Transaction, next: &Transaction) -> Vec<String> {
        let mut changes = Vec::new();

        for (app, entry) in &next.apps {
            match current.apps.get(app) {
                None => {
                    if entry.enabled {
                        changes.push(format!("enable {app}"));
                    }
                }
                Some(previous) => {
                    if previous.enabled != entry.enabled {
                        changes.push(if entry.enabled {
                            format!("enable {app}")
                        } else {
                            format!("disable {app}")
                        });
                    } else if previous.integrations != entry.integrations {
                        changes.push(format!("rewire {app}"));
                    }
                }
            }
        }
        for app in current.apps.keys() {
            if !next.apps.contains_key(app) {
                changes.push(format!("remove {app}"));
            }
        }
        if current.ldap_outpost_enable != next.ldap_outpost_enable {
            changes.push(if next.ldap_outpost_enable {
                String::from("enable ldap outpost")
            } else {
                String::from("disable ldap outpost")
            });
        }

        changes
    }

    /// Write-temp + rename so a crash mid-write never leaves a torn
    /// fragment behind.
    pub fn apply(&self, transaction: &Transaction) -> Result<(), GeneratorError> {
        let io_err = |err| GeneratorError::Io {
            path: self.fragment_path.clone(),
            err,
        };

        if let Some(parent) = self.fragment_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut rendered = self.preview(transaction);
        rendered.push('\n');

        let temp_path = self.fragment_path.with_extension("tmp");
        std::fs::write(&temp_path, rendered).map_err(io_err)?;
        std::fs::rename(&temp_path, &self.fragment_path).map_err(io_err)?;

        log::debug!(
            "Applied transaction with {} apps to {}",
            transaction.apps.len(),
            self.fragment_path.display()
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("Cannot access fragment {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Malformed fragment {path}: {err}")]
    Malformed {
        path: PathBuf,
        #[source]
        err: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn name(name: &str) -> AppName {
        AppName::from_str(name).unwrap()
    }

    fn wiring(pairs: &[(&str, &str)]) -> BTreeMap<String, AppName> {
        pairs
            .iter()
            .map(|(integration, source)| (integration.to_string(), name(source)))
            .collect()
    }

    #[test]
    fn with_app_enables_integration_sources() {
        let transaction = Transaction::default().with_app(
            &name("radarr"),
            wiring(&[("download-client", "qbittorrent")]),
        );

        assert!(transaction.is_enabled(&name("radarr")));
        assert!(transaction.is_enabled(&name("qbittorrent")));
        assert_eq!(
            transaction.apps[&name("radarr")].integrations,
            wiring(&[("download-client", "qbittorrent")])
        );
    }

    #[test]
    fn with_app_preserves_existing_source_configuration() {
        let transaction = Transaction::default()
            .with_app(&name("qbittorrent"), wiring(&[("vpn", "wireguard")]))
            .with_app(&name("radarr"), wiring(&[("download-client", "qbittorrent")]));

        assert_eq!(
            transaction.apps[&name("qbittorrent")].integrations,
            wiring(&[("vpn", "wireguard")])
        );
    }

    #[test]
    fn with_app_is_idempotent() {
        let wired = wiring(&[("download-client", "qbittorrent")]);

        let once = Transaction::default().with_app(&name("radarr"), wired.clone());
        let twice = once.clone().with_app(&name("radarr"), wired);

        assert_eq!(once, twice);
    }

    #[test]
    fn disabling_app_preserves_other_fields() {
        let transaction = Transaction::default()
            .with_app(&name("radarr"), wiring(&[("download-client", "qbittorrent")]))
            .disabling_app(&name("radarr"));

        let entry = &transaction.apps[&name("radarr")];
        assert!(!entry.enabled);
        assert_eq!(
            entry.integrations,
            wiring(&[("download-client", "qbittorrent")])
        );
        assert!(transaction.is_enabled(&name("qbittorrent")));
    }

    #[test]
    fn disabling_unknown_app_changes_nothing() {
        let transaction = Transaction::default().disabling_app(&name("ghost"));

        assert_eq!(transaction, Transaction::default());
    }

    #[test]
    fn apply_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Generator::new(dir.path().join("apps.json"));

        let transaction = Transaction {
            ldap_outpost_enable: true,
            ..Transaction::default()
        }
        .with_app(&name("radarr"), wiring(&[("download-client", "qbittorrent")]));

        generator.apply(&transaction).unwrap();
        let loaded = generator.load_current().unwrap();

        assert_eq!(loaded, transaction);

        // applying what was loaded must be a fixpoint
        generator.apply(&loaded).unwrap();
        assert_eq!(generator.load_current().unwrap(), transaction);
    }

    #[test]
    fn load_current_of_pristine_host_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Generator::new(dir.path().join("apps.json"));

        assert_eq!(generator.load_current().unwrap(), Transaction::default());
    }

    #[test]
    fn diff_names_enabled_disabled_and_rewired_apps() {
        let generator = Generator::new("/unused");
        let current = Transaction::default()
            .with_app(&name("radarr"), wiring(&[("download-client", "qbittorrent")]))
            .with_app(&name("jellyfin"), BTreeMap::new());

        let next = current
            .clone()
            .disabling_app(&name("jellyfin"))
            .with_app(&name("radarr"), wiring(&[("download-client", "deluge")]));

        let changes = generator.diff(&current, &next);
        assert!(changes.contains(&String::from("disable jellyfin")));
        assert!(changes.contains(&String::from("enable deluge")));
        assert!(changes.contains(&String::from("rewire radarr")));
    }

    mod compose {
        use super::*;
        use crate::models::AppDefinition;

        fn miniflux() -> AppDefinition {
            toml::from_str(
                r#"
                name = "miniflux"
                display_name = "Miniflux"
                port = 8085

                [[integrations]]
                name = "database"
                required = true

                [[integrations.compatible]]
                app = "postgres"
                "#,
            )
            .unwrap()
        }

        #[test]
        fn auto_config_overrides_user_choice() {
            let config = compose_integration_config(
                &miniflux(),
                &wiring(&[("database", "mariadb")]),
                &wiring(&[("database", "postgres")]),
            );

            assert_eq!(config, wiring(&[("database", "postgres")]));
        }

        #[test]
        fn required_slot_falls_back_to_recommendation() {
            let config =
                compose_integration_config(&miniflux(), &BTreeMap::new(), &BTreeMap::new());

            assert_eq!(config, wiring(&[("database", "postgres")]));
        }

        #[test]
        fn undeclared_choices_are_discarded() {
            let config = compose_integration_config(
                &miniflux(),
                &wiring(&[("media-server", "jellyfin")]),
                &wiring(&[("database", "postgres")]),
            );

            assert_eq!(config, wiring(&[("database", "postgres")]));
        }
    }
}
