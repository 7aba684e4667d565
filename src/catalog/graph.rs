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

use crate::models::{
    AppDefinition, AppName, Dependent, InstallPlan, IntegrationChoice, RemovePlan,
};
use multimap::MultiMap;
use std::collections::{BTreeMap, BTreeSet};

/// The dependency view over the catalog: forward integration declarations
/// plus a reverse `dependents` index, rebuilt whenever the definitions are
/// replaced. App records never carry back-pointers; the index is recomputed.
pub struct AppGraph {
    definitions: BTreeMap<AppName, AppDefinition>,
    /// target app → (consumer app, integration name), over the whole catalog.
    dependents: MultiMap<AppName, (AppName, String)>,
    installed: BTreeSet<AppName>,
}

impl AppGraph {
    pub fn from_definitions(definitions: impl IntoIterator<Item = AppDefinition>) -> Self {
        let definitions: BTreeMap<AppName, AppDefinition> = definitions
            .into_iter()
            .map(|definition| (definition.name.clone(), definition))
            .collect();

        let mut dependents = MultiMap::new();
        for definition in definitions.values() {
            for spec in &definition.integrations {
                for compatible in &spec.compatible {
                    dependents.insert(
                        compatible.app.clone(),
                        (definition.name.clone(), spec.name.clone()),
                    );
                }
            }
        }

        Self {
            definitions,
            dependents,
            installed: BTreeSet::new(),
        }
    }

    /// Replaces the installed set the planner works against. Callers invoke
    /// this whenever the app store changes.
    pub fn set_installed(&mut self, names: impl IntoIterator<Item = AppName>) {
        self.installed = names.into_iter().collect();
    }

    pub fn get_apps(&self) -> Vec<&AppDefinition> {
        self.definitions.values().collect()
    }

    pub fn get(&self, name: &AppName) -> Option<&AppDefinition> {
        self.definitions.get(name)
    }

    /// Compatible sources for one integration slot of `app`, restricted to
    /// apps the catalog actually knows, in declaration order.
    pub fn get_compatible_apps(&self, app: &AppName, integration: &str) -> Vec<AppName> {
        self.definitions
            .get(app)
            .and_then(|definition| definition.integration(integration))
            .map(|spec| {
                spec.compatible
                    .iter()
                    .filter(|compatible| self.definitions.contains_key(&compatible.app))
                    .map(|compatible| compatible.app.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Installed apps that declare an integration compatible with `app`,
    /// ordered lexically by consumer, then by the consumer's declaration
    /// order, so plans are stable for a given input.
    pub fn find_dependents(&self, app: &AppName) -> Vec<Dependent> {
        let mut dependents: Vec<Dependent> = self
            .dependents
            .get_vec(app)
            .map(|consumers| {
                consumers
                    .iter()
                    .filter(|(consumer, _)| self.installed.contains(consumer))
                    .map(|(consumer, integration)| Dependent {
                        app: consumer.clone(),
                        integration: integration.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        dependents.sort_by(|a, b| {
            a.app.cmp(&b.app).then_with(|| {
                let declaration_index = |dependent: &Dependent| {
                    self.definitions
                        .get(&dependent.app)
                        .map(|definition| {
                            definition
                                .integrations
                                .iter()
                                .position(|spec| spec.name == dependent.integration)
                                .unwrap_or(usize::MAX)
                        })
                        .unwrap_or(usize::MAX)
                };
                declaration_index(a).cmp(&declaration_index(b))
            })
        });
        dependents.dedup();
        dependents
    }

    pub fn plan_install(&self, app: &AppName) -> Result<InstallPlan, GraphError> {
        let definition = self
            .definitions
            .get(app)
            .ok_or_else(|| GraphError::UnknownApp { app: app.clone() })?;

        let mut blockers = Vec::new();
        let mut choices = Vec::new();
        let mut auto_config = BTreeMap::new();

        for spec in &definition.integrations {
            let known: Vec<&AppName> = spec
                .compatible
                .iter()
                .filter(|compatible| self.definitions.contains_key(&compatible.app))
                .map(|compatible| &compatible.app)
                .collect();
            let installed: Vec<&AppName> = known
                .iter()
                .filter(|name| self.installed.contains(**name))
                .copied()
                .collect();

            if spec.required && known.is_empty() {
                blockers.push(spec.name.clone());
                continue;
            }

            if let [only] = installed.as_slice() {
                // A single installed source is required for functionality and
                // overrides whatever the user picked.
                auto_config.insert(spec.name.clone(), (*only).clone());
            }

            if spec.required && known.len() >= 2 {
                let recommended = spec
                    .compatible
                    .iter()
                    .filter(|compatible| self.definitions.contains_key(&compatible.app))
                    .find(|compatible| compatible.default)
                    .map(|compatible| compatible.app.clone())
                    .unwrap_or_else(|| known[0].clone());

                choices.push(IntegrationChoice {
                    integration: spec.name.clone(),
                    options: known.iter().map(|name| (*name).clone()).collect(),
                    recommended,
                });
            }
        }

        let dependents = self
            .find_dependents(app)
            .into_iter()
            .map(|dependent| dependent.app)
            .collect::<Vec<_>>();

        Ok(InstallPlan {
            can_install: blockers.is_empty(),
            blockers,
            choices,
            auto_config,
            dependents,
        })
    }

    pub fn plan_remove(&self, app: &AppName) -> RemovePlan {
        let mut blockers = Vec::new();
        let mut will_unconfigure = Vec::new();

        for dependent in self.find_dependents(app) {
            let required = self
                .definitions
                .get(&dependent.app)
                .and_then(|definition| definition.integration(&dependent.integration))
                .map(|spec| spec.required)
                .unwrap_or(false);

            if required {
                blockers.push(dependent);
            } else {
                will_unconfigure.push(dependent);
            }
        }

        RemovePlan {
            can_remove: blockers.is_empty(),
            blockers,
            will_unconfigure,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GraphError {
    #[error("App {app} does not exist in the catalog.")]
    UnknownApp { app: AppName },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn definition(toml: &str) -> AppDefinition {
        toml::from_str(toml).unwrap()
    }

    fn name(name: &str) -> AppName {
        AppName::from_str(name).unwrap()
    }

    fn media_catalog() -> AppGraph {
        AppGraph::from_definitions([
            definition(
                r#"
                name = "qbittorrent"
                display_name = "qBittorrent"
                port = 8180
                "#,
            ),
            definition(
                r#"
                name = "deluge"
                display_name = "Deluge"
                port = 8112
                "#,
            ),
            definition(
                r#"
                name = "radarr"
                display_name = "Radarr"
                port = 7878

                [[integrations]]
                name = "download-client"
                required = true

                [[integrations.compatible]]
                app = "qbittorrent"
                default = true

                [[integrations.compatible]]
                app = "deluge"

                [[integrations]]
                name = "media-server"

                [[integrations.compatible]]
                app = "jellyfin"
                "#,
            ),
            definition(
                r#"
                name = "jellyfin"
                display_name = "Jellyfin"
                port = 8096
                "#,
            ),
        ])
    }

    #[test]
    fn plan_install_offers_choice_with_recommended_default() {
        let graph = media_catalog();

        let plan = graph.plan_install(&name("radarr")).unwrap();

        assert!(plan.can_install);
        assert_eq!(plan.choices.len(), 1);
        assert_eq!(plan.choices[0].integration, "download-client");
        assert_eq!(
            plan.choices[0].options,
            vec![name("qbittorrent"), name("deluge")]
        );
        assert_eq!(plan.choices[0].recommended, name("qbittorrent"));
    }

    #[test]
    fn plan_install_forces_single_installed_source() {
        let mut graph = media_catalog();
        graph.set_installed([name("qbittorrent")]);

        let plan = graph.plan_install(&name("radarr")).unwrap();

        assert!(plan.can_install);
        assert_eq!(
            plan.auto_config.get("download-client"),
            Some(&name("qbittorrent"))
        );
    }

    #[test]
    fn plan_install_blocks_when_nothing_compatible_exists() {
        let graph = AppGraph::from_definitions([definition(
            r#"
            name = "radarr"
            display_name = "Radarr"
            port = 7878

            [[integrations]]
            name = "download-client"
            required = true

            [[integrations.compatible]]
            app = "qbittorrent"
            "#,
        )]);

        let plan = graph.plan_install(&name("radarr")).unwrap();

        assert!(!plan.can_install);
        assert_eq!(plan.blockers, vec![String::from("download-client")]);
        assert!(plan.choices.is_empty());
    }

    #[test]
    fn plan_install_rejects_unknown_app() {
        let graph = media_catalog();

        assert_eq!(
            graph.plan_install(&name("unknown")),
            Err(GraphError::UnknownApp {
                app: name("unknown")
            })
        );
    }

    #[test]
    fn plan_remove_blocks_on_required_dependent() {
        let mut graph = media_catalog();
        graph.set_installed([name("qbittorrent"), name("radarr")]);

        let plan = graph.plan_remove(&name("qbittorrent"));

        assert!(!plan.can_remove);
        assert_eq!(
            plan.blockers,
            vec![Dependent {
                app: name("radarr"),
                integration: String::from("download-client"),
            }]
        );
    }

    #[test]
    fn plan_remove_unconfigures_optional_dependent() {
        let mut graph = media_catalog();
        graph.set_installed([name("jellyfin"), name("radarr")]);

        let plan = graph.plan_remove(&name("jellyfin"));

        assert!(plan.can_remove);
        assert!(plan.blockers.is_empty());
        assert_eq!(
            plan.will_unconfigure,
            vec![Dependent {
                app: name("radarr"),
                integration: String::from("media-server"),
            }]
        );
    }

    #[test]
    fn plan_remove_without_dependents_is_free() {
        let mut graph = media_catalog();
        graph.set_installed([name("qbittorrent")]);

        let plan = graph.plan_remove(&name("qbittorrent"));

        assert!(plan.can_remove);
        assert!(plan.blockers.is_empty());
        assert!(plan.will_unconfigure.is_empty());
    }

    #[test]
    fn plans_are_deterministic_for_unchanged_input() {
        let mut graph = media_catalog();
        graph.set_installed([name("qbittorrent"), name("deluge")]);

        let first = graph.plan_install(&name("radarr")).unwrap();
        let second = graph.plan_install(&name("radarr")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn dependents_ignore_apps_that_are_not_installed() {
        let graph = media_catalog();

        assert!(graph.find_dependents(&name("qbittorrent")).is_empty());
    }

    #[test]
    fn compatible_apps_keep_declaration_order() {
        let graph = media_catalog();

        assert_eq!(
            graph.get_compatible_apps(&name("radarr"), "download-client"),
            vec![name("qbittorrent"), name("deluge")]
        );
        assert!(graph
            .get_compatible_apps(&name("radarr"), "unknown-slot")
            .is_empty());
    }
}
