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

pub mod identity;

use crate::models::{AppDefinition, AppName, SsoStrategy};
use secstr::SecUtf8;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Emits identity-provider blueprints: one YAML file per SSO-enabled app plus
/// a single outpost file grouping the forward-auth providers. The identity
/// system picks the files up on its own; materializing resources through the
/// API is the [`identity::IdentityClient`]'s job and always best effort.
pub struct BlueprintGenerator {
    blueprint_dir: PathBuf,
    /// Apps are reachable as `https://<app>.<base_domain>`.
    base_domain: String,
}

#[derive(Serialize)]
struct Blueprint {
    version: u32,
    metadata: BlueprintMetadata,
    entries: Vec<BlueprintEntry>,
}

#[derive(Serialize)]
struct BlueprintMetadata {
    name: String,
    labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct BlueprintEntry {
    model: String,
    state: String,
    identifiers: serde_yaml::Value,
    attrs: serde_yaml::Value,
}

#[derive(Serialize)]
struct OAuthProviderAttrs {
    client_id: String,
    client_type: &'static str,
    redirect_uris: Vec<String>,
}

#[derive(Serialize)]
struct ProxyProviderAttrs {
    mode: &'static str,
    external_host: String,
}

#[derive(Serialize)]
struct ApplicationAttrs {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
}

#[derive(Serialize)]
struct OutpostAttrs {
    #[serde(rename = "type")]
    kind: &'static str,
    providers: Vec<String>,
}

impl BlueprintGenerator {
    pub fn new(blueprint_dir: impl Into<PathBuf>, base_domain: impl Into<String>) -> Self {
        Self {
            blueprint_dir: blueprint_dir.into(),
            base_domain: base_domain.into(),
        }
    }

    pub fn provider_name(app: &AppName) -> String {
        format!("provider-{app}")
    }

    fn blueprint_path(&self, name: &str) -> PathBuf {
        self.blueprint_dir.join(format!("{name}.yaml"))
    }

    fn external_host(&self, app: &AppName) -> String {
        format!("https://{app}.{}", self.base_domain)
    }

    fn write_blueprint(&self, path: &Path, blueprint: &Blueprint) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.blueprint_dir)?;
        let rendered = serde_yaml::to_string(blueprint)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// Writes the app's blueprint file and returns its path. Apps with
    /// `sso = none` have no blueprint.
    pub fn generate_for_app(&self, definition: &AppDefinition) -> anyhow::Result<Option<PathBuf>> {
        let app = &definition.name;
        let mut entries = Vec::new();

        match definition.sso.strategy {
            SsoStrategy::None => return Ok(None),
            SsoStrategy::NativeOidc => {
                let callback_path = definition.sso.callback_path.as_deref().unwrap_or("/");
                entries.push(BlueprintEntry {
                    model: String::from("authentik_providers_oauth2.oauth2provider"),
                    state: String::from("present"),
                    identifiers: serde_yaml::to_value(BTreeMap::from([(
                        "name",
                        Self::provider_name(app),
                    )]))?,
                    attrs: serde_yaml::to_value(OAuthProviderAttrs {
                        client_id: app.to_string(),
                        client_type: "confidential",
                        redirect_uris: vec![format!(
                            "{}{callback_path}",
                            self.external_host(app)
                        )],
                    })?,
                });
            }
            SsoStrategy::ForwardAuth => {
                entries.push(BlueprintEntry {
                    model: String::from("authentik_providers_proxy.proxyprovider"),
                    state: String::from("present"),
                    identifiers: serde_yaml::to_value(BTreeMap::from([(
                        "name",
                        Self::provider_name(app),
                    )]))?,
                    attrs: serde_yaml::to_value(ProxyProviderAttrs {
                        mode: "forward_single",
                        external_host: self.external_host(app),
                    })?,
                });
            }
            // LDAP apps bind through the shared outpost; only the application
            // entry is needed.
            SsoStrategy::Ldap => {}
        }

        entries.push(BlueprintEntry {
            model: String::from("authentik_core.application"),
            state: String::from("present"),
            identifiers: serde_yaml::to_value(BTreeMap::from([("slug", app.as_str())]))?,
            attrs: serde_yaml::to_value(ApplicationAttrs {
                name: definition.display_name.clone(),
                provider: if definition.sso.strategy == SsoStrategy::Ldap {
                    None
                } else {
                    Some(Self::provider_name(app))
                },
            })?,
        });

        let blueprint = Blueprint {
            version: 1,
            metadata: BlueprintMetadata {
                name: format!("hearth-{app}"),
                labels: BTreeMap::from([(
                    String::from("blueprints.goauthentik.io/instantiate"),
                    String::from("true"),
                )]),
            },
            entries,
        };

        let path = self.blueprint_path(app.as_str());
        self.write_blueprint(&path, &blueprint)?;
        log::debug!("Wrote SSO blueprint for {app} ({})", definition.sso.strategy);
        Ok(Some(path))
    }

    pub fn delete_blueprint(&self, app: &AppName) -> anyhow::Result<()> {
        let path = self.blueprint_path(app.as_str());
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// The outpost file lists every forward-auth provider; regenerated as a
    /// whole on each install.
    pub fn generate_outpost_blueprint(&self, providers: &[String]) -> anyhow::Result<PathBuf> {
        let blueprint = Blueprint {
            version: 1,
            metadata: BlueprintMetadata {
                name: String::from("hearth-outpost"),
                labels: BTreeMap::new(),
            },
            entries: vec![BlueprintEntry {
                model: String::from("authentik_outposts.outpost"),
                state: String::from("present"),
                identifiers: serde_yaml::to_value(BTreeMap::from([(
                    "name",
                    "hearth forward-auth outpost",
                )]))?,
                attrs: serde_yaml::to_value(OutpostAttrs {
                    kind: "proxy",
                    providers: providers.to_vec(),
                })?,
            }],
        };

        let path = self.blueprint_path("outpost");
        self.write_blueprint(&path, &blueprint)?;
        Ok(path)
    }

    /// Environment hints the system build injects into SSO-enabled apps.
    pub fn get_sso_env_vars(&self, definition: &AppDefinition) -> Vec<(String, String)> {
        match definition.sso.strategy {
            SsoStrategy::None | SsoStrategy::ForwardAuth => Vec::new(),
            SsoStrategy::NativeOidc => vec![
                (String::from("OIDC_CLIENT_ID"), definition.name.to_string()),
                (
                    String::from("OIDC_ISSUER_URL"),
                    format!("https://auth.{}/application/o/{}/", self.base_domain, definition.name),
                ),
            ],
            SsoStrategy::Ldap => vec![
                (
                    String::from("LDAP_URI"),
                    format!("ldap://auth.{}:389", self.base_domain),
                ),
                (
                    String::from("LDAP_BIND_DN"),
                    String::from("cn=ldapservice,ou=users,dc=ldap,dc=goauthentik,dc=io"),
                ),
            ],
        }
    }

    /// The bind password of the LDAP service account, created on first use
    /// and readable only by the orchestrator.
    pub fn get_ldap_bind_password(&self) -> anyhow::Result<SecUtf8> {
        let path = self.blueprint_dir.join("ldap-bind.secret");
        match std::fs::read_to_string(&path) {
            Ok(password) => Ok(SecUtf8::from(password.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let password = uuid::Uuid::new_v4().simple().to_string();
                std::fs::create_dir_all(&self.blueprint_dir)?;
                std::fs::write(&path, &password)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
                }
                Ok(SecUtf8::from(password))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn generator(dir: &Path) -> BlueprintGenerator {
        BlueprintGenerator::new(dir, "home.example")
    }

    fn definition(toml: &str) -> AppDefinition {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn oidc_blueprint_contains_provider_and_redirect_uri() {
        let dir = tempfile::tempdir().unwrap();
        let jellyfin = definition(
            r#"
            name = "jellyfin"
            display_name = "Jellyfin"
            port = 8096

            [sso]
            strategy = "native-oidc"
            callback_path = "/sso/OID/redirect"
            "#,
        );

        let path = generator(dir.path())
            .generate_for_app(&jellyfin)
            .unwrap()
            .unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        let value = serde_yaml::from_str::<serde_yaml::Value>(&raw).unwrap();
        let entries = value["entries"].as_sequence().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0]["model"],
            "authentik_providers_oauth2.oauth2provider"
        );
        assert_eq!(
            entries[0]["attrs"]["redirect_uris"][0],
            "https://jellyfin.home.example/sso/OID/redirect"
        );
        assert_eq!(entries[1]["identifiers"]["slug"], "jellyfin");
    }

    #[test]
    fn app_without_sso_has_no_blueprint() {
        let dir = tempfile::tempdir().unwrap();
        let qbittorrent = definition(
            r#"
            name = "qbittorrent"
            display_name = "qBittorrent"
            port = 8180
            "#,
        );

        assert!(generator(dir.path())
            .generate_for_app(&qbittorrent)
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_blueprint_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        let radarr = definition(
            r#"
            name = "radarr"
            display_name = "Radarr"
            port = 7878

            [sso]
            strategy = "forward-auth"
            "#,
        );

        let path = generator.generate_for_app(&radarr).unwrap().unwrap();
        assert!(path.exists());

        let app = AppName::from_str("radarr").unwrap();
        generator.delete_blueprint(&app).unwrap();
        assert!(!path.exists());
        generator.delete_blueprint(&app).unwrap();
    }

    #[test]
    fn outpost_blueprint_lists_providers() {
        let dir = tempfile::tempdir().unwrap();

        let path = generator(dir.path())
            .generate_outpost_blueprint(&[
                String::from("provider-radarr"),
                String::from("provider-sonarr"),
            ])
            .unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        let value = serde_yaml::from_str::<serde_yaml::Value>(&raw).unwrap();

        assert_eq!(
            value["entries"][0]["attrs"]["providers"]
                .as_sequence()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn ldap_bind_password_is_stable_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());

        let first = generator.get_ldap_bind_password().unwrap();
        let second = generator.get_ldap_bind_password().unwrap();

        assert_eq!(first, second);
        assert!(!first.unsecure().is_empty());
    }

    #[test]
    fn sso_env_vars_for_oidc_apps() {
        let dir = tempfile::tempdir().unwrap();
        let jellyfin = definition(
            r#"
            name = "jellyfin"
            display_name = "Jellyfin"
            port = 8096

            [sso]
            strategy = "native-oidc"
            "#,
        );

        let vars = generator(dir.path()).get_sso_env_vars(&jellyfin);

        assert!(vars
            .iter()
            .any(|(key, value)| key == "OIDC_CLIENT_ID" && value == "jellyfin"));
    }
}
