use crate::models::{AppName, SsoStrategy};
use crate::sso::BlueprintGenerator;
use async_trait::async_trait;
use secstr::SecUtf8;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Narrow client for the identity system's HTTP API. Every call may fail with
/// "unavailable"; callers treat that as non-fatal: installs go ahead without
/// SSO, uninstalls proceed without API cleanup.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Removes the application and, depending on the strategy, its provider.
    async fn delete_app_sso(
        &self,
        app: &AppName,
        display_name: &str,
        strategy: SsoStrategy,
    ) -> anyhow::Result<()>;

    async fn add_provider_to_embedded_outpost(&self, provider: &str) -> anyhow::Result<()>;

    /// Creates the LDAP service account used by apps that only speak LDAP.
    async fn ensure_ldap_infrastructure(
        &self,
        apps: &[AppName],
        bind_password: &SecUtf8,
    ) -> anyhow::Result<()>;
}

pub struct AuthentikClient {
    client: reqwest::Client,
    base_url: Url,
    token: SecUtf8,
}

#[derive(Deserialize)]
struct PagedResults<T> {
    results: Vec<T>,
}

#[derive(Deserialize)]
struct ObjectRef {
    pk: serde_json::Value,
    #[serde(default)]
    providers: Vec<serde_json::Value>,
}

impl AuthentikClient {
    pub fn new(base_url: Url, token: SecUtf8) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client construction is infallible"),
            base_url,
            token,
        }
    }

    fn api(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(&format!("/api/v3/{path}"))?)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(self.token.unsecure())
    }

    async fn first_ref(&self, path: &str) -> anyhow::Result<Option<ObjectRef>> {
        let response = self
            .authorized(self.client.get(self.api(path)?))
            .send()
            .await?
            .error_for_status()?;
        let mut page = response.json::<PagedResults<ObjectRef>>().await?;
        Ok(if page.results.is_empty() {
            None
        } else {
            Some(page.results.remove(0))
        })
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let response = self
            .authorized(self.client.delete(self.api(path)?))
            .send()
            .await?;
        // Gone already is as good as deleted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl IdentityClient for AuthentikClient {
    async fn is_available(&self) -> bool {
        let url = match self.api("root/config/") {
            Ok(url) => url,
            Err(_) => return false,
        };
        match self.authorized(self.client.get(url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                log::debug!("Identity API not reachable: {err}");
                false
            }
        }
    }

    async fn delete_app_sso(
        &self,
        app: &AppName,
        display_name: &str,
        strategy: SsoStrategy,
    ) -> anyhow::Result<()> {
        log::debug!("Deleting SSO resources of {display_name} ({strategy})");
        self.delete(&format!("core/applications/{app}/")).await?;

        let provider_endpoint = match strategy {
            SsoStrategy::NativeOidc => Some("providers/oauth2"),
            SsoStrategy::ForwardAuth => Some("providers/proxy"),
            SsoStrategy::None | SsoStrategy::Ldap => None,
        };

        if let Some(endpoint) = provider_endpoint {
            let provider_name = BlueprintGenerator::provider_name(app);
            if let Some(provider) = self
                .first_ref(&format!("{endpoint}/?name={provider_name}"))
                .await?
            {
                self.delete(&format!("{endpoint}/{}/", provider.pk)).await?;
            }
        }

        Ok(())
    }

    async fn add_provider_to_embedded_outpost(&self, provider: &str) -> anyhow::Result<()> {
        let Some(outpost) = self
            .first_ref("outposts/instances/?managed=goauthentik.io%2Foutposts%2Fembedded")
            .await?
        else {
            anyhow::bail!("embedded outpost not found");
        };

        let Some(provider_ref) = self
            .first_ref(&format!("providers/all/?name={provider}"))
            .await?
        else {
            anyhow::bail!("provider {provider} not found");
        };

        if outpost.providers.contains(&provider_ref.pk) {
            return Ok(());
        }

        let mut providers = outpost.providers;
        providers.push(provider_ref.pk);
        self.authorized(
            self.client
                .patch(self.api(&format!("outposts/instances/{}/", outpost.pk))?),
        )
        .json(&serde_json::json!({ "providers": providers }))
        .send()
        .await?
        .error_for_status()?;

        Ok(())
    }

    async fn ensure_ldap_infrastructure(
        &self,
        apps: &[AppName],
        bind_password: &SecUtf8,
    ) -> anyhow::Result<()> {
        log::debug!(
            "Ensuring LDAP infrastructure for {} app(s)",
            apps.len()
        );

        if self.first_ref("core/users/?username=ldapservice").await?.is_none() {
            let created = self
                .authorized(self.client.post(self.api("core/users/")?))
                .json(&serde_json::json!({
                    "username": "ldapservice",
                    "name": "LDAP service account",
                    "type": "service_account",
                }))
                .send()
                .await?
                .error_for_status()?
                .json::<ObjectRef>()
                .await?;

            self.authorized(
                self.client
                    .post(self.api(&format!("core/users/{}/set_password/", created.pk))?),
            )
            .json(&serde_json::json!({ "password": bind_password.unsecure() }))
            .send()
            .await?
            .error_for_status()?;
        }

        if self
            .first_ref("outposts/instances/?name=hearth%20ldap%20outpost")
            .await?
            .is_none()
        {
            self.authorized(self.client.post(self.api("outposts/instances/")?))
                .json(&serde_json::json!({
                    "name": "hearth ldap outpost",
                    "type": "ldap",
                    "providers": [],
                }))
                .send()
                .await?
                .error_for_status()?;
        }

        Ok(())
    }
}

/// Stands in when no identity section is configured. Never available, so
/// every SSO API interaction short-circuits into the logged best-effort path.
pub struct UnconfiguredIdentityClient;

#[async_trait]
impl IdentityClient for UnconfiguredIdentityClient {
    async fn is_available(&self) -> bool {
        false
    }

    async fn delete_app_sso(
        &self,
        _app: &AppName,
        _display_name: &str,
        _strategy: SsoStrategy,
    ) -> anyhow::Result<()> {
        anyhow::bail!("identity API is not configured")
    }

    async fn add_provider_to_embedded_outpost(&self, _provider: &str) -> anyhow::Result<()> {
        anyhow::bail!("identity API is not configured")
    }

    async fn ensure_ldap_infrastructure(
        &self,
        _apps: &[AppName],
        _bind_password: &SecUtf8,
    ) -> anyhow::Result<()> {
        anyhow::bail!("identity API is not configured")
    }
}

#[cfg(test)]
pub mod dummy {
    use super::*;
    use std::sync::Mutex;

    /// Scripted identity API for tests: records calls, availability is fixed.
    pub struct DummyIdentityClient {
        available: bool,
        pub calls: Mutex<Vec<String>>,
    }

    impl DummyIdentityClient {
        pub fn available() -> Self {
            Self {
                available: true,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn unreachable() -> Self {
            Self {
                available: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl IdentityClient for DummyIdentityClient {
        async fn is_available(&self) -> bool {
            self.available
        }

        async fn delete_app_sso(
            &self,
            app: &AppName,
            _display_name: &str,
            strategy: SsoStrategy,
        ) -> anyhow::Result<()> {
            self.record(format!("delete-sso {app} {strategy}"));
            Ok(())
        }

        async fn add_provider_to_embedded_outpost(&self, provider: &str) -> anyhow::Result<()> {
            self.record(format!("add-provider {provider}"));
            Ok(())
        }

        async fn ensure_ldap_infrastructure(
            &self,
            apps: &[AppName],
            _bind_password: &SecUtf8,
        ) -> anyhow::Result<()> {
            let apps = apps
                .iter()
                .map(|app| app.as_str())
                .collect::<Vec<_>>()
                .join(",");
            self.record(format!("ensure-ldap {apps}"));
            Ok(())
        }
    }
}
