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

use crate::models::{AppName, AppStatus, InstalledApp};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// How many change notifications may be buffered before they are dropped.
/// Listeners must never be able to block a store mutation.
const CHANGE_BUFFER: usize = 32;

/// Durable record of installed apps. All operations are transactional and
/// safe under concurrent callers; SQLite serializes the writes.
#[derive(Clone)]
pub struct AppStore {
    pool: SqlitePool,
    on_change: Arc<RwLock<Option<mpsc::Sender<AppName>>>>,
}

impl AppStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            on_change: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn connect_with_exponential_backoff(
        options: SqliteConnectOptions,
    ) -> anyhow::Result<SqlitePool> {
        let min = std::time::Duration::from_millis(100);
        let max = std::time::Duration::from_secs(10);
        for duration in exponential_backoff::Backoff::new(5, min, max) {
            log::debug!("Connecting to state database…");
            let pool = match SqlitePool::connect_with(options.clone()).await {
                Ok(pool) => pool,
                Err(err) => match duration {
                    Some(duration) => {
                        log::warn!("Cannot connect to state database, trying again: {err}");
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    None => {
                        return Err(err)?;
                    }
                },
            };
            return Ok(pool);
        }
        unreachable!()
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::migrate!()
            .run(pool)
            .await
            .map_err(|err| StoreError::Migration {
                err: err.to_string(),
            })
    }

    /// A single best-effort callback invoked after every mutating operation.
    /// Delivery is fire-and-forget through a bounded channel; when the
    /// listener falls behind, notifications are dropped.
    pub fn set_on_change<F>(&self, callback: F)
    where
        F: Fn(AppName) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<AppName>(CHANGE_BUFFER);
        tokio::spawn(async move {
            while let Some(app_name) = rx.recv().await {
                callback(app_name);
            }
        });
        *self.on_change.write().expect("on_change lock poisoned") = Some(tx);
    }

    fn notify(&self, app_name: &AppName) {
        let guard = self.on_change.read().expect("on_change lock poisoned");
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(app_name.clone()).is_err() {
                log::debug!("Change notification for {app_name} dropped");
            }
        }
    }

    pub async fn get_all(&self) -> Result<Vec<InstalledApp>, StoreError> {
        let rows = sqlx::query_as::<_, AppRow>("SELECT * FROM apps ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(InstalledApp::try_from).collect()
    }

    pub async fn get_by_name(&self, name: &AppName) -> Result<Option<InstalledApp>, StoreError> {
        let row = sqlx::query_as::<_, AppRow>("SELECT * FROM apps WHERE name = $1")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(InstalledApp::try_from).transpose()
    }

    pub async fn get_installed_names(&self) -> Result<Vec<AppName>, StoreError> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM apps ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        names
            .into_iter()
            .map(|name| {
                AppName::from_str(&name).map_err(|err| StoreError::CorruptRow {
                    name: name.clone(),
                    err: err.to_string(),
                })
            })
            .collect()
    }

    pub async fn is_installed(&self, name: &AppName) -> Result<bool, StoreError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM apps WHERE name = $1")
                .bind(name.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Records install intent: upsert with an initial `installing` status.
    /// `installed_at` survives reinstalls of an existing row.
    pub async fn install(
        &self,
        name: &AppName,
        display_name: &str,
        version: &str,
        integration_config: &BTreeMap<String, AppName>,
        port: Option<u16>,
        is_system: bool,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO apps (name, display_name, version, status, port, is_system, integration_config, installed_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (name) DO UPDATE SET
                display_name = excluded.display_name,
                version = excluded.version,
                status = excluded.status,
                port = excluded.port,
                is_system = excluded.is_system,
                integration_config = excluded.integration_config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name.as_str())
        .bind(display_name)
        .bind(version)
        .bind(AppStatus::Installing.as_str())
        .bind(port.map(i64::from))
        .bind(is_system)
        .bind(sqlx::types::Json(integration_config))
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.notify(name);
        Ok(())
    }

    /// Idempotent registration of always-on infrastructure. Existing rows are
    /// left untouched.
    pub async fn ensure_system_app(
        &self,
        name: &AppName,
        display_name: &str,
        port: Option<u16>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO apps (name, display_name, version, status, port, is_system, integration_config, installed_at, updated_at)
            VALUES ($1, $2, 'latest', $3, $4, 1, '{}', $5, $5)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name.as_str())
        .bind(display_name)
        .bind(AppStatus::Running.as_str())
        .bind(port.map(i64::from))
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.notify(name);
        }
        Ok(())
    }

    pub async fn update_status(
        &self,
        name: &AppName,
        status: AppStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE apps SET status = $1, updated_at = $2 WHERE name = $3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(name.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            log::warn!("Status update to {status} for unknown app {name} had no effect");
        } else {
            self.notify(name);
        }
        Ok(())
    }

    pub async fn update_integration_config(
        &self,
        name: &AppName,
        integration_config: &BTreeMap<String, AppName>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE apps SET integration_config = $1, updated_at = $2 WHERE name = $3")
                .bind(sqlx::types::Json(integration_config))
                .bind(Utc::now())
                .bind(name.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() > 0 {
            self.notify(name);
        }
        Ok(())
    }

    pub async fn update_display_name(
        &self,
        name: &AppName,
        display_name: &str,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE apps SET display_name = $1, updated_at = $2 WHERE name = $3")
                .bind(display_name)
                .bind(Utc::now())
                .bind(name.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() > 0 {
            self.notify(name);
        }
        Ok(())
    }

    pub async fn uninstall(&self, name: &AppName) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM apps WHERE name = $1")
            .bind(name.as_str())
            .execute(&self.pool)
            .await?;

        self.notify(name);
        Ok(())
    }

    /// An isolated store backed by in-memory SQLite with the schema applied.
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        use sqlx::sqlite::SqlitePoolOptions;

        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        Self::migrate(&pool).await.unwrap();
        Self::new(pool)
    }
}

#[derive(sqlx::FromRow)]
struct AppRow {
    name: String,
    display_name: String,
    version: String,
    status: String,
    port: Option<i64>,
    is_system: bool,
    integration_config: sqlx::types::Json<BTreeMap<String, AppName>>,
    installed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AppRow> for InstalledApp {
    type Error = StoreError;

    fn try_from(row: AppRow) -> Result<Self, Self::Error> {
        let corrupt = |err: String| StoreError::CorruptRow {
            name: row.name.clone(),
            err,
        };

        Ok(InstalledApp {
            name: AppName::from_str(&row.name).map_err(|err| corrupt(err.to_string()))?,
            display_name: row.display_name.clone(),
            version: row.version.clone(),
            port: row
                .port
                .map(|port| u16::try_from(port).map_err(|err| corrupt(err.to_string())))
                .transpose()?,
            system: row.is_system,
            status: AppStatus::from_str(&row.status).map_err(corrupt)?,
            integration_config: row.integration_config.0.clone(),
            installed_at: row.installed_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("State database error: {err}")]
    Database {
        #[from]
        err: sqlx::Error,
    },
    #[error("Cannot apply state database migration: {err}")]
    Migration { err: String },
    #[error("Corrupt row for app {name}: {err}")]
    CorruptRow { name: String, err: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn name(name: &str) -> AppName {
        AppName::from_str(name).unwrap()
    }

    #[tokio::test]
    async fn install_and_fetch_round_trip() {
        let store = AppStore::in_memory().await;

        let config = BTreeMap::from([(String::from("download-client"), name("qbittorrent"))]);
        store
            .install(&name("radarr"), "Radarr", "5.14", &config, Some(7878), false)
            .await
            .unwrap();

        let app = store.get_by_name(&name("radarr")).await.unwrap().unwrap();
        assert_eq!(app.display_name, "Radarr");
        assert_eq!(app.status, AppStatus::Installing);
        assert_eq!(app.port, Some(7878));
        assert_eq!(app.integration_config, config);
        assert!(store.is_installed(&name("radarr")).await.unwrap());
        assert_eq!(
            store.get_installed_names().await.unwrap(),
            vec![name("radarr")]
        );
    }

    #[tokio::test]
    async fn every_mutation_advances_updated_at() {
        let store = AppStore::in_memory().await;

        store
            .install(&name("radarr"), "Radarr", "5.14", &BTreeMap::new(), None, false)
            .await
            .unwrap();
        let before = store.get_by_name(&name("radarr")).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .update_status(&name("radarr"), AppStatus::Starting)
            .await
            .unwrap();
        let after = store.get_by_name(&name("radarr")).await.unwrap().unwrap();

        assert_eq!(after.status, AppStatus::Starting);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.installed_at, before.installed_at);
    }

    #[tokio::test]
    async fn reinstall_preserves_installed_at() {
        let store = AppStore::in_memory().await;

        store
            .install(&name("radarr"), "Radarr", "5.14", &BTreeMap::new(), None, false)
            .await
            .unwrap();
        let first = store.get_by_name(&name("radarr")).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .install(&name("radarr"), "Radarr", "5.15", &BTreeMap::new(), None, false)
            .await
            .unwrap();
        let second = store.get_by_name(&name("radarr")).await.unwrap().unwrap();

        assert_eq!(second.version, "5.15");
        assert_eq!(second.installed_at, first.installed_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn ensure_system_app_is_idempotent() {
        let store = AppStore::in_memory().await;

        store
            .ensure_system_app(&name("postgres"), "PostgreSQL", Some(5432))
            .await
            .unwrap();
        store
            .ensure_system_app(&name("postgres"), "Renamed", Some(5432))
            .await
            .unwrap();

        let app = store.get_by_name(&name("postgres")).await.unwrap().unwrap();
        assert_eq!(app.display_name, "PostgreSQL");
        assert_eq!(app.status, AppStatus::Running);
        assert!(app.system);
    }

    #[tokio::test]
    async fn uninstall_deletes_the_row() {
        let store = AppStore::in_memory().await;

        store
            .install(&name("radarr"), "Radarr", "5.14", &BTreeMap::new(), None, false)
            .await
            .unwrap();
        store.uninstall(&name("radarr")).await.unwrap();

        assert!(store.get_by_name(&name("radarr")).await.unwrap().is_none());
        assert!(!store.is_installed(&name("radarr")).await.unwrap());
    }

    #[tokio::test]
    async fn on_change_fires_after_mutations() {
        let store = AppStore::in_memory().await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_by_callback = seen.clone();
        store.set_on_change(move |app_name| {
            seen_by_callback.lock().unwrap().push(app_name);
        });

        store
            .install(&name("radarr"), "Radarr", "5.14", &BTreeMap::new(), None, false)
            .await
            .unwrap();
        store
            .update_status(&name("radarr"), AppStatus::Starting)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![name("radarr"), name("radarr")]
        );
    }

    #[tokio::test]
    async fn display_name_can_be_changed() {
        let store = AppStore::in_memory().await;

        store
            .install(&name("radarr"), "Radarr", "5.14", &BTreeMap::new(), None, false)
            .await
            .unwrap();
        store
            .update_display_name(&name("radarr"), "Radarr (Movies)")
            .await
            .unwrap();

        let app = store.get_by_name(&name("radarr")).await.unwrap().unwrap();
        assert_eq!(app.display_name, "Radarr (Movies)");
    }

    #[tokio::test]
    async fn status_update_for_unknown_app_is_a_no_op() {
        let store = AppStore::in_memory().await;

        store
            .update_status(&name("ghost"), AppStatus::Error)
            .await
            .unwrap();

        assert!(store.get_all().await.unwrap().is_empty());
    }
}
