use crate::models::AppName;
use std::path::PathBuf;
use std::process::Stdio;

/// Removes what an uninstall with `clear_data` leaves behind: the app's data
/// directory and, when the app used the shared relational service, its
/// database. Failures are reported, the caller decides how loud to be.
pub struct AppDataJanitor {
    data_root: PathBuf,
    /// Command that drops a database, invoked with the app name appended.
    drop_database_command: Vec<String>,
}

impl AppDataJanitor {
    pub fn new(data_root: impl Into<PathBuf>, drop_database_command: Vec<String>) -> Self {
        Self {
            data_root: data_root.into(),
            drop_database_command,
        }
    }

    pub fn data_dir(&self, app: &AppName) -> PathBuf {
        self.data_root.join(app.as_str())
    }

    pub async fn clear(&self, app: &AppName, drop_database: bool) -> anyhow::Result<()> {
        let data_dir = self.data_dir(app);
        match tokio::fs::remove_dir_all(&data_dir).await {
            Ok(()) => log::info!("Removed data directory {}", data_dir.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if drop_database {
            self.drop_database(app).await?;
        }
        Ok(())
    }

    async fn drop_database(&self, app: &AppName) -> anyhow::Result<()> {
        let Some((program, args)) = self.drop_database_command.split_first() else {
            anyhow::bail!("no drop-database command configured");
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .arg(app.as_str())
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            log::info!("Dropped database of {app}");
            Ok(())
        } else {
            anyhow::bail!(
                "dropping database of {app} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }
}
