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

#[cfg(test)]
pub mod dummy;

use crate::models::AppName;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RebuildResult {
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
    pub duration: Duration,
    /// Service units the rebuild tool reported as started or restarted.
    pub changes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RebuildEvent {
    Stdout(String),
    Stderr(String),
    Finished { success: bool },
}

/// Drives the external whole-system rebuild tool and the per-app service
/// units. Operations report failure in their return value instead of
/// erroring; callers translate to user-visible status. The running tool is
/// never killed on cancellation: it is not reentrant and aborting a switch
/// mid-flight could leave the host inconsistent.
#[async_trait]
pub trait Rebuilder: Send + Sync {
    async fn switch(&self, ctx: &CancellationToken) -> RebuildResult;

    /// Like [`Rebuilder::switch`] but forwards tool output line by line while
    /// it is produced. `events` is closed when the call returns.
    async fn switch_stream(
        &self,
        ctx: &CancellationToken,
        events: mpsc::Sender<RebuildEvent>,
    ) -> RebuildResult;

    /// Reverts to the previous system generation.
    async fn rollback(&self, ctx: &CancellationToken) -> RebuildResult;

    async fn stop_user_service(
        &self,
        ctx: &CancellationToken,
        app: &AppName,
    ) -> anyhow::Result<()>;

    /// Post-switch plumbing: reload units and restart the app services the
    /// switch touched.
    async fn reload_and_restart_apps(&self, ctx: &CancellationToken) -> anyhow::Result<()>;

    async fn is_service_active(&self, app: &AppName) -> bool;
}

/// First line of the rebuild output that mentions a generation, used as the
/// caller-facing generation info.
pub fn generation_info(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.to_ascii_lowercase().contains("generation"))
        .map(|line| line.trim().to_string())
}

fn parse_changed_units(output: &str) -> Vec<String> {
    let mut changes = Vec::new();
    for line in output.lines() {
        let lowered = line.to_ascii_lowercase();
        for marker in [
            "restarting the following units:",
            "starting the following units:",
            "reloading the following units:",
        ] {
            if let Some(index) = lowered.find(marker) {
                changes.extend(
                    line[index + marker.len()..]
                        .split(',')
                        .map(|unit| unit.trim().to_string())
                        .filter(|unit| !unit.is_empty()),
                );
            }
        }
    }
    changes.sort();
    changes.dedup();
    changes
}

/// Production implementation shelling out to the configured rebuild tool and
/// to `systemctl` for per-app service plumbing.
pub struct CommandRebuilder {
    switch_command: Vec<String>,
    rollback_command: Vec<String>,
    /// Per-app service units are named `<prefix><app>.service`.
    service_prefix: String,
}

impl CommandRebuilder {
    pub fn new(
        switch_command: Vec<String>,
        rollback_command: Vec<String>,
        service_prefix: impl Into<String>,
    ) -> Self {
        Self {
            switch_command,
            rollback_command,
            service_prefix: service_prefix.into(),
        }
    }

    pub fn service_unit(&self, app: &AppName) -> String {
        format!("{}{app}.service", self.service_prefix)
    }

    async fn run_to_result(&self, command: &[String]) -> RebuildResult {
        let started = Instant::now();
        let (program, args) = match command.split_first() {
            Some(split) => split,
            None => {
                return RebuildResult {
                    success: false,
                    error_message: Some(String::from("no rebuild command configured")),
                    duration: started.elapsed(),
                    ..RebuildResult::default()
                };
            }
        };

        log::info!("Running {}", command.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                let success = output.status.success();
                RebuildResult {
                    success,
                    changes: parse_changed_units(&combined),
                    error_message: if success {
                        None
                    } else {
                        Some(format!("{program} exited with {}", output.status))
                    },
                    output: combined,
                    duration: started.elapsed(),
                }
            }
            Err(err) => RebuildResult {
                success: false,
                error_message: Some(format!("cannot run {program}: {err}")),
                duration: started.elapsed(),
                ..RebuildResult::default()
            },
        }
    }

    async fn systemctl(&self, args: &[&str]) -> anyhow::Result<()> {
        let output = tokio::process::Command::new("systemctl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            anyhow::bail!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }
}

#[async_trait]
impl Rebuilder for CommandRebuilder {
    async fn switch(&self, _ctx: &CancellationToken) -> RebuildResult {
        self.run_to_result(&self.switch_command).await
    }

    async fn switch_stream(
        &self,
        _ctx: &CancellationToken,
        events: mpsc::Sender<RebuildEvent>,
    ) -> RebuildResult {
        let started = Instant::now();
        let (program, args) = match self.switch_command.split_first() {
            Some(split) => split,
            None => {
                return RebuildResult {
                    success: false,
                    error_message: Some(String::from("no rebuild command configured")),
                    duration: started.elapsed(),
                    ..RebuildResult::default()
                };
            }
        };

        log::info!("Running {} (streaming)", self.switch_command.join(" "));
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                return RebuildResult {
                    success: false,
                    error_message: Some(format!("cannot run {program}: {err}")),
                    duration: started.elapsed(),
                    ..RebuildResult::default()
                };
            }
        };

        let mut stdout = child
            .stdout
            .take()
            .map(|stdout| BufReader::new(stdout).lines());
        let mut stderr = child
            .stderr
            .take()
            .map(|stderr| BufReader::new(stderr).lines());
        let mut combined = String::new();

        loop {
            tokio::select! {
                line = async {
                    match stdout.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                }, if stdout.is_some() => match line {
                    Ok(Some(line)) => {
                        combined.push_str(&line);
                        combined.push('\n');
                        let _ = events.send(RebuildEvent::Stdout(line)).await;
                    }
                    _ => stdout = None,
                },
                line = async {
                    match stderr.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                }, if stderr.is_some() => match line {
                    Ok(Some(line)) => {
                        combined.push_str(&line);
                        combined.push('\n');
                        let _ = events.send(RebuildEvent::Stderr(line)).await;
                    }
                    _ => stderr = None,
                },
                else => break,
            }
        }

        let status = child.wait().await;
        let success = status.as_ref().map(|s| s.success()).unwrap_or(false);
        let _ = events.send(RebuildEvent::Finished { success }).await;

        RebuildResult {
            success,
            changes: parse_changed_units(&combined),
            error_message: match status {
                Ok(status) if status.success() => None,
                Ok(status) => Some(format!("{program} exited with {status}")),
                Err(err) => Some(format!("cannot wait for {program}: {err}")),
            },
            output: combined,
            duration: started.elapsed(),
        }
    }

    async fn rollback(&self, _ctx: &CancellationToken) -> RebuildResult {
        self.run_to_result(&self.rollback_command).await
    }

    async fn stop_user_service(
        &self,
        _ctx: &CancellationToken,
        app: &AppName,
    ) -> anyhow::Result<()> {
        self.systemctl(&["stop", &self.service_unit(app)]).await
    }

    async fn reload_and_restart_apps(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["restart", &format!("{}*", self.service_prefix)])
            .await
    }

    async fn is_service_active(&self, app: &AppName) -> bool {
        tokio::process::Command::new("systemctl")
            .args(["is-active", "--quiet", &self.service_unit(app)])
            .stdin(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_changed_units_from_switch_output() {
        let output = "building the system configuration...\n\
                      activating the configuration...\n\
                      restarting the following units: hearth-app-radarr.service, hearth-app-jellyfin.service\n\
                      starting the following units: hearth-app-qbittorrent.service\n";

        assert_eq!(
            parse_changed_units(output),
            vec![
                String::from("hearth-app-jellyfin.service"),
                String::from("hearth-app-qbittorrent.service"),
                String::from("hearth-app-radarr.service"),
            ]
        );
    }

    #[test]
    fn parse_changed_units_without_markers_is_empty() {
        assert!(parse_changed_units("nothing to do\n").is_empty());
    }

    #[test]
    fn generation_info_picks_the_generation_line() {
        let output = "activating the configuration...\nswitched to generation 42\n";

        assert_eq!(
            generation_info(output),
            Some(String::from("switched to generation 42"))
        );
        assert_eq!(generation_info("nothing to do\n"), None);
    }
}
