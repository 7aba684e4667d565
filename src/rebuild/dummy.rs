use super::{RebuildEvent, RebuildResult, Rebuilder};
use crate::models::AppName;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records invocations instead of touching the host; switches succeed unless
/// scripted otherwise.
pub struct DummyRebuilder {
    fail_switches: bool,
    pub invocations: Mutex<Vec<String>>,
    pub active_units: Mutex<BTreeSet<AppName>>,
}

impl DummyRebuilder {
    pub fn new() -> Self {
        Self {
            fail_switches: false,
            invocations: Mutex::new(Vec::new()),
            active_units: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_switches: true,
            ..Self::new()
        }
    }

    pub fn with_active_unit(self, app: AppName) -> Self {
        self.active_units.lock().unwrap().insert(app);
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn switch_count(&self) -> usize {
        self.invocations()
            .iter()
            .filter(|invocation| invocation.as_str() == "switch")
            .count()
    }

    fn record(&self, invocation: impl Into<String>) {
        self.invocations.lock().unwrap().push(invocation.into());
    }

    fn result(&self) -> RebuildResult {
        if self.fail_switches {
            RebuildResult {
                success: false,
                output: String::from("error: builder failed"),
                error_message: Some(String::from("rebuild tool exited with 1")),
                duration: Duration::from_millis(1),
                changes: Vec::new(),
            }
        } else {
            RebuildResult {
                success: true,
                output: String::from("switched to generation 42\n"),
                error_message: None,
                duration: Duration::from_millis(1),
                changes: Vec::new(),
            }
        }
    }
}

#[async_trait]
impl Rebuilder for DummyRebuilder {
    async fn switch(&self, _ctx: &CancellationToken) -> RebuildResult {
        self.record("switch");
        self.result()
    }

    async fn switch_stream(
        &self,
        _ctx: &CancellationToken,
        events: mpsc::Sender<RebuildEvent>,
    ) -> RebuildResult {
        self.record("switch-stream");
        let result = self.result();
        let _ = events
            .send(RebuildEvent::Stdout(result.output.trim().to_string()))
            .await;
        let _ = events
            .send(RebuildEvent::Finished {
                success: result.success,
            })
            .await;
        result
    }

    async fn rollback(&self, _ctx: &CancellationToken) -> RebuildResult {
        self.record("rollback");
        self.result()
    }

    async fn stop_user_service(
        &self,
        _ctx: &CancellationToken,
        app: &AppName,
    ) -> anyhow::Result<()> {
        self.record(format!("stop {app}"));
        Ok(())
    }

    async fn reload_and_restart_apps(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
        self.record("reload-and-restart");
        Ok(())
    }

    async fn is_service_active(&self, app: &AppName) -> bool {
        self.active_units.lock().unwrap().contains(app)
    }
}
