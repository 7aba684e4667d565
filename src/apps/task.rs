use crate::models::AppName;
use std::collections::BTreeMap;

/// One queued mutation. Tasks for the same app arriving within a batch
/// window are merged before the orchestrator runs.
#[derive(Clone, Debug, PartialEq)]
pub enum AppTask {
    Install {
        app: AppName,
        choices: BTreeMap<String, AppName>,
    },
    Uninstall {
        app: AppName,
        clear_data: bool,
    },
}

impl AppTask {
    pub fn app_name(&self) -> &AppName {
        match self {
            AppTask::Install { app, .. } => app,
            AppTask::Uninstall { app, .. } => app,
        }
    }

    pub fn is_uninstall(&self) -> bool {
        matches!(self, AppTask::Uninstall { .. })
    }

    /// Folds a later request for the same app into this one:
    /// install + install merges the choice maps (later keys win),
    /// uninstall + uninstall keeps the most destructive `clear_data`,
    /// and a change of operation lets the later one win outright.
    pub fn merge_with(self, later: AppTask) -> Self {
        assert_eq!(self.app_name(), later.app_name());
        match (self, later) {
            (
                Self::Install { choices, .. },
                Self::Install {
                    app,
                    choices: later_choices,
                },
            ) => {
                let mut merged = choices;
                merged.extend(later_choices);
                Self::Install {
                    app,
                    choices: merged,
                }
            }
            (
                Self::Uninstall { clear_data, .. },
                Self::Uninstall {
                    app,
                    clear_data: later_clear_data,
                },
            ) => Self::Uninstall {
                app,
                clear_data: clear_data || later_clear_data,
            },
            (Self::Install { .. }, uninstall @ Self::Uninstall { .. }) => uninstall,
            (Self::Uninstall { .. }, install @ Self::Install { .. }) => install,
        }
    }
}
