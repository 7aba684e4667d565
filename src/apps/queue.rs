use crate::apps::task::AppTask;
use crate::apps::{AppsService, AppsServiceError};
use crate::models::{AppName, InstallRequest, InstallResult, UninstallRequest, UninstallResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

/// What a queued caller gets back. A conflict-resolved batch may answer an
/// install submission with the uninstall outcome (and vice versa): every
/// caller receives the result of the operation that actually ran.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Install(InstallResult),
    Uninstall(UninstallResult),
}

type Outcome = Result<TaskOutcome, AppsServiceError>;

struct QueuedRequest {
    task: AppTask,
    responder: oneshot::Sender<Outcome>,
}

/// Serializes Install/Uninstall so concurrent rebuilds can never race on the
/// generated fragment. A single worker task gathers requests into batches of
/// `batch_wait`, merges per-app duplicates and runs uninstalls before
/// installs. Submission and the result wait are cancellable; work that has
/// started always runs to completion.
pub struct OperationQueue {
    requests: mpsc::Sender<QueuedRequest>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OperationQueue {
    pub fn start(apps: Arc<AppsService>, batch_wait: Duration) -> Arc<Self> {
        let (requests, receiver) = mpsc::channel(64);
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(worker_loop(
            receiver,
            apps,
            batch_wait,
            shutdown.clone(),
        ));

        Arc::new(Self {
            requests,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub async fn enqueue_install(
        &self,
        ctx: &CancellationToken,
        request: InstallRequest,
    ) -> Result<TaskOutcome, AppsServiceError> {
        self.enqueue(
            ctx,
            AppTask::Install {
                app: request.app,
                choices: request.choices,
            },
        )
        .await
    }

    pub async fn enqueue_uninstall(
        &self,
        ctx: &CancellationToken,
        request: UninstallRequest,
    ) -> Result<TaskOutcome, AppsServiceError> {
        self.enqueue(
            ctx,
            AppTask::Uninstall {
                app: request.app,
                clear_data: request.clear_data,
            },
        )
        .await
    }

    async fn enqueue(
        &self,
        ctx: &CancellationToken,
        task: AppTask,
    ) -> Result<TaskOutcome, AppsServiceError> {
        let (responder, outcome) = oneshot::channel();
        let request = QueuedRequest { task, responder };

        tokio::select! {
            _ = ctx.cancelled() => return Err(AppsServiceError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(AppsServiceError::QueueStopped),
            accepted = self.requests.send(request) => {
                if accepted.is_err() {
                    return Err(AppsServiceError::QueueStopped);
                }
            }
        }

        tokio::select! {
            // The work may still run to completion; only this wait is
            // cancelled.
            _ = ctx.cancelled() => Err(AppsServiceError::Cancelled),
            outcome = outcome => outcome.unwrap_or(Err(AppsServiceError::Cancelled)),
        }
    }

    /// Signals the worker, drains buffered requests answering each with
    /// cancellation, and waits for the worker to finish its current task.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                log::error!("Queue worker ended abnormally: {err}");
            }
        }
    }
}

async fn worker_loop(
    mut requests: mpsc::Receiver<QueuedRequest>,
    apps: Arc<AppsService>,
    batch_wait: Duration,
    shutdown: CancellationToken,
) {
    log::debug!("Operation queue worker started (batch window {batch_wait:?})");

    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let mut batch = vec![first];
        let window_closes = tokio::time::Instant::now() + batch_wait;
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = sleep_until(window_closes) => break,
                _ = shutdown.cancelled() => {
                    cancelled = true;
                    break;
                }
                request = requests.recv() => match request {
                    Some(request) => batch.push(request),
                    None => break,
                },
            }
        }

        if cancelled {
            for request in batch {
                let _ = request.responder.send(Err(AppsServiceError::Cancelled));
            }
            break;
        }

        run_batch(&apps, batch).await;
    }

    // Whatever is still buffered will never run.
    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request.responder.send(Err(AppsServiceError::Cancelled));
    }
    log::debug!("Operation queue worker stopped");
}

/// Per-app merge preserving first-arrival order, then uninstalls before
/// installs so uninstall+reinstall sequences do what the user meant.
fn dedup_batch(batch: Vec<QueuedRequest>) -> Vec<(AppTask, Vec<oneshot::Sender<Outcome>>)> {
    let mut order: Vec<AppName> = Vec::new();
    let mut merged: HashMap<AppName, (AppTask, Vec<oneshot::Sender<Outcome>>)> = HashMap::new();

    for request in batch {
        let app = request.task.app_name().clone();
        match merged.get_mut(&app) {
            Some((task, responders)) => {
                *task = task.clone().merge_with(request.task);
                responders.push(request.responder);
            }
            None => {
                order.push(app.clone());
                merged.insert(app, (request.task, vec![request.responder]));
            }
        }
    }

    let (mut uninstalls, mut installs): (Vec<_>, Vec<_>) = order
        .into_iter()
        .map(|app| merged.remove(&app).expect("app was just inserted"))
        .partition(|(task, _)| task.is_uninstall());

    uninstalls.append(&mut installs);
    uninstalls
}

async fn run_batch(apps: &AppsService, batch: Vec<QueuedRequest>) {
    let tasks = dedup_batch(batch);
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("Running a batch of {} merged task(s)", tasks.len());
    }

    for (task, responders) in tasks {
        // Started work is never aborted; callers only cancel their waits.
        let ctx = CancellationToken::new();
        let outcome = match task {
            AppTask::Install { app, choices } => apps
                .install(&ctx, InstallRequest { app, choices })
                .await
                .map(TaskOutcome::Install),
            AppTask::Uninstall { app, clear_data } => apps
                .uninstall(&ctx, UninstallRequest { app, clear_data })
                .await
                .map(TaskOutcome::Uninstall),
        };

        if let Err(err) = &outcome {
            log::error!("Queued operation failed: {err}");
        }
        for responder in responders {
            let _ = responder.send(outcome.clone());
        }
    }
}
