//! Background pausing of sandboxes left running without use.

use anyhow::Result;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReclaimerConfig;
use crate::sandbox::SandboxBackend;
use crate::store::{SandboxState, TaskStore};

/// Outcome of one reclamation cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReclaimReport {
    pub paused: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Periodically pauses idle sandboxes.
pub(crate) struct IdleReclaimer {
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn TaskStore>,
    idle_threshold: Duration,
    check_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IdleReclaimer {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn TaskStore>,
        config: &ReclaimerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            backend,
            store,
            idle_threshold: config.idle_threshold(),
            check_interval: config.check_interval(),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Starts the periodic worker; returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *worker = Some(tokio::spawn(Arc::clone(self).run(shutdown_rx)));
        true
    }

    /// Signals the worker and waits for it to exit.
    pub async fn stop(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        self.shutdown_tx.send_replace(true);
        if let Err(e) = handle.await {
            warn!("Reclaimer worker ended abnormally: {}", e);
        }
        info!(event = "reclaimer_stopped");
    }

    /// Pauses every sandbox idle for longer than the threshold.
    pub async fn run_cycle(&self) -> Result<ReclaimReport> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.idle_threshold)?;
        let idle = self.store.idle_sandboxes(cutoff).await?;
        let mut report = ReclaimReport::default();

        for task in idle {
            let Some(sandbox_id) = task.sandbox_id.as_deref() else {
                continue;
            };
            match self.reclaim(task.id, sandbox_id).await {
                Ok(()) => {
                    info!(event = "sandbox_reclaimed", task_id = %task.id, sandbox_id = %sandbox_id);
                    report.paused.push(task.id);
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        sandbox_id = %sandbox_id,
                        "Failed to pause idle sandbox: {:#}", e
                    );
                    report.failed.push(task.id);
                }
            }
        }

        debug!(
            event = "reclaim_cycle",
            paused = report.paused.len(),
            failed = report.failed.len(),
        );
        Ok(report)
    }

    async fn reclaim(&self, task_id: Uuid, sandbox_id: &str) -> Result<()> {
        self.backend.resume(sandbox_id).await?;
        self.backend.pause(sandbox_id).await?;
        self.store
            .update_sandbox_usage(task_id, SandboxState::Paused)
            .await
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            event = "reclaimer_started",
            idle_secs = self.idle_threshold.as_secs(),
            interval_secs = self.check_interval.as_secs(),
        );

        loop {
            if let Err(e) = self.run_cycle().await {
                warn!("Reclaim cycle failed: {:#}", e);
            }

            tokio::select! {
                () = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}
