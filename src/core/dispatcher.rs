//! Outward-facing commands.
//!
//! Every command resolves once the backend accepted or refused it. What the
//! operation then does is only observed through the event pump. Commands on
//! the same target (drive path or job id) run one at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::backend::DiscBackend;
use super::error::{BackendError, OrchestratorError, Result};
use super::job::{Applied, Job};
use super::models::{BlankMode, FormatMode, JobId, JobKind};
use super::project::{BurnOptions, Project};
use super::registry::DeviceRegistry;
use super::sync::SubscriptionManager;
use super::tracker::JobTracker;

pub struct CommandDispatcher {
    backend: Arc<dyn DiscBackend>,
    tracker: Arc<JobTracker>,
    registry: Arc<DeviceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    locks: TargetLocks,
}

impl CommandDispatcher {
    pub fn new(
        backend: Arc<dyn DiscBackend>,
        tracker: Arc<JobTracker>,
        registry: Arc<DeviceRegistry>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            backend,
            tracker,
            registry,
            subscriptions,
            locks: TargetLocks::default(),
        }
    }

    pub async fn start_burn(
        &self,
        project: &Project,
        device_path: &str,
        options: &BurnOptions,
    ) -> Result<JobId> {
        let _guard = self.locks.acquire(device_path).await;
        let _launch = self.tracker.reserve_launch(JobKind::Burn, device_path)?;
        self.tracker.append_log(format!(
            "Starting burn of '{}' ({} entries) on {device_path}",
            project.name,
            project.entries.len()
        ));

        match self
            .backend
            .start_burn(project, device_path, options)
            .await
        {
            Ok(id) => {
                self.launched(Job::new(id.clone(), JobKind::Burn, device_path))
                    .await;
                Ok(id)
            }
            Err(err) => Err(self.launch_failed(JobKind::Burn, device_path, err)),
        }
    }

    pub async fn blank_disc(&self, device_path: &str, mode: BlankMode) -> Result<JobId> {
        let _guard = self.locks.acquire(device_path).await;
        let _launch = self.tracker.reserve_launch(JobKind::Blank, device_path)?;
        self.tracker
            .append_log(format!("Blanking disc in {device_path} (mode: {mode})"));

        let assigned = self.backend.blank_disc(device_path, mode).await;
        self.resolve_launch(JobKind::Blank, device_path, assigned)
            .await
    }

    pub async fn format_disc(&self, device_path: &str, mode: FormatMode) -> Result<JobId> {
        let _guard = self.locks.acquire(device_path).await;
        let _launch = self.tracker.reserve_launch(JobKind::Format, device_path)?;
        self.tracker
            .append_log(format!("Formatting disc in {device_path} (mode: {mode})"));

        let assigned = self.backend.format_disc(device_path, mode).await;
        self.resolve_launch(JobKind::Format, device_path, assigned)
            .await
    }

    async fn resolve_launch(
        &self,
        kind: JobKind,
        device_path: &str,
        assigned: std::result::Result<Option<JobId>, BackendError>,
    ) -> Result<JobId> {
        match assigned {
            Ok(Some(id)) => {
                self.launched(Job::new(id.clone(), kind, device_path)).await;
                Ok(id)
            }
            Ok(None) => {
                let mut job = Job::new(Job::synthesize_id(kind), kind, device_path);
                job.local_id = true;
                let id = job.id.clone();
                debug!(job_id = %id, "Backend assigned no id, using a local one");
                self.launched(job).await;
                Ok(id)
            }
            Err(err) => Err(self.launch_failed(kind, device_path, err)),
        }
    }

    async fn launched(&self, job: Job) {
        let device_path = job.device_path.clone();
        info!(job_id = %job.id, kind = %job.kind, device = %device_path, "Operation accepted");
        let launched = self.tracker.launch_succeeded(job);
        for event in &launched.replayed {
            self.subscriptions.publish(event);
        }
        if launched.applied == Applied::Finished && self.registry.is_selected(&device_path) {
            self.registry.refresh().await;
        }
    }

    /// The initiating command failed: record a terminal job so the caller
    /// sees the operation did not proceed.
    fn launch_failed(&self, kind: JobKind, device_path: &str, err: BackendError) -> OrchestratorError {
        warn!(kind = %kind, device = %device_path, error = %err, "Operation refused by backend");
        let mut job = Job::failed_to_start(
            Job::synthesize_id(kind),
            kind,
            device_path,
            err.to_string(),
        );
        job.local_id = true;
        self.tracker.launch_failed(job);
        OrchestratorError::from_command(err)
    }

    /// Ask the backend to cancel the current job.
    ///
    /// A no-op when there is no active job with a backend id. The job only
    /// becomes `cancelled` once the backend reports it.
    pub async fn cancel_burn(&self) -> Result<()> {
        let Some(job) = self.tracker.job() else {
            debug!("Cancel requested with no current job");
            return Ok(());
        };
        if !job.is_busy() || job.cancel_requested {
            debug!(job_id = %job.id, state = %job.state, "Nothing to cancel");
            return Ok(());
        }
        if job.local_id {
            self.tracker
                .append_log("This operation cannot be cancelled once started.");
            return Ok(());
        }

        let _guard = self.locks.acquire(&job.id).await;
        match self.backend.cancel_burn(&job.id).await {
            Ok(()) => {
                info!(job_id = %job.id, "Cancellation requested");
                self.tracker.mark_cancel_requested(&job.id);
                self.tracker.append_log("Cancellation requested...");
                Ok(())
            }
            Err(BackendError::JobNotFound(_)) => {
                warn!(job_id = %job.id, "Backend does not know the job being cancelled");
                self.tracker.drop_stale(&job.id);
                Ok(())
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "Cancel refused");
                self.tracker.append_log(format!("Cancel failed: {err}"));
                Err(OrchestratorError::from_command(err))
            }
        }
    }

    /// Eject the disc in `device_path`. Refused while a job runs on it.
    pub async fn eject_disc(&self, device_path: &str) -> Result<()> {
        let _guard = self.locks.acquire(device_path).await;
        if self.tracker.busy_on(device_path) {
            warn!(device = %device_path, "Refusing to eject during an active operation");
            return Err(OrchestratorError::DeviceBusy {
                device: device_path.to_string(),
            });
        }

        self.registry.eject(device_path).await.inspect_err(|err| {
            warn!(device = %device_path, error = %err, "Eject failed");
        })
    }
}

/// One async mutex per command target.
#[derive(Default)]
struct TargetLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TargetLocks {
    async fn acquire(&self, target: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on are only referenced by the map.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(target.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
