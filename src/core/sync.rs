//! Event synchronization: one pump task drains the backend's push channel
//! and routes every event to the job tracker or the device registry. Events
//! that changed something are then fanned out to in-process subscribers.
//!
//! Polling via [`EventSync::fetch_job_status`] is the fallback when pushes
//! are lost. Each pull is tagged with the job id it asked about and its
//! result is dropped if that job was superseded meanwhile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::DiscBackend;
use super::error::{BackendError, OrchestratorError, Result};
use super::events::{BackendEvent, Topic};
use super::job::{Applied, Job};
use super::registry::DeviceRegistry;
use super::tracker::JobTracker;

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&BackendEvent) + Send + Sync>;

/// Topic-keyed fan-out of applied events.
#[derive(Default)]
pub struct SubscriptionManager {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Topic, Handler)>>,
}

impl SubscriptionManager {
    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Topic, Handler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&BackendEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().push((id, topic, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(sub, _, _)| *sub != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handlers run outside the lock so they may (un)subscribe themselves.
    pub fn publish(&self, event: &BackendEvent) {
        let topic = event.topic();
        let matching: Vec<Handler> = self
            .lock()
            .iter()
            .filter(|(_, t, _)| *t == topic)
            .map(|(_, _, h)| h.clone())
            .collect();

        for handler in matching {
            handler(event);
        }
    }
}

pub struct EventSync {
    backend: Arc<dyn DiscBackend>,
    tracker: Arc<JobTracker>,
    registry: Arc<DeviceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl EventSync {
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
            shutdown: CancellationToken::new(),
            pump: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Join the backend's push channel and start routing events.
    ///
    /// Later calls are no-ops and return `false`: there is only ever one
    /// pump, so no event is delivered twice.
    pub fn init(self: &Arc<Self>) -> bool {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_some() {
            debug!("Event sync already initialized");
            return false;
        }

        // Subscribe before returning so events sent right after init are seen.
        let rx = self.backend.subscribe();
        let this = Arc::clone(self);
        *pump = Some(tokio::spawn(this.run(rx)));
        info!(backend = self.backend.name(), "Event sync started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<BackendEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => self.handle(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Push channel lagged, reconciling by poll");
                        self.spawn_reconcile();
                    }
                    Err(RecvError::Closed) => {
                        info!("Push channel closed");
                        break;
                    }
                },
            }
        }
        debug!("Event pump stopped");
    }

    /// Events dropped from the push channel are lost for good: pull the job
    /// and the drive state instead.
    fn spawn_reconcile(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.fetch_job_status().await {
                warn!(error = %err, "Job reconciliation after lag failed");
            }
            if let Err(err) = this.registry.list_devices().await {
                debug!(error = %err, "Device reconciliation after lag failed");
            }
            this.registry.refresh().await;
        });
    }

    /// Route one push event and, if it was applied, publish it. Media
    /// refreshes it triggers run in the background so the pump keeps
    /// draining.
    pub fn handle(&self, event: &BackendEvent) {
        let applied = match event {
            BackendEvent::DeviceListUpdated(payload) => {
                if self
                    .registry
                    .apply_device_list(payload.devices.clone())
                    .is_some()
                {
                    self.spawn_refresh();
                }
                true
            }
            BackendEvent::DeviceMediaChanged(payload) => {
                let selected = self.registry.is_selected(&payload.device_path);
                if selected {
                    debug!(device = %payload.device_path, "Media changed in selected drive");
                    self.spawn_refresh();
                } else {
                    debug!(device = %payload.device_path, "Media changed in unselected drive, ignoring");
                }
                selected
            }
            _ => match self.tracker.apply(event) {
                Applied::Ignored => false,
                Applied::Updated => true,
                Applied::Finished => {
                    self.refresh_if_selected(self.tracker.job());
                    true
                }
            },
        };

        if applied {
            self.subscriptions.publish(event);
        }
    }

    fn refresh_if_selected(&self, job: Option<Job>) {
        if let Some(job) = job {
            if self.registry.is_selected(&job.device_path) {
                self.spawn_refresh();
            }
        }
    }

    fn spawn_refresh(&self) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move { registry.refresh().await });
    }

    /// Pull the current job from the backend and reconcile.
    ///
    /// Terminal jobs and jobs with a locally made-up id are not polled. If
    /// the backend has forgotten an active job, the local projection is
    /// reset.
    pub async fn fetch_job_status(&self) -> Result<Option<Job>> {
        let Some(job) = self.tracker.job() else {
            return Ok(None);
        };
        if !job.is_busy() || job.local_id {
            return Ok(Some(job));
        }

        let target = job.id;
        match self.backend.get_job_status(&target).await {
            Ok(Some(pulled)) => {
                if self.tracker.reconcile(&target, pulled) == Applied::Finished {
                    info!(job_id = %target, "Job finished according to status poll");
                    self.refresh_if_selected(self.tracker.job());
                }
            }
            Ok(None) | Err(BackendError::JobNotFound(_)) => {
                self.tracker.drop_stale(&target);
            }
            Err(err) => {
                warn!(job_id = %target, error = %err, "Job status poll failed");
                return Err(OrchestratorError::from_query(err));
            }
        }
        Ok(self.tracker.job())
    }

    /// Poll the active job every `period` until shutdown.
    pub fn spawn_status_poller(self: &Arc<Self>, period: Duration) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return;
        }

        let this = Arc::clone(self);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if this.tracker.is_busy() {
                            if let Err(err) = this.fetch_job_status().await {
                                debug!(error = %err, "Periodic status poll failed");
                            }
                        }
                    }
                }
            }
        }));
        info!(period_secs = period.as_secs(), "Status poller started");
    }

    /// Stop the pump and the poller and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = [
            self.pump
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
            self.poller
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        ];
        for handle in handles.into_iter().flatten() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Sync task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_only_reaches_matching_topic() {
        let manager = SubscriptionManager::default();
        let progress = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let p = progress.clone();
        manager.subscribe(Topic::JobProgress, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let e = errors.clone();
        manager.subscribe(Topic::JobError, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        manager.publish(&BackendEvent::error("job-1", "boom"));
        manager.publish(&BackendEvent::error("job-1", "boom"));

        assert_eq!(progress.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribed_handlers_stop_receiving() {
        let manager = SubscriptionManager::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = manager.subscribe(Topic::DeviceMediaChanged, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        manager.publish(&BackendEvent::media_changed("/dev/sr0"));

        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));
        manager.publish(&BackendEvent::media_changed("/dev/sr0"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }
}
