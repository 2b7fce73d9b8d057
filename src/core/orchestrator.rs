use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::context::AppContext;

use super::backend::DiscBackend;
use super::dispatcher::CommandDispatcher;
use super::error::Result;
use super::job::Job;
use super::models::LogLine;
use super::registry::DeviceRegistry;
use super::sync::{EventSync, SubscriptionManager};
use super::tracker::JobTracker;

/// Wires the registry, job tracker, dispatcher and event pump around one
/// backend, and hands the UI read access to their projections.
pub struct Orchestrator {
    ctx: AppContext,
    tracker: Arc<JobTracker>,
    registry: Arc<DeviceRegistry>,
    dispatcher: CommandDispatcher,
    sync: Arc<EventSync>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let backend = Arc::clone(&ctx.backend);
        let tracker = Arc::new(JobTracker::new());
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&backend)));
        let subscriptions = Arc::new(SubscriptionManager::default());
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&backend),
            Arc::clone(&tracker),
            Arc::clone(&registry),
            Arc::clone(&subscriptions),
        );
        let sync = Arc::new(EventSync::new(
            backend,
            Arc::clone(&tracker),
            Arc::clone(&registry),
            subscriptions,
        ));

        Self {
            ctx,
            tracker,
            registry,
            dispatcher,
            sync,
        }
    }

    /// Start event routing, drive monitoring and the initial device listing.
    ///
    /// An unreachable backend is not fatal: the device list stays empty
    /// until a later refresh or a `device:list-updated` event.
    pub async fn start(&self) {
        info!(backend = self.ctx.backend.name(), "Orchestrator starting");
        self.sync.init();

        let config = &self.ctx.config;
        self.ctx
            .backend
            .start_monitor(Duration::from_secs(config.device_poll_interval_secs.max(1)));

        if let Err(err) = self.registry.list_devices().await {
            warn!(error = %err, "Initial device listing failed");
        }

        if config.status_poll_interval_secs > 0 {
            self.sync
                .spawn_status_poller(Duration::from_secs(config.status_poll_interval_secs));
        }
    }

    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.sync.shutdown().await;
        self.ctx.backend.stop();
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn backend(&self) -> &Arc<dyn DiscBackend> {
        &self.ctx.backend
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn sync(&self) -> &Arc<EventSync> {
        &self.sync
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn current_job(&self) -> Option<Job> {
        self.tracker.job()
    }

    pub fn subscribe_job(&self) -> watch::Receiver<Option<Job>> {
        self.tracker.subscribe_job()
    }

    pub fn log_lines(&self) -> Vec<LogLine> {
        self.tracker.log_lines()
    }

    pub async fn fetch_job_status(&self) -> Result<Option<Job>> {
        self.sync.fetch_job_status().await
    }

    /// Forget the current job and its log.
    pub fn reset_job(&self) {
        self.tracker.reset();
    }
}
