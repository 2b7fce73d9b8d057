use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::backend::{DiscBackend, EVENT_CHANNEL_CAPACITY};
use crate::core::error::BackendError;
use crate::core::events::{BackendEvent, DeviceListPayload};
use crate::core::job::{Applied, Job};
use crate::core::models::{
    BlankMode, Device, FormatMode, JobId, JobKind, JobProgress, JobResult, JobState, MediaInfo,
    SpeedOption,
};
use crate::core::project::{BurnOptions, Project};
use crate::logging::LogThrottle;

use super::XorrisoConfig;
use super::commands::XorrisoCommand;
use super::executor::{Executor, XorrisoError};
use super::parser::{self, BLOCK_SIZE, Channel, PktLine};
use super::progress::{self, PacifierUpdate};

pub struct XorrisoBackend {
    inner: Arc<Inner>,
}

struct Inner {
    config: XorrisoConfig,
    executor: Executor,
    events: broadcast::Sender<BackendEvent>,
    slot: Mutex<Slot>,
    capabilities: Mutex<HashMap<String, BTreeSet<String>>>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    progress_log: LogThrottle,
}

/// The one operation this backend runs (or last ran).
#[derive(Default)]
struct Slot {
    job: Option<Job>,
    cancel: Option<CancellationToken>,
    log_seq: u64,
}

/// Fixed facts about a running operation, used to fill in progress.
struct RunContext {
    id: JobId,
    device_path: String,
    bytes_total: u64,
    started: Instant,
}

impl XorrisoBackend {
    pub fn new(config: XorrisoConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                executor: Executor::new(config.binary.clone()),
                config,
                events,
                slot: Mutex::new(Slot::default()),
                capabilities: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                monitor: Mutex::new(None),
                progress_log: LogThrottle::new(Duration::from_secs(5)),
            }),
        }
    }

    /// Claim the operation slot for a new job.
    fn launch(&self, kind: JobKind, device_path: &str) -> Result<RunContextSeed, BackendError> {
        let mut slot = self.inner.slot();
        if let Some(job) = slot.job.as_ref().filter(|j| j.is_busy()) {
            return Err(BackendError::Rejected(format!(
                "a {} is already running on {}",
                job.kind, job.device_path
            )));
        }

        let id = Uuid::now_v7().to_string();
        let cancel = self.inner.shutdown.child_token();
        slot.job = Some(Job::new(id.clone(), kind, device_path));
        slot.cancel = Some(cancel.clone());
        slot.log_seq = 0;
        info!(job_id = %id, kind = %kind, device = %device_path, "xorriso operation started");

        Ok(RunContextSeed { id, cancel })
    }
}

struct RunContextSeed {
    id: JobId,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        lock(&self.slot)
    }

    fn emit(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            debug!("No subscribers for backend event");
        }
    }

    /// Apply `f` to the running job if it is still `id`, and emit the event
    /// it returns when something changed.
    fn with_job(&self, id: &str, f: impl FnOnce(&mut Job) -> Option<BackendEvent>) -> bool {
        let event = {
            let mut slot = self.slot();
            match slot.job.as_mut() {
                Some(job) if job.id == id => f(job),
                _ => None,
            }
        };
        match event {
            Some(event) => {
                self.emit(event);
                true
            }
            None => false,
        }
    }

    fn log(&self, id: &str, text: impl Into<String>) {
        let text = text.into();
        let seq = {
            let mut slot = self.slot();
            if slot.job.as_ref().is_none_or(|j| j.id != id) {
                return;
            }
            slot.log_seq += 1;
            slot.log_seq
        };
        self.emit(BackendEvent::log_line(id, text, Some(seq)));
    }

    fn set_state(&self, id: &str, state: JobState) {
        self.with_job(id, |job| {
            (job.apply_state(state) != Applied::Ignored)
                .then(|| BackendEvent::state_changed(job.id.clone(), state))
        });
    }

    fn apply_update(&self, ctx: &RunContext, update: PacifierUpdate) {
        let elapsed = ctx.started.elapsed().as_secs();
        self.with_job(&ctx.id, |job| {
            let mut next = job.progress.clone();
            if update.phase.as_str() != next.phase {
                // A new phase restarts the percentage.
                next.percent = 0.0;
            }
            next.phase = update.phase.as_str().to_string();

            let block_bytes = update.blocks.map(|b| b * BLOCK_SIZE);
            next.bytes_total = ctx.bytes_total;
            if let Some(bytes) = block_bytes {
                next.bytes_written = bytes;
            }
            next.percent = match (update.percent, block_bytes) {
                (Some(pct), _) => pct,
                (None, Some(bytes)) if ctx.bytes_total > 0 => {
                    bytes as f64 * 100.0 / ctx.bytes_total as f64
                }
                _ => next.percent,
            };
            if let Some(fifo) = update.fifo_fill {
                next.fifo_fill = fifo;
            }
            if let Some(speed) = update.speed {
                next.speed = speed;
            }
            next.eta = progress::estimate_eta(elapsed, next.percent).unwrap_or_default();

            (job.apply_progress(next) != Applied::Ignored)
                .then(|| BackendEvent::progress(job.id.clone(), job.progress.clone()))
        });

        if self.progress_log.should_log() {
            if let Some(job) = self.slot().job.as_ref() {
                debug!(job_id = %job.id, phase = %job.progress.phase, percent = job.progress.percent, "xorriso progress");
            }
        }
    }

    fn on_line(&self, ctx: &RunContext, pkt: &PktLine) {
        if pkt.channel != Channel::Info || pkt.text.trim().is_empty() {
            return;
        }
        match progress::parse_pacifier(&pkt.text) {
            Some(update) => self.apply_update(ctx, update),
            None => self.log(&ctx.id, parser::strip_prefix(&pkt.text)),
        }
    }

    fn finish(&self, ctx: &RunContext, outcome: Result<String, XorrisoError>) {
        let duration = ctx.started.elapsed().as_secs();
        let finished = self.with_job(&ctx.id, |job| match &outcome {
            Ok(message) => {
                let result = JobResult {
                    bytes_written: Some(job.progress.bytes_written),
                    duration_secs: Some(duration),
                    ..JobResult::succeeded(message.clone())
                };
                (job.complete(result.clone()) == Applied::Finished)
                    .then(|| BackendEvent::complete(job.id.clone(), result))
            }
            Err(XorrisoError::Cancelled) => (job.apply_state(JobState::Cancelled)
                == Applied::Finished)
                .then(|| BackendEvent::state_changed(job.id.clone(), JobState::Cancelled)),
            Err(err) => (job.fail(err.to_string()) == Applied::Finished)
                .then(|| BackendEvent::error(job.id.clone(), err.to_string())),
        });

        if finished {
            match &outcome {
                Ok(_) => info!(job_id = %ctx.id, duration_secs = duration, "xorriso operation complete"),
                Err(err) => warn!(job_id = %ctx.id, error = %err, "xorriso operation ended without success"),
            }
            self.slot().cancel = None;
            self.emit(BackendEvent::media_changed(ctx.device_path.clone()));
        }
    }

    async fn run_burn(
        self: Arc<Self>,
        ctx: RunContext,
        project: Project,
        options: BurnOptions,
        cancel: CancellationToken,
    ) {
        self.log(
            &ctx.id,
            format!(
                "Writing '{}' ({} entries) to {}",
                project.name,
                project.entries.len(),
                ctx.device_path
            ),
        );
        if options.dummy_mode {
            self.log(&ctx.id, "Simulation mode: the laser stays off");
        }

        let burn = XorrisoCommand::burn(&project, &ctx.device_path, &options);
        let written = self
            .bounded(
                self.executor
                    .run_streaming(&burn, &cancel, |pkt| self.on_line(&ctx, pkt)),
            )
            .await
            .and_then(|out| out.check());
        if let Err(err) = written {
            return self.finish(&ctx, Err(err));
        }

        if options.verifies() {
            self.set_state(&ctx.id, JobState::Verifying);
            self.log(&ctx.id, "Verifying written data");
            let outcome = self.verify(&ctx, options.eject, &cancel).await;
            return self.finish(&ctx, outcome.map(|_| "Burn completed and verified".to_string()));
        }

        self.finish(&ctx, Ok("Burn completed successfully".to_string()));
    }

    async fn verify(
        &self,
        ctx: &RunContext,
        eject: bool,
        cancel: &CancellationToken,
    ) -> Result<(), XorrisoError> {
        let check = XorrisoCommand::verify(&ctx.device_path, eject);
        let output = self
            .bounded(
                self.executor
                    .run_streaming(&check, cancel, |pkt| self.on_line(ctx, pkt)),
            )
            .await?
            .check()?;

        let summary = parser::parse_check_media(output.lines());
        if summary.bad_blocks > 0 {
            return Err(XorrisoError::Failed {
                code: None,
                message: format!(
                    "Verification found {} unreadable blocks",
                    summary.bad_blocks
                ),
            });
        }
        self.log(
            &ctx.id,
            format!("Verification passed: {} blocks readable", summary.good_blocks),
        );
        Ok(())
    }

    async fn run_simple(
        self: Arc<Self>,
        ctx: RunContext,
        cmd: XorrisoCommand,
        done: &'static str,
        cancel: CancellationToken,
    ) {
        let outcome = self
            .bounded(
                self.executor
                    .run_streaming(&cmd, &cancel, |pkt| self.on_line(&ctx, pkt)),
            )
            .await
            .and_then(|out| out.check())
            .map(|_| done.to_string());
        self.finish(&ctx, outcome);
    }

    /// Bound one xorriso pass by the operation timeout. The child is killed
    /// when the pass is dropped.
    async fn bounded<T>(
        &self,
        pass: impl Future<Output = Result<T, XorrisoError>>,
    ) -> Result<T, XorrisoError> {
        let limit = self.config.operation_timeout;
        tokio::time::timeout(limit, pass)
            .await
            .map_err(|_| XorrisoError::Timeout(limit))?
    }

    fn busy_on(&self, device_path: &str) -> bool {
        self.slot()
            .job
            .as_ref()
            .is_some_and(|j| j.is_busy() && j.device_path == device_path)
    }

    async fn discover(&self) -> Result<Vec<Device>, BackendError> {
        let mut devices = match tokio::fs::read_to_string(&self.config.cdrom_info).await {
            Ok(info) => {
                let mut devices = Vec::new();
                for name in parser::parse_cdrom_info(&info) {
                    devices.push(self.sysfs_device(&name).await);
                }
                devices
            }
            Err(err) => {
                debug!(path = %self.config.cdrom_info.display(), error = %err, "No cdrom info, asking xorriso");
                let mut cmd = XorrisoCommand::new();
                cmd.device_links();
                let output = self
                    .executor
                    .run(&cmd, self.config.query_timeout)
                    .await?
                    .check()?;
                parser::parse_device_links(output.lines())
            }
        };

        for device in &mut devices {
            device.capabilities = self.capabilities(&device.path).await;
        }
        Ok(devices)
    }

    async fn sysfs_device(&self, name: &str) -> Device {
        let base = self.config.sysfs_block.join(name).join("device");
        let vendor = read_sys_file(&base.join("vendor")).await;
        let model = read_sys_file(&base.join("model")).await;
        let path = format!("/dev/{name}");
        Device {
            name: parser::display_name(&vendor, &model, &path),
            path,
            vendor,
            model,
            capabilities: BTreeSet::new(),
        }
    }

    /// Disc types the drive can write, from `-list_profiles`. Cached per
    /// drive once known; a failed inquiry is retried on the next listing.
    async fn capabilities(&self, device_path: &str) -> BTreeSet<String> {
        if let Some(known) = lock(&self.capabilities).get(device_path) {
            return known.clone();
        }
        if self.busy_on(device_path) {
            return BTreeSet::new();
        }

        let mut cmd = XorrisoCommand::new();
        cmd.outdev(device_path).list_profiles("all");
        match self.executor.run(&cmd, self.config.query_timeout).await {
            Ok(output) => {
                let caps = parser::capabilities(&parser::parse_profiles(output.lines()));
                if !caps.is_empty() {
                    lock(&self.capabilities).insert(device_path.to_string(), caps.clone());
                }
                caps
            }
            Err(err) => {
                debug!(device = %device_path, error = %err, "Profile inquiry failed");
                BTreeSet::new()
            }
        }
    }

    async fn watch_devices(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<Vec<Device>> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.discover().await {
                Ok(devices) => {
                    if last.as_ref().is_some_and(|prev| *prev != devices) {
                        info!(count = devices.len(), "Drive list changed");
                        self.emit(BackendEvent::DeviceListUpdated(DeviceListPayload {
                            devices: devices.clone(),
                        }));
                    }
                    last = Some(devices);
                }
                Err(err) => debug!(error = %err, "Drive poll failed"),
            }
        }
        debug!("Drive monitor stopped");
    }
}

async fn read_sys_file(path: &Path) -> String {
    tokio::fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl DiscBackend for XorrisoBackend {
    async fn start_burn(
        &self,
        project: &Project,
        device_path: &str,
        options: &BurnOptions,
    ) -> Result<JobId, BackendError> {
        if project.entries.is_empty() {
            return Err(BackendError::Rejected("the project has no files".into()));
        }
        let seed = self.launch(JobKind::Burn, device_path)?;
        let ctx = RunContext {
            id: seed.id.clone(),
            device_path: device_path.to_string(),
            bytes_total: project.total_size(),
            started: Instant::now(),
        };
        tokio::spawn(Arc::clone(&self.inner).run_burn(
            ctx,
            project.clone(),
            options.clone(),
            seed.cancel,
        ));
        Ok(seed.id)
    }

    async fn cancel_burn(&self, job_id: &str) -> Result<(), BackendError> {
        let slot = self.inner.slot();
        match (&slot.job, &slot.cancel) {
            (Some(job), cancel) if job.id == job_id => {
                if let (true, Some(token)) = (job.is_busy(), cancel) {
                    info!(job_id = %job_id, "Cancelling xorriso operation");
                    token.cancel();
                }
                Ok(())
            }
            _ => Err(BackendError::JobNotFound(job_id.to_string())),
        }
    }

    async fn blank_disc(
        &self,
        device_path: &str,
        mode: BlankMode,
    ) -> Result<Option<JobId>, BackendError> {
        let seed = self.launch(JobKind::Blank, device_path)?;
        let mut cmd = XorrisoCommand::new();
        cmd.abort_on("FAILURE").dev(device_path).blank(mode);
        let ctx = RunContext {
            id: seed.id.clone(),
            device_path: device_path.to_string(),
            bytes_total: 0,
            started: Instant::now(),
        };
        tokio::spawn(Arc::clone(&self.inner).run_simple(
            ctx,
            cmd,
            "Disc blanked",
            seed.cancel,
        ));
        Ok(Some(seed.id))
    }

    async fn format_disc(
        &self,
        device_path: &str,
        mode: FormatMode,
    ) -> Result<Option<JobId>, BackendError> {
        let seed = self.launch(JobKind::Format, device_path)?;
        let mut cmd = XorrisoCommand::new();
        cmd.abort_on("FAILURE").dev(device_path).format(mode);
        let ctx = RunContext {
            id: seed.id.clone(),
            device_path: device_path.to_string(),
            bytes_total: 0,
            started: Instant::now(),
        };
        tokio::spawn(Arc::clone(&self.inner).run_simple(
            ctx,
            cmd,
            "Disc formatted",
            seed.cancel,
        ));
        Ok(Some(seed.id))
    }

    async fn get_job_status(&self, job_id: &str) -> Result<Option<Job>, BackendError> {
        Ok(self
            .inner
            .slot()
            .job
            .as_ref()
            .filter(|j| j.id == job_id)
            .cloned())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, BackendError> {
        self.inner.discover().await
    }

    async fn get_media_info(&self, device_path: &str) -> Result<MediaInfo, BackendError> {
        let output = self
            .inner
            .executor
            .run(&XorrisoCommand::media_info(device_path), self.inner.config.query_timeout)
            .await?;

        let summary = parser::parse_media_summary(output.lines());
        if !summary.has_media() {
            if summary.media_type.is_empty() {
                // Neither a medium nor an explicit "not present": the drive
                // could not be inquired at all.
                output.check()?;
            }
            return Ok(MediaInfo {
                media_type: "none".into(),
                media_status: "empty".into(),
                ..Default::default()
            });
        }

        let free = parser::parse_media_space(output.lines()).unwrap_or(0) * BLOCK_SIZE;
        let used = summary.data_blocks * BLOCK_SIZE;
        Ok(MediaInfo {
            media_type: summary.media_type,
            media_status: summary.status,
            media_label: summary.label,
            total_capacity: used + free,
            free_space: free,
            sessions: summary.sessions,
            tracks: summary.tracks,
        })
    }

    async fn get_speeds(&self, device_path: &str) -> Result<Vec<SpeedOption>, BackendError> {
        let mut cmd = XorrisoCommand::new();
        cmd.dev(device_path).list_speeds();
        let output = self
            .inner
            .executor
            .run(&cmd, self.inner.config.query_timeout)
            .await?
            .check()?;
        Ok(parser::parse_speeds(output.lines()))
    }

    async fn eject_disc(&self, device_path: &str) -> Result<(), BackendError> {
        if self.inner.busy_on(device_path) {
            return Err(BackendError::Rejected(format!(
                "{device_path} is busy with a running operation"
            )));
        }
        let mut cmd = XorrisoCommand::new();
        cmd.dev(device_path).eject();
        self.inner
            .executor
            .run(&cmd, self.inner.config.query_timeout)
            .await?
            .check()?;

        self.inner.emit(BackendEvent::media_changed(device_path));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }

    fn start_monitor(&self, interval: Duration) {
        let mut monitor = lock(&self.inner.monitor);
        if monitor.is_some() {
            return;
        }
        info!(interval_secs = interval.as_secs(), "Starting drive monitor");
        *monitor = Some(tokio::spawn(Arc::clone(&self.inner).watch_devices(interval)));
    }

    fn stop(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = lock(&self.inner.monitor).take() {
            handle.abort();
        }
    }

    fn name(&self) -> &'static str {
        "xorriso"
    }
}
