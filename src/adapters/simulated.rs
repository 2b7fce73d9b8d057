//! In-memory backend driven by a [`Simulator`] handle.
//!
//! Nothing happens on its own: drives, discs and job progress appear only
//! when the controller injects them. Every backend call is recorded, and a
//! call can be made to fail or stall once, so tests can observe exactly
//! what the orchestrator asked for.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::backend::{DiscBackend, EVENT_CHANNEL_CAPACITY};
use crate::core::error::BackendError;
use crate::core::events::BackendEvent;
use crate::core::job::{Applied, Job};
use crate::core::models::{
    BlankMode, Device, FormatMode, JobId, JobKind, JobProgress, JobResult, JobState, MediaInfo,
    SpeedOption,
};
use crate::core::project::{BurnOptions, Project};

/// The backend calls, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartBurn,
    CancelBurn,
    BlankDisc,
    FormatDisc,
    GetJobStatus,
    ListDevices,
    GetMediaInfo,
    GetSpeeds,
    EjectDisc,
}

struct SimJob {
    job: Job,
    /// Whether the caller was told the id. Events for jobs it was not told
    /// about go out without a `jobId`.
    announced: bool,
}

struct SimState {
    devices: Vec<Device>,
    media: HashMap<String, MediaInfo>,
    speeds: HashMap<String, Vec<SpeedOption>>,
    jobs: HashMap<JobId, SimJob>,
    next_job: u64,
    calls: Vec<Operation>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    delays: HashMap<Operation, VecDeque<Duration>>,
    assign_ids: bool,
    auto_cancel: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            media: HashMap::new(),
            speeds: HashMap::new(),
            jobs: HashMap::new(),
            next_job: 0,
            calls: Vec::new(),
            failures: HashMap::new(),
            delays: HashMap::new(),
            assign_ids: true,
            auto_cancel: true,
        }
    }
}

impl SimState {
    fn busy_job(&self) -> Option<&SimJob> {
        self.jobs.values().find(|j| j.job.is_busy())
    }

    fn new_job(&mut self, kind: JobKind, device_path: &str, announced: bool) -> JobId {
        self.next_job += 1;
        let id = format!("job-{}", self.next_job);
        self.jobs.insert(
            id.clone(),
            SimJob {
                job: Job::new(id.clone(), kind, device_path),
                announced,
            },
        );
        id
    }
}

struct Shared {
    state: Mutex<SimState>,
    events: broadcast::Sender<BackendEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            debug!("(Simulator) No subscribers for event");
        }
    }

    /// Record the call, then apply any injected delay and failure.
    async fn enter(&self, op: Operation) -> Result<(), BackendError> {
        let (delay, failure) = {
            let mut state = self.lock();
            state.calls.push(op);
            let delay = state.delays.get_mut(&op).and_then(VecDeque::pop_front);
            let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct SimulatedBackend {
    shared: Arc<Shared>,
}

/// Controller for a [`SimulatedBackend`].
#[derive(Clone)]
pub struct Simulator {
    shared: Arc<Shared>,
}

impl SimulatedBackend {
    pub fn new() -> (Self, Simulator) {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState::default()),
            events,
        });

        (
            Self {
                shared: Arc::clone(&shared),
            },
            Simulator { shared },
        )
    }
}

fn busy_error(job: &SimJob) -> BackendError {
    BackendError::Rejected(format!(
        "drive {} is busy with {} {}",
        job.job.device_path, job.job.kind, job.job.id
    ))
}

#[async_trait]
impl DiscBackend for SimulatedBackend {
    async fn start_burn(
        &self,
        project: &Project,
        device_path: &str,
        _options: &BurnOptions,
    ) -> Result<JobId, BackendError> {
        self.shared.enter(Operation::StartBurn).await?;
        let mut state = self.shared.lock();
        if let Some(job) = state.busy_job() {
            return Err(busy_error(job));
        }
        let id = state.new_job(JobKind::Burn, device_path, true);
        debug!(job_id = %id, project = %project.name, "(Simulator) Burn accepted");
        Ok(id)
    }

    async fn cancel_burn(&self, job_id: &str) -> Result<(), BackendError> {
        self.shared.enter(Operation::CancelBurn).await?;
        let event = {
            let mut state = self.shared.lock();
            let auto_cancel = state.auto_cancel;
            let sim = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| BackendError::JobNotFound(job_id.to_string()))?;
            if !sim.job.is_busy() {
                return Ok(());
            }
            sim.job.cancel_requested = true;
            if !auto_cancel {
                return Ok(());
            }
            sim.job.apply_state(JobState::Cancelled);
            BackendEvent::state_changed(job_id, JobState::Cancelled)
        };
        self.shared.send(event);
        Ok(())
    }

    async fn blank_disc(
        &self,
        device_path: &str,
        mode: BlankMode,
    ) -> Result<Option<JobId>, BackendError> {
        self.shared.enter(Operation::BlankDisc).await?;
        let mut state = self.shared.lock();
        if let Some(job) = state.busy_job() {
            return Err(busy_error(job));
        }
        let announce = state.assign_ids;
        let id = state.new_job(JobKind::Blank, device_path, announce);
        debug!(job_id = %id, mode = %mode, "(Simulator) Blank accepted");
        Ok(announce.then_some(id))
    }

    async fn format_disc(
        &self,
        device_path: &str,
        mode: FormatMode,
    ) -> Result<Option<JobId>, BackendError> {
        self.shared.enter(Operation::FormatDisc).await?;
        let mut state = self.shared.lock();
        if let Some(job) = state.busy_job() {
            return Err(busy_error(job));
        }
        let announce = state.assign_ids;
        let id = state.new_job(JobKind::Format, device_path, announce);
        debug!(job_id = %id, mode = %mode, "(Simulator) Format accepted");
        Ok(announce.then_some(id))
    }

    async fn get_job_status(&self, job_id: &str) -> Result<Option<Job>, BackendError> {
        self.shared.enter(Operation::GetJobStatus).await?;
        let state = self.shared.lock();
        Ok(state
            .jobs
            .get(job_id)
            .filter(|sim| sim.announced)
            .map(|sim| sim.job.clone()))
    }

    async fn list_devices(&self) -> Result<Vec<Device>, BackendError> {
        self.shared.enter(Operation::ListDevices).await?;
        Ok(self.shared.lock().devices.clone())
    }

    async fn get_media_info(&self, device_path: &str) -> Result<MediaInfo, BackendError> {
        self.shared.enter(Operation::GetMediaInfo).await?;
        let state = self.shared.lock();
        Ok(state.media.get(device_path).cloned().unwrap_or_else(|| MediaInfo {
            media_type: "none".into(),
            media_status: "empty".into(),
            ..Default::default()
        }))
    }

    async fn get_speeds(&self, device_path: &str) -> Result<Vec<SpeedOption>, BackendError> {
        self.shared.enter(Operation::GetSpeeds).await?;
        let state = self.shared.lock();
        if let Some(speeds) = state.speeds.get(device_path) {
            return Ok(speeds.clone());
        }
        if !state.media.contains_key(device_path) {
            return Ok(Vec::new());
        }
        Ok(["16x", "4x", "8x"]
            .into_iter()
            .map(|s| SpeedOption {
                label: s.to_string(),
                value: s.to_string(),
            })
            .collect())
    }

    async fn eject_disc(&self, device_path: &str) -> Result<(), BackendError> {
        self.shared.enter(Operation::EjectDisc).await?;
        {
            let mut state = self.shared.lock();
            if let Some(job) = state
                .busy_job()
                .filter(|j| j.job.device_path == device_path)
            {
                return Err(busy_error(job));
            }
            state.media.remove(device_path);
        }
        self.shared.send(BackendEvent::media_changed(device_path));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.shared.events.subscribe()
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

impl Simulator {
    pub fn add_device(&self, device: Device) {
        let devices = {
            let mut state = self.shared.lock();
            state.devices.retain(|d| d.path != device.path);
            state.devices.push(device);
            state.devices.clone()
        };
        self.shared.send(BackendEvent::DeviceListUpdated(
            crate::core::events::DeviceListPayload { devices },
        ));
    }

    pub fn remove_device(&self, device_path: &str) {
        let devices = {
            let mut state = self.shared.lock();
            state.devices.retain(|d| d.path != device_path);
            state.media.remove(device_path);
            state.devices.clone()
        };
        self.shared.send(BackendEvent::DeviceListUpdated(
            crate::core::events::DeviceListPayload { devices },
        ));
    }

    pub fn insert_media(&self, device_path: &str, media: MediaInfo) {
        self.shared
            .lock()
            .media
            .insert(device_path.to_string(), media);
        self.shared.send(BackendEvent::media_changed(device_path));
    }

    pub fn remove_media(&self, device_path: &str) {
        self.shared.lock().media.remove(device_path);
        self.shared.send(BackendEvent::media_changed(device_path));
    }

    pub fn set_speeds(&self, device_path: &str, speeds: Vec<SpeedOption>) {
        self.shared
            .lock()
            .speeds
            .insert(device_path.to_string(), speeds);
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Operation, err: BackendError) {
        self.shared
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Make the next call of `op` take `delay` before answering.
    pub fn delay_next(&self, op: Operation, delay: Duration) {
        self.shared
            .lock()
            .delays
            .entry(op)
            .or_default()
            .push_back(delay);
    }

    /// When off, blank and format hand back no job id.
    pub fn set_assign_ids(&self, assign: bool) {
        self.shared.lock().assign_ids = assign;
    }

    /// When off, an accepted cancel is not followed by a `cancelled` event.
    pub fn set_auto_cancel(&self, auto: bool) {
        self.shared.lock().auto_cancel = auto;
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.shared.lock().calls.clone()
    }

    pub fn count(&self, op: Operation) -> usize {
        self.shared.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Id of the job that is still running, if any.
    pub fn active_job(&self) -> Option<JobId> {
        self.shared.lock().busy_job().map(|j| j.job.id.clone())
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.shared.lock().jobs.get(job_id).map(|sim| sim.job.clone())
    }

    /// Drop a job, as if the backend restarted.
    pub fn forget_job(&self, job_id: &str) {
        self.shared.lock().jobs.remove(job_id);
    }

    /// Send an arbitrary event without touching the simulated jobs.
    pub fn emit(&self, event: BackendEvent) {
        self.shared.send(event);
    }

    pub fn progress(&self, job_id: &str, progress: JobProgress) -> bool {
        self.drive(job_id, |job| {
            let applied = job.apply_progress(progress.clone());
            (applied, BackendEvent::progress(job.id.clone(), job.progress.clone()))
        })
    }

    pub fn log(&self, job_id: &str, line: &str) -> bool {
        self.drive(job_id, |job| {
            (
                Applied::Updated,
                BackendEvent::log_line(job.id.clone(), line, None),
            )
        })
    }

    pub fn complete(&self, job_id: &str, message: &str) -> bool {
        let result = JobResult::succeeded(message);
        self.drive(job_id, |job| {
            let applied = job.complete(result.clone());
            (applied, BackendEvent::complete(job.id.clone(), result.clone()))
        })
    }

    /// Complete a job without sending any event, as if the push got lost.
    pub fn complete_silently(&self, job_id: &str, message: &str) -> bool {
        let mut state = self.shared.lock();
        state.jobs.get_mut(job_id).is_some_and(|sim| {
            sim.job.complete(JobResult::succeeded(message)) != Applied::Ignored
        })
    }

    pub fn fail(&self, job_id: &str, message: &str) -> bool {
        self.drive(job_id, |job| {
            let applied = job.fail(message);
            (applied, BackendEvent::error(job.id.clone(), message))
        })
    }

    /// Update the stored job and send the matching event. Returns false if
    /// the job is unknown or the update changed nothing.
    fn drive(&self, job_id: &str, f: impl FnOnce(&mut Job) -> (Applied, BackendEvent)) -> bool {
        let (event, finished_on) = {
            let mut state = self.shared.lock();
            let Some(sim) = state.jobs.get_mut(job_id) else {
                return false;
            };
            let (applied, mut event) = f(&mut sim.job);
            if applied == Applied::Ignored {
                return false;
            }
            if !sim.announced {
                strip_job_id(&mut event);
            }
            let finished_on = (applied == Applied::Finished).then(|| sim.job.device_path.clone());
            (event, finished_on)
        };

        self.shared.send(event);
        if let Some(device_path) = finished_on {
            self.shared.send(BackendEvent::media_changed(device_path));
        }
        true
    }
}

fn strip_job_id(event: &mut BackendEvent) {
    match event {
        BackendEvent::JobProgress(p) => p.job_id = None,
        BackendEvent::JobStateChanged(p) => p.job_id = None,
        BackendEvent::JobLogLine(p) => p.job_id = None,
        BackendEvent::JobComplete(p) => p.job_id = None,
        BackendEvent::JobError(p) => p.job_id = None,
        BackendEvent::DeviceListUpdated(_) | BackendEvent::DeviceMediaChanged(_) => {}
    }
}
