//! Current-job projection: the one job the UI shows, plus its log.
//!
//! All writes go through the tracker's mutex, so an event handler and a
//! command completion never interleave their updates to the same record.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::{OrchestratorError, Result};
use super::events::BackendEvent;
use super::job::{Applied, Job};
use super::models::{JobId, JobKind, JobState, LogLine};
use super::observe::Observable;

/// Events for a job that is still being launched are held until the start
/// command resolves. Beyond this many they are dropped.
const MAX_EARLY_EVENTS: usize = 256;

pub struct JobTracker {
    state: Mutex<TrackerState>,
    job: Observable<Option<Job>>,
    log: Observable<Vec<LogLine>>,
}

#[derive(Default)]
struct TrackerState {
    last_log_seq: Option<u64>,
    launch: Option<PendingLaunch>,
    launches: u64,
}

struct PendingLaunch {
    ticket: u64,
    kind: JobKind,
    device_path: String,
    early: VecDeque<BackendEvent>,
}

/// Holds a reserved launch open. Dropping it before the launch resolved
/// (the caller gave up on the start command) releases the reservation.
#[must_use = "dropping the guard abandons the launch"]
pub struct LaunchGuard<'a> {
    tracker: &'a JobTracker,
    ticket: u64,
}

impl fmt::Debug for LaunchGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchGuard").field("ticket", &self.ticket).finish()
    }
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        self.tracker.abandon_launch(self.ticket);
    }
}

/// Outcome of [`JobTracker::launch_succeeded`].
#[derive(Debug)]
pub struct Launched {
    pub applied: Applied,
    /// Held events that changed the new job, in arrival order.
    pub replayed: Vec<BackendEvent>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            job: Observable::new(None),
            log: Observable::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn job(&self) -> Option<Job> {
        self.job.get()
    }

    pub fn subscribe_job(&self) -> watch::Receiver<Option<Job>> {
        self.job.subscribe()
    }

    pub fn log_lines(&self) -> Vec<LogLine> {
        self.log.get()
    }

    pub fn subscribe_log(&self) -> watch::Receiver<Vec<LogLine>> {
        self.log.subscribe()
    }

    pub fn current_id(&self) -> Option<JobId> {
        self.job.with(|job| job.as_ref().map(|j| j.id.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.job.with(|job| job.as_ref().is_some_and(Job::is_busy))
    }

    /// Whether the active job, if any, writes to `device_path`.
    pub fn busy_on(&self, device_path: &str) -> bool {
        self.job.with(|job| {
            job.as_ref()
                .is_some_and(|j| j.is_busy() && j.device_path == device_path)
        })
    }

    pub fn append_log(&self, text: impl Into<String>) {
        let _state = self.lock();
        self.push_log(text.into());
    }

    fn push_log(&self, text: String) {
        self.log.update(|lines| {
            lines.push(LogLine::now(text));
            true
        });
    }

    /// Claim the right to start a new operation.
    ///
    /// Fails with `DeviceBusy` while a job is active or another start is
    /// still waiting on the backend. On success the log is cleared for the
    /// new operation. The reservation lasts until the launch is resolved or
    /// the returned guard is dropped.
    pub fn reserve_launch(&self, kind: JobKind, device_path: &str) -> Result<LaunchGuard<'_>> {
        let mut state = self.lock();

        let busy_device = self.job.with(|job| {
            job.as_ref()
                .filter(|j| j.is_busy())
                .map(|j| j.device_path.clone())
        });
        let blocked_by = busy_device.or_else(|| {
            state
                .launch
                .as_ref()
                .map(|pending| pending.device_path.clone())
        });

        if let Some(device) = blocked_by {
            warn!(kind = %kind, requested = %device_path, busy = %device, "Refusing to start operation while another is active");
            self.push_log(format!(
                "Cannot start {kind} on {device_path}: {device} has an active operation"
            ));
            return Err(OrchestratorError::DeviceBusy { device });
        }

        state.launches += 1;
        let ticket = state.launches;
        state.launch = Some(PendingLaunch {
            ticket,
            kind,
            device_path: device_path.to_string(),
            early: VecDeque::new(),
        });
        self.log.set(Vec::new());
        Ok(LaunchGuard {
            tracker: self,
            ticket,
        })
    }

    fn abandon_launch(&self, ticket: u64) {
        let mut state = self.lock();
        if state.launch.as_ref().is_none_or(|pending| pending.ticket != ticket) {
            return;
        }
        if let Some(pending) = state.launch.take() {
            warn!(
                kind = %pending.kind,
                device = %pending.device_path,
                held = pending.early.len(),
                "Start abandoned before the backend answered"
            );
            self.push_log(format!(
                "Start of {} on {} was abandoned before the backend answered",
                pending.kind, pending.device_path
            ));
        }
    }

    /// The backend accepted the start command: `job` becomes current,
    /// superseding whatever was tracked before. Events that raced ahead of
    /// the command's response are replayed.
    pub fn launch_succeeded(&self, job: Job) -> Launched {
        let mut state = self.lock();
        let early = match state.launch.take() {
            Some(pending) => {
                debug_assert_eq!(pending.kind, job.kind);
                pending.early
            }
            None => VecDeque::new(),
        };
        state.last_log_seq = None;

        let id = job.id.clone();
        info!(job_id = %id, kind = %job.kind, device = %job.device_path, "Tracking new job");
        self.job.set(Some(job));

        let mut launched = Launched {
            applied: Applied::Updated,
            replayed: Vec::new(),
        };
        for event in early {
            if event.job_id().is_some_and(|target| target != id) {
                debug!(job_id = %id, event_job = ?event.job_id(), "Dropping held event for another job");
                continue;
            }
            match self.apply_locked(&mut state, &event) {
                Applied::Ignored => {}
                applied => {
                    if applied == Applied::Finished {
                        launched.applied = Applied::Finished;
                    }
                    launched.replayed.push(event);
                }
            }
        }
        launched
    }

    /// The start command itself failed. `job` must already be terminal.
    pub fn launch_failed(&self, job: Job) {
        let mut state = self.lock();
        state.launch = None;
        state.last_log_seq = None;

        let line = terminal_log_line(&job);
        self.job.set(Some(job));
        if let Some(line) = line {
            self.push_log(line);
        }
    }

    /// Apply one push event to the current job.
    pub fn apply(&self, event: &BackendEvent) -> Applied {
        let mut state = self.lock();

        if let Some(pending) = state.launch.as_mut() {
            let current = self.job.with(|job| job.as_ref().map(|j| j.id.clone()));
            let for_superseded = event.job_id().is_some() && event.job_id() == current.as_deref();
            if for_superseded {
                debug!(topic = %event.topic(), "Discarding event for superseded job");
            } else if pending.early.len() < MAX_EARLY_EVENTS {
                pending.early.push_back(event.clone());
            } else {
                warn!(topic = %event.topic(), "Too many events before launch resolved, dropping");
            }
            return Applied::Ignored;
        }

        self.apply_locked(&mut state, event)
    }

    fn apply_locked(&self, state: &mut TrackerState, event: &BackendEvent) -> Applied {
        if let BackendEvent::JobLogLine(payload) = event {
            let matches = self.job.with(|job| match job {
                Some(j) => payload.job_id.as_ref().is_none_or(|id| *id == j.id),
                None => false,
            });
            if !matches {
                return Applied::Ignored;
            }
            if let Some(seq) = payload.seq {
                if state.last_log_seq.is_some_and(|last| seq <= last) {
                    return Applied::Ignored;
                }
                state.last_log_seq = Some(seq);
            }
            self.push_log(payload.line.clone());
            return Applied::Updated;
        }

        let mut applied = Applied::Ignored;
        let mut finished_line = None;
        self.job.update(|slot| {
            let Some(job) = slot.as_mut() else {
                return false;
            };
            if event.job_id().is_some_and(|id| id != job.id) {
                return false;
            }

            applied = match event {
                BackendEvent::JobProgress(p) => job.apply_progress(p.progress.clone()),
                BackendEvent::JobStateChanged(p) => job.apply_state(p.state),
                BackendEvent::JobComplete(p) => job.complete(p.result.clone()),
                BackendEvent::JobError(p) => job.fail(p.error.clone()),
                _ => Applied::Ignored,
            };
            if applied == Applied::Finished {
                finished_line = terminal_log_line(job);
                info!(job_id = %job.id, state = %job.state, "Job finished");
            }
            applied != Applied::Ignored
        });

        if applied == Applied::Ignored && self.job.with(Option::is_none) {
            debug!(topic = %event.topic(), "No current job, event discarded");
        }
        if let Some(line) = finished_line {
            self.push_log(line);
        }
        applied
    }

    pub fn mark_cancel_requested(&self, id: &str) {
        let _state = self.lock();
        self.job.update(|slot| match slot {
            Some(job) if job.id == id && job.is_busy() && !job.cancel_requested => {
                job.cancel_requested = true;
                true
            }
            _ => false,
        });
    }

    /// Apply a pulled job record, but only if `id` is still the current job.
    pub fn reconcile(&self, id: &str, pulled: Job) -> Applied {
        let _state = self.lock();
        let mut applied = Applied::Ignored;
        let mut finished_line = None;

        self.job.update(|slot| match slot {
            Some(job) if job.id == id => {
                applied = job.reconcile(pulled);
                if applied == Applied::Finished {
                    finished_line = terminal_log_line(job);
                }
                applied != Applied::Ignored
            }
            _ => false,
        });

        if let Some(line) = finished_line {
            self.push_log(line);
        }
        applied
    }

    /// The backend no longer knows job `id`. If it is still current and
    /// stuck in an active state, drop the local projection.
    pub fn drop_stale(&self, id: &str) -> bool {
        let mut state = self.lock();
        let stale = self
            .job
            .with(|job| job.as_ref().is_some_and(|j| j.id == id && j.is_busy()));
        if stale {
            warn!(job_id = %id, "Backend lost track of active job, resetting");
            state.last_log_seq = None;
            self.job.set(None);
            self.log.set(Vec::new());
        }
        stale
    }

    /// Explicit UI reset: forget the current job, its log and any pending
    /// launch.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.last_log_seq = None;
        state.launch = None;
        self.job.set(None);
        self.log.set(Vec::new());
    }
}

fn terminal_log_line(job: &Job) -> Option<String> {
    let message = job.result.as_ref().and_then(|r| r.message.clone());
    match job.state {
        JobState::Error => Some(format!(
            "ERROR: {}",
            message.unwrap_or_else(|| "operation failed".to_string())
        )),
        JobState::Cancelled => Some(format!("{} cancelled.", capitalize(job.kind.as_str()))),
        _ => None,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{JobProgress, JobResult};

    fn burning(job_id: &str, percent: f64) -> BackendEvent {
        BackendEvent::progress(
            job_id,
            JobProgress {
                phase: "burning".into(),
                percent,
                ..Default::default()
            },
        )
    }

    fn tracking(id: &str) -> JobTracker {
        let tracker = JobTracker::new();
        let launch = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();
        tracker.launch_succeeded(Job::new(id, JobKind::Burn, "/dev/sr0"));
        drop(launch);
        tracker
    }

    #[test]
    fn events_without_a_job_are_discarded() {
        let tracker = JobTracker::new();
        assert_eq!(tracker.apply(&burning("job-1", 5.0)), Applied::Ignored);
        assert_eq!(
            tracker.apply(&BackendEvent::log_line("job-1", "hello", None)),
            Applied::Ignored
        );
        assert!(tracker.job().is_none());
        assert!(tracker.log_lines().is_empty());
    }

    #[test]
    fn error_appends_one_log_line() {
        let tracker = tracking("job-1");
        let error = BackendEvent::error("job-1", "write failed");

        assert_eq!(tracker.apply(&error), Applied::Finished);
        let finished = tracker.job().unwrap().finished_at;
        assert_eq!(tracker.apply(&error), Applied::Ignored);

        let errors: Vec<_> = tracker
            .log_lines()
            .into_iter()
            .filter(|l| l.text.starts_with("ERROR:"))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].text, "ERROR: write failed");
        assert_eq!(tracker.job().unwrap().finished_at, finished);
    }

    #[test]
    fn redelivered_log_lines_are_dropped_by_sequence() {
        let tracker = tracking("job-1");
        let line = BackendEvent::log_line("job-1", "Drive current: -dev '/dev/sr0'", Some(1));

        tracker.apply(&line);
        tracker.apply(&line);
        tracker.apply(&BackendEvent::log_line("job-1", "next", Some(2)));

        let texts: Vec<String> = tracker.log_lines().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["Drive current: -dev '/dev/sr0'", "next"]);
    }

    #[test]
    fn events_for_other_jobs_are_ignored() {
        let tracker = tracking("job-2");
        assert_eq!(tracker.apply(&burning("job-1", 80.0)), Applied::Ignored);
        assert_eq!(tracker.job().unwrap().progress.percent, 0.0);
    }

    #[test]
    fn events_without_id_apply_to_current_job() {
        let tracker = tracking("blank-1");
        let event = BackendEvent::JobComplete(crate::core::events::CompletePayload {
            job_id: None,
            result: JobResult::succeeded("blanked"),
        });
        assert_eq!(tracker.apply(&event), Applied::Finished);
        assert_eq!(tracker.job().unwrap().state, JobState::Complete);
    }

    #[test]
    fn second_launch_is_refused_while_busy() {
        let tracker = tracking("job-1");
        let err = tracker.reserve_launch(JobKind::Blank, "/dev/sr1").unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::DeviceBusy {
                device: "/dev/sr0".into()
            }
        );
        // The active job is untouched.
        assert_eq!(tracker.current_id().as_deref(), Some("job-1"));
        assert!(tracker.is_busy());
    }

    #[test]
    fn pending_launch_blocks_a_concurrent_start() {
        let tracker = JobTracker::new();
        let _launch = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();
        assert!(tracker.reserve_launch(JobKind::Format, "/dev/sr1").is_err());
    }

    #[test]
    fn dropped_launch_releases_the_reservation() {
        let tracker = JobTracker::new();
        let launch = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();
        tracker.apply(&burning("job-1", 10.0));
        drop(launch);

        assert!(tracker.job().is_none());
        assert_eq!(
            tracker.log_lines().last().map(|l| l.text.as_str()),
            Some("Start of burn on /dev/sr0 was abandoned before the backend answered")
        );
        // Another start may go ahead.
        let _next = tracker.reserve_launch(JobKind::Blank, "/dev/sr1").unwrap();
    }

    #[test]
    fn resolved_launch_survives_its_guard() {
        let tracker = JobTracker::new();
        let launch = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();
        tracker.launch_succeeded(Job::new("job-1", JobKind::Burn, "/dev/sr0"));
        drop(launch);

        assert_eq!(tracker.current_id().as_deref(), Some("job-1"));
        assert!(tracker.log_lines().is_empty());
        assert_eq!(tracker.apply(&burning("job-1", 20.0)), Applied::Updated);
    }

    #[test]
    fn reset_clears_a_pending_launch() {
        let tracker = JobTracker::new();
        let _stuck = tracker.reserve_launch(JobKind::Format, "/dev/sr0").unwrap();
        tracker.reset();
        let _next = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();
    }

    #[test]
    fn events_racing_the_start_response_are_replayed() {
        let tracker = JobTracker::new();
        let _launch = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();

        tracker.apply(&burning("job-1", 12.0));
        tracker.apply(&BackendEvent::log_line("job-1", "early line", Some(1)));
        tracker.apply(&burning("job-0", 99.0));

        let launched = tracker.launch_succeeded(Job::new("job-1", JobKind::Burn, "/dev/sr0"));
        assert_eq!(launched.replayed.len(), 2);

        let job = tracker.job().unwrap();
        assert_eq!(job.state, JobState::Burning);
        assert_eq!(job.progress.percent, 12.0);
        assert_eq!(tracker.log_lines().len(), 1);
    }

    #[test]
    fn immediate_failure_is_not_lost_during_launch() {
        let tracker = JobTracker::new();
        let _launch = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();
        tracker.apply(&BackendEvent::error("job-1", "no writable medium"));

        let launched = tracker.launch_succeeded(Job::new("job-1", JobKind::Burn, "/dev/sr0"));
        assert_eq!(launched.applied, Applied::Finished);
        assert_eq!(tracker.job().unwrap().state, JobState::Error);
    }

    #[test]
    fn new_launch_clears_the_log() {
        let tracker = tracking("job-1");
        tracker.append_log("old line");
        tracker.apply(&BackendEvent::complete("job-1", JobResult::succeeded("ok")));

        let _launch = tracker.reserve_launch(JobKind::Blank, "/dev/sr0").unwrap();
        assert!(tracker.log_lines().is_empty());
    }

    #[test]
    fn reconcile_only_applies_to_the_targeted_job() {
        let tracker = tracking("job-1");
        let pulled_old = Job::new("job-1", JobKind::Burn, "/dev/sr0");

        tracker.apply(&BackendEvent::complete("job-1", JobResult::succeeded("ok")));
        let _launch = tracker.reserve_launch(JobKind::Burn, "/dev/sr0").unwrap();
        tracker.launch_succeeded(Job::new("job-2", JobKind::Burn, "/dev/sr0"));
        tracker.apply(&burning("job-2", 30.0));

        assert_eq!(tracker.reconcile("job-1", pulled_old), Applied::Ignored);
        let job = tracker.job().unwrap();
        assert_eq!(job.id, "job-2");
        assert_eq!(job.progress.percent, 30.0);
    }

    #[test]
    fn drop_stale_only_resets_active_jobs() {
        let tracker = tracking("job-1");
        assert!(!tracker.drop_stale("job-9"));
        assert!(tracker.drop_stale("job-1"));
        assert!(tracker.job().is_none());

        let finished = tracking("job-2");
        finished.apply(&BackendEvent::complete("job-2", JobResult::succeeded("ok")));
        assert!(!finished.drop_stale("job-2"));
        assert!(finished.job().is_some());
    }

    #[test]
    fn cancelled_state_logs_once() {
        let tracker = tracking("job-1");
        tracker.mark_cancel_requested("job-1");
        assert!(tracker.job().unwrap().cancel_requested);
        assert_eq!(tracker.job().unwrap().state, JobState::Preparing);

        let cancelled = BackendEvent::state_changed("job-1", JobState::Cancelled);
        assert_eq!(tracker.apply(&cancelled), Applied::Finished);
        assert_eq!(tracker.apply(&cancelled), Applied::Ignored);
        let lines: Vec<String> = tracker.log_lines().into_iter().map(|l| l.text).collect();
        assert_eq!(lines, vec!["Burn cancelled."]);
    }
}
