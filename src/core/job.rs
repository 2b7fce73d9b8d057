//! The job state machine.
//!
//! A [`Job`] is push-driven: it only moves when an authoritative event is
//! applied to it. Terminal states (`complete`, `error`, `cancelled`) are
//! sticky; `finished_at` is written exactly once, on the transition into one
//! of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{JobId, JobKind, JobProgress, JobResult, JobState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub device_path: String,
    pub state: JobState,
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// A cancel command was accepted and the terminal event is pending.
    #[serde(default)]
    pub cancel_requested: bool,
    /// The id was synthesized locally; the backend cannot be asked about it.
    #[serde(default)]
    pub local_id: bool,
}

/// What applying an event did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Nothing changed (terminal job, stale or foreign event).
    Ignored,
    /// The job changed but is still active.
    Updated,
    /// The job just entered a terminal state.
    Finished,
}

impl Job {
    pub fn new(id: impl Into<JobId>, kind: JobKind, device_path: impl Into<String>) -> Self {
        let state = kind.initial_state();
        Self {
            id: id.into(),
            kind,
            device_path: device_path.into(),
            state,
            progress: JobProgress::starting(state),
            result: None,
            started_at: Utc::now(),
            finished_at: None,
            cancel_requested: false,
            local_id: false,
        }
    }

    /// Local id for producers that do not hand one back, e.g. `blank-1760612400123`.
    pub fn synthesize_id(kind: JobKind) -> JobId {
        format!("{}-{}", kind.as_str(), Utc::now().timestamp_millis())
    }

    /// A job whose initiating command failed: it goes straight to `error`
    /// because no backend-side job exists to report otherwise.
    pub fn failed_to_start(
        id: impl Into<JobId>,
        kind: JobKind,
        device_path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut job = Self::new(id, kind, device_path);
        job.fail(message);
        job
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn apply_progress(&mut self, progress: JobProgress) -> Applied {
        if self.is_terminal() {
            return Applied::Ignored;
        }

        let mut progress = progress.normalized();
        match JobState::from_phase(&progress.phase) {
            Some(state) => self.state = state,
            None if progress.phase.is_empty() => progress.phase = self.state.as_str().to_string(),
            None => {}
        }

        if self.progress == progress {
            return Applied::Ignored;
        }
        self.progress = progress;
        Applied::Updated
    }

    /// Authoritative state override. A terminal target state finishes the job.
    pub fn apply_state(&mut self, state: JobState) -> Applied {
        if self.is_terminal() {
            return Applied::Ignored;
        }

        match state {
            JobState::Complete => self.complete(JobResult::succeeded("Done")),
            JobState::Error => self.fail("operation failed"),
            JobState::Cancelled => self.finish(JobState::Cancelled, JobResult::cancelled()),
            active if active == self.state => Applied::Ignored,
            active => {
                self.state = active;
                self.progress.phase = active.as_str().to_string();
                Applied::Updated
            }
        }
    }

    pub fn complete(&mut self, result: JobResult) -> Applied {
        if self.is_terminal() {
            return Applied::Ignored;
        }
        self.progress.percent = 100.0;
        self.finish(JobState::Complete, result)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Applied {
        if self.is_terminal() {
            return Applied::Ignored;
        }
        self.finish(JobState::Error, JobResult::failed(message))
    }

    fn finish(&mut self, state: JobState, result: JobResult) -> Applied {
        self.state = state;
        self.progress.phase = state.as_str().to_string();
        self.result = Some(result);
        self.finished_at.get_or_insert_with(Utc::now);
        Applied::Finished
    }

    /// Replace this record with a pulled copy of the same job.
    ///
    /// Foreign ids are ignored, a terminal record never regresses to an active
    /// one, and an already-set `finished_at` is kept.
    pub fn reconcile(&mut self, pulled: Job) -> Applied {
        if pulled.id != self.id {
            return Applied::Ignored;
        }
        if self.is_terminal() && pulled.is_busy() {
            return Applied::Ignored;
        }

        let was_busy = self.is_busy();
        let mut pulled = pulled;
        pulled.progress = pulled.progress.normalized();
        pulled.cancel_requested |= self.cancel_requested;
        pulled.local_id = self.local_id;
        pulled.finished_at = match (self.finished_at, pulled.finished_at) {
            (Some(local), _) => Some(local),
            (None, Some(remote)) => Some(remote),
            (None, None) if pulled.is_terminal() => Some(Utc::now()),
            (None, None) => None,
        };

        if *self == pulled {
            return Applied::Ignored;
        }
        *self = pulled;

        if was_busy && self.is_terminal() {
            Applied::Finished
        } else {
            Applied::Updated
        }
    }
}
