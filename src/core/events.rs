//! Push events delivered by the backend.
//!
//! On the wire each event is `{"topic": "job:progress", "payload": {...}}`.
//! Job payloads carry an optional `jobId`; producers that predate job ids
//! leave it out and the event applies to whatever job is current.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::Job;
use super::models::{Device, JobId, JobProgress, JobResult, JobState};

/// Topic names of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    JobProgress,
    JobStateChanged,
    JobLogLine,
    JobComplete,
    JobError,
    DeviceListUpdated,
    DeviceMediaChanged,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::JobProgress,
        Topic::JobStateChanged,
        Topic::JobLogLine,
        Topic::JobComplete,
        Topic::JobError,
        Topic::DeviceListUpdated,
        Topic::DeviceMediaChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobProgress => "job:progress",
            Self::JobStateChanged => "job:state-changed",
            Self::JobLogLine => "job:log-line",
            Self::JobComplete => "job:complete",
            Self::JobError => "job:error",
            Self::DeviceListUpdated => "device:list-updated",
            Self::DeviceMediaChanged => "device:media-changed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(flatten)]
    pub progress: JobProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLinePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub line: String,
    /// Per-job sequence number. Lines at or below the last applied number
    /// are redeliveries and get dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(flatten)]
    pub result: JobResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListPayload {
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChangedPayload {
    pub device_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum BackendEvent {
    #[serde(rename = "job:progress")]
    JobProgress(ProgressPayload),
    #[serde(rename = "job:state-changed")]
    JobStateChanged(StateChangedPayload),
    #[serde(rename = "job:log-line")]
    JobLogLine(LogLinePayload),
    #[serde(rename = "job:complete")]
    JobComplete(CompletePayload),
    #[serde(rename = "job:error")]
    JobError(ErrorPayload),
    #[serde(rename = "device:list-updated")]
    DeviceListUpdated(DeviceListPayload),
    #[serde(rename = "device:media-changed")]
    DeviceMediaChanged(MediaChangedPayload),
}

impl BackendEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::JobProgress(_) => Topic::JobProgress,
            Self::JobStateChanged(_) => Topic::JobStateChanged,
            Self::JobLogLine(_) => Topic::JobLogLine,
            Self::JobComplete(_) => Topic::JobComplete,
            Self::JobError(_) => Topic::JobError,
            Self::DeviceListUpdated(_) => Topic::DeviceListUpdated,
            Self::DeviceMediaChanged(_) => Topic::DeviceMediaChanged,
        }
    }

    pub fn is_job_event(&self) -> bool {
        !matches!(
            self,
            Self::DeviceListUpdated(_) | Self::DeviceMediaChanged(_)
        )
    }

    /// Job id the event targets, if it names one.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobProgress(p) => p.job_id.as_deref(),
            Self::JobStateChanged(p) => p.job_id.as_deref(),
            Self::JobLogLine(p) => p.job_id.as_deref(),
            Self::JobComplete(p) => p.job_id.as_deref(),
            Self::JobError(p) => p.job_id.as_deref(),
            Self::DeviceListUpdated(_) | Self::DeviceMediaChanged(_) => None,
        }
    }

    pub fn progress(job_id: impl Into<JobId>, progress: JobProgress) -> Self {
        Self::JobProgress(ProgressPayload {
            job_id: Some(job_id.into()),
            progress,
        })
    }

    pub fn state_changed(job_id: impl Into<JobId>, state: JobState) -> Self {
        Self::JobStateChanged(StateChangedPayload {
            job_id: Some(job_id.into()),
            state,
        })
    }

    pub fn log_line(job_id: impl Into<JobId>, line: impl Into<String>, seq: Option<u64>) -> Self {
        Self::JobLogLine(LogLinePayload {
            job_id: Some(job_id.into()),
            line: line.into(),
            seq,
        })
    }

    pub fn complete(job_id: impl Into<JobId>, result: JobResult) -> Self {
        Self::JobComplete(CompletePayload {
            job_id: Some(job_id.into()),
            result,
        })
    }

    pub fn error(job_id: impl Into<JobId>, error: impl Into<String>) -> Self {
        Self::JobError(ErrorPayload {
            job_id: Some(job_id.into()),
            error: error.into(),
        })
    }

    pub fn media_changed(device_path: impl Into<String>) -> Self {
        Self::DeviceMediaChanged(MediaChangedPayload {
            device_path: device_path.into(),
        })
    }

    /// The event a backend emits to announce a job's terminal state.
    pub fn terminal_for(job: &Job) -> Option<Self> {
        match job.state {
            JobState::Complete => Some(Self::complete(
                job.id.clone(),
                job.result
                    .clone()
                    .unwrap_or_else(|| JobResult::succeeded("Done")),
            )),
            JobState::Error => Some(Self::error(
                job.id.clone(),
                job.result
                    .as_ref()
                    .and_then(|r| r.message.clone())
                    .unwrap_or_else(|| "operation failed".to_string()),
            )),
            JobState::Cancelled => Some(Self::state_changed(job.id.clone(), JobState::Cancelled)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_event_wire_format() {
        let json = r#"{"topic":"job:progress","payload":{"jobId":"job-1","phase":"burning","percent":50,"bytesWritten":367001600,"bytesTotal":734003200}}"#;
        let event: BackendEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.topic(), Topic::JobProgress);
        assert_eq!(event.job_id(), Some("job-1"));
        match event {
            BackendEvent::JobProgress(p) => {
                assert_eq!(p.progress.phase, "burning");
                assert_eq!(p.progress.percent, 50.0);
                assert_eq!(p.progress.bytes_total, 734003200);
                assert!(p.progress.speed.is_empty());
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn complete_event_without_job_id() {
        let json = r#"{"topic":"job:complete","payload":{"success":true}}"#;
        let event: BackendEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.job_id(), None);
        match event {
            BackendEvent::JobComplete(p) => assert!(p.result.success),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn topic_names_match_the_channel() {
        let event = BackendEvent::media_changed("/dev/sr0");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""topic":"device:media-changed""#));
        assert!(json.contains(r#""devicePath":"/dev/sr0""#));

        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("burn:progress"), None);
    }
}
