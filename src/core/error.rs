use thiserror::Error;

/// Failures reported across the backend boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The drive subsystem or service could not be reached.
    #[error("backend unreachable: {0}")]
    Unavailable(String),

    /// The backend refused the request.
    #[error("{0}")]
    Rejected(String),

    /// The backend does not know the given job id.
    #[error("job not found: {0}")]
    JobNotFound(String),
}

/// The orchestrator's error taxonomy, as seen by the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("device busy: {device} has an active operation")]
    DeviceBusy { device: String },

    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl OrchestratorError {
    /// Normalize a failure of a state-changing command. An unreachable
    /// backend still means the command did not go through.
    pub fn from_command(err: BackendError) -> Self {
        match err {
            BackendError::JobNotFound(id) => Self::JobNotFound(id),
            BackendError::Unavailable(msg) | BackendError::Rejected(msg) => {
                Self::CommandRejected(msg)
            }
        }
    }

    /// Normalize a failure of a read-only query.
    pub fn from_query(err: BackendError) -> Self {
        match err {
            BackendError::JobNotFound(id) => Self::JobNotFound(id),
            BackendError::Unavailable(msg) | BackendError::Rejected(msg) => {
                Self::BackendUnavailable(msg)
            }
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
