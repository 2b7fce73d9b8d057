pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod models;
pub mod observe;
pub mod orchestrator;
pub mod project;
pub mod registry;
pub mod sync;
pub mod tracker;

pub use backend::DiscBackend;
pub use dispatcher::CommandDispatcher;
pub use error::{BackendError, OrchestratorError};
pub use events::{BackendEvent, Topic};
pub use job::{Applied, Job};
pub use models::{
    BlankMode, Device, FormatMode, JobId, JobKind, JobProgress, JobResult, JobState, LogLine,
    MediaInfo, SpeedOption,
};
pub use observe::Observable;
pub use orchestrator::Orchestrator;
pub use project::{BurnOptions, FileEntry, IsoOptions, Project};
pub use registry::DeviceRegistry;
pub use sync::{EventSync, SubscriptionManager};
pub use tracker::JobTracker;
