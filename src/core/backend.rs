//! The boundary to whatever actually drives the burner.
//!
//! Request/response calls resolve once the backend accepted or refused the
//! command; the effect of an operation is reported later on the push channel
//! returned by [`DiscBackend::subscribe`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::BackendError;
use super::events::BackendEvent;
use super::job::Job;
use super::models::{BlankMode, Device, FormatMode, JobId, MediaInfo, SpeedOption};
use super::project::{BurnOptions, Project};

/// Capacity of a backend's push channel. Receivers that fall further behind
/// observe a lag and reconcile by polling.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait DiscBackend: Send + Sync {
    async fn start_burn(
        &self,
        project: &Project,
        device_path: &str,
        options: &BurnOptions,
    ) -> Result<JobId, BackendError>;

    async fn cancel_burn(&self, job_id: &str) -> Result<(), BackendError>;

    /// `None` means the backend did not assign an id.
    async fn blank_disc(
        &self,
        device_path: &str,
        mode: BlankMode,
    ) -> Result<Option<JobId>, BackendError>;

    /// `None` means the backend did not assign an id.
    async fn format_disc(
        &self,
        device_path: &str,
        mode: FormatMode,
    ) -> Result<Option<JobId>, BackendError>;

    async fn get_job_status(&self, job_id: &str) -> Result<Option<Job>, BackendError>;

    async fn list_devices(&self) -> Result<Vec<Device>, BackendError>;

    async fn get_media_info(&self, device_path: &str) -> Result<MediaInfo, BackendError>;

    async fn get_speeds(&self, device_path: &str) -> Result<Vec<SpeedOption>, BackendError>;

    async fn eject_disc(&self, device_path: &str) -> Result<(), BackendError>;

    /// Join the push channel. Each receiver sees events sent after it joined.
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;

    /// Start watching for drives appearing and disappearing.
    fn start_monitor(&self, _interval: Duration) {}

    /// Stop background work. Running operations are cancelled.
    fn stop(&self) {}

    fn name(&self) -> &'static str;
}
