//! Device registry: known drives, the selected drive, and what is loaded in it.
//!
//! Media and speed fetches are tagged with the selection they were issued
//! for. A result that lands after the selection moved on is discarded, so
//! the projection never shows one drive's disc under another drive's name.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backend::DiscBackend;
use super::error::{OrchestratorError, Result};
use super::models::{Device, MediaInfo, SpeedOption, order_speeds};
use super::observe::Observable;

pub struct DeviceRegistry {
    backend: Arc<dyn DiscBackend>,
    selection: Mutex<Selection>,
    devices: Observable<Vec<Device>>,
    current: Observable<Option<String>>,
    media: Observable<Option<MediaInfo>>,
    speeds: Observable<Vec<SpeedOption>>,
    loading: Observable<bool>,
}

#[derive(Default)]
struct Selection {
    path: Option<String>,
    generation: u64,
}

/// Identifies the selection a fetch was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    path: String,
    generation: u64,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn DiscBackend>) -> Self {
        Self {
            backend,
            selection: Mutex::new(Selection::default()),
            devices: Observable::new(Vec::new()),
            current: Observable::new(None),
            media: Observable::new(None),
            speeds: Observable::new(Vec::new()),
            loading: Observable::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.get()
    }

    pub fn current_device(&self) -> Option<String> {
        self.current.get()
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.media.get()
    }

    pub fn speeds(&self) -> Vec<SpeedOption> {
        self.speeds.get()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.get()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.devices.subscribe()
    }

    pub fn subscribe_current(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    pub fn subscribe_media(&self) -> watch::Receiver<Option<MediaInfo>> {
        self.media.subscribe()
    }

    pub fn subscribe_speeds(&self) -> watch::Receiver<Vec<SpeedOption>> {
        self.speeds.subscribe()
    }

    pub fn is_selected(&self, device_path: &str) -> bool {
        self.lock().path.as_deref() == Some(device_path)
    }

    fn ticket(&self) -> Option<Ticket> {
        let selection = self.lock();
        selection.path.clone().map(|path| Ticket {
            path,
            generation: selection.generation,
        })
    }

    /// Run `write` only if `ticket` still describes the selection. The
    /// selection lock is held across the write so a concurrent switch cannot
    /// slip in between the check and the update.
    fn commit(&self, ticket: &Ticket, write: impl FnOnce()) -> bool {
        let selection = self.lock();
        let current = selection.generation == ticket.generation
            && selection.path.as_deref() == Some(ticket.path.as_str());
        if current {
            write();
        } else {
            debug!(device = %ticket.path, "Discarding result for a previous selection");
        }
        current
    }

    /// Re-enumerate drives and replace the whole list.
    ///
    /// On failure the previous list is kept.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        self.loading.set(true);
        let result = self.backend.list_devices().await;
        self.loading.set(false);

        match result {
            Ok(devices) => {
                if self.apply_device_list(devices.clone()).is_some() {
                    self.refresh().await;
                }
                Ok(devices)
            }
            Err(err) => {
                warn!(error = %err, "Device enumeration failed");
                Err(OrchestratorError::BackendUnavailable(err.to_string()))
            }
        }
    }

    /// Replace the device list. If nothing is selected yet the first drive
    /// becomes the selection; its path is returned and the caller is
    /// expected to [`refresh`](Self::refresh).
    pub fn apply_device_list(&self, devices: Vec<Device>) -> Option<String> {
        info!(count = devices.len(), "Device list updated");
        let first = devices.first().map(|d| d.path.clone());
        self.devices.set(devices);

        let mut selection = self.lock();
        if selection.path.is_some() {
            return None;
        }
        let path = first?;
        info!(device = %path, "Auto-selecting first drive");
        self.switch_locked(&mut selection, path.clone());
        Some(path)
    }

    /// Switch the active drive and re-fetch its media and speeds.
    ///
    /// `device_path` does not have to be in the current list.
    pub async fn select_device(&self, device_path: &str) {
        {
            let mut selection = self.lock();
            self.switch_locked(&mut selection, device_path.to_string());
        }
        info!(device = %device_path, "Selected drive");
        self.refresh().await;
    }

    fn switch_locked(&self, selection: &mut Selection, path: String) {
        selection.generation += 1;
        selection.path = Some(path.clone());
        self.current.set(Some(path));
        self.media.set(None);
        self.speeds.set(Vec::new());
    }

    /// Fetch media info and speeds for the selected drive.
    pub async fn refresh(&self) {
        tokio::join!(self.fetch_media_info(), self.fetch_speeds());
    }

    /// Fetch media info for the selected drive. Returns what is current
    /// afterwards. Failures leave the media absent.
    pub async fn fetch_media_info(&self) -> Option<MediaInfo> {
        let ticket = self.ticket()?;
        let media = match self.backend.get_media_info(&ticket.path).await {
            Ok(media) => Some(media.normalized()),
            Err(err) => {
                warn!(device = %ticket.path, error = %err, "Media info fetch failed");
                None
            }
        };

        self.commit(&ticket, || self.media.set(media));
        self.media.get()
    }

    /// Fetch the selectable write speeds for the selected drive, `auto` first.
    /// Failures leave the list empty.
    pub async fn fetch_speeds(&self) -> Vec<SpeedOption> {
        let Some(ticket) = self.ticket() else {
            return Vec::new();
        };
        let speeds = match self.backend.get_speeds(&ticket.path).await {
            Ok(speeds) => order_speeds(speeds),
            Err(err) => {
                warn!(device = %ticket.path, error = %err, "Speed list fetch failed");
                Vec::new()
            }
        };

        self.commit(&ticket, || self.speeds.set(speeds));
        self.speeds.get()
    }

    /// Eject the disc in `device_path`. The caller checks that no job is
    /// running on the drive.
    pub async fn eject(&self, device_path: &str) -> Result<()> {
        self.backend
            .eject_disc(device_path)
            .await
            .map_err(OrchestratorError::from_command)?;

        info!(device = %device_path, "Disc ejected");
        let selection = self.lock();
        if selection.path.as_deref() == Some(device_path) {
            self.media.set(None);
        }
        Ok(())
    }
}
