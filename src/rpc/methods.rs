//! Method table of the RPC surface.

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::error::OrchestratorError;
use crate::core::job::Job;
use crate::core::models::{BlankMode, Device, FormatMode, MediaInfo, SpeedOption};
use crate::core::orchestrator::Orchestrator;
use crate::core::project::{BurnOptions, Project};

use super::protocol::{Request, Response};

pub struct MethodHandler {
    orchestrator: Arc<Orchestrator>,
    start_time: Instant,
}

enum MethodError {
    Params(String),
    Internal(String),
    Failed(OrchestratorError),
}

impl From<OrchestratorError> for MethodError {
    fn from(err: OrchestratorError) -> Self {
        MethodError::Failed(err)
    }
}

type MethodResult = Result<Value, MethodError>;

fn reply(result: impl Serialize) -> MethodResult {
    serde_json::to_value(result).map_err(|e| MethodError::Internal(e.to_string()))
}

/// Missing params read as an empty object so optional fields default.
fn params<T: DeserializeOwned>(params: Value) -> Result<T, MethodError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| MethodError::Params(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub version: String,
    pub backend: String,
    pub uptime_secs: u64,
    pub simulation: bool,
    pub device_count: usize,
    pub current_device: Option<String>,
    pub busy: bool,
    pub current_job: Option<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaReply {
    pub device: Option<String>,
    pub media: Option<MediaInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub device: Option<String>,
    pub media: Option<MediaInfo>,
    pub speeds: Vec<SpeedOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub job_id: String,
}

#[derive(Default, Deserialize)]
struct DeviceParams {
    #[serde(default)]
    device: Option<String>,
}

impl MethodHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);
        debug!(method = %request.method, "RPC call");

        let result = match request.method.as_str() {
            "daemon.status" => self.daemon_status(),
            "devices.list" => reply(self.orchestrator.registry().devices()),
            "devices.refresh" => self.devices_refresh().await,
            "devices.select" => self.devices_select(params).await,
            "media.get" => self.media(false).await,
            "media.refresh" => self.media(true).await,
            "speeds.get" => reply(self.orchestrator.registry().speeds()),
            "disc.eject" => self.disc_eject(params).await,
            "disc.blank" => self.disc_blank(params).await,
            "disc.format" => self.disc_format(params).await,
            "burn.start" => self.burn_start(params).await,
            "burn.cancel" => self.burn_cancel().await,
            "job.current" => reply(self.orchestrator.current_job()),
            "job.refresh" => self.job_refresh().await,
            "job.reset" => self.job_reset(),
            "log.lines" => reply(self.orchestrator.log_lines()),
            _ => return Response::method_not_found(id, &request.method),
        };

        match result {
            Ok(value) => Response::success(id, value),
            Err(MethodError::Params(details)) => Response::invalid_params(id, details),
            Err(MethodError::Internal(details)) => Response::internal_error(id, details),
            Err(MethodError::Failed(err)) => {
                debug!(method = %request.method, error = %err, "RPC call failed");
                Response::failure(id, &err)
            }
        }
    }

    /// The drive a command targets: the one named, else the selected one.
    fn target(&self, device: Option<String>) -> Result<String, MethodError> {
        device
            .or_else(|| self.orchestrator.registry().current_device())
            .ok_or_else(|| MethodError::Params("no drive given and none selected".into()))
    }

    fn daemon_status(&self) -> MethodResult {
        let orchestrator = &self.orchestrator;
        let ctx = orchestrator.context();
        reply(DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: ctx.backend.name().to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            simulation: ctx.config.simulation,
            device_count: orchestrator.registry().devices().len(),
            current_device: orchestrator.registry().current_device(),
            busy: orchestrator.tracker().is_busy(),
            current_job: orchestrator.current_job(),
        })
    }

    async fn devices_refresh(&self) -> MethodResult {
        let devices: Vec<Device> = self.orchestrator.registry().list_devices().await?;
        reply(devices)
    }

    async fn devices_select(&self, raw: Value) -> MethodResult {
        #[derive(Deserialize)]
        struct Params {
            path: String,
        }
        let Params { path } = params(raw)?;

        let registry = self.orchestrator.registry();
        registry.select_device(&path).await;
        reply(Selection {
            device: registry.current_device(),
            media: registry.media_info(),
            speeds: registry.speeds(),
        })
    }

    async fn media(&self, refresh: bool) -> MethodResult {
        let registry = self.orchestrator.registry();
        let media = if refresh {
            registry.fetch_media_info().await
        } else {
            registry.media_info()
        };
        reply(MediaReply {
            device: registry.current_device(),
            media,
        })
    }

    async fn disc_eject(&self, raw: Value) -> MethodResult {
        let DeviceParams { device } = params(raw)?;
        let device = self.target(device)?;
        self.orchestrator.dispatcher().eject_disc(&device).await?;
        reply(Value::Null)
    }

    async fn disc_blank(&self, raw: Value) -> MethodResult {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            device: Option<String>,
            #[serde(default)]
            mode: Option<BlankMode>,
        }
        let Params { device, mode } = params(raw)?;
        let device = self.target(device)?;
        let mode = mode.unwrap_or(self.orchestrator.context().config.default_blank_mode);

        let job_id = self.orchestrator.dispatcher().blank_disc(&device, mode).await?;
        reply(JobStarted { job_id })
    }

    async fn disc_format(&self, raw: Value) -> MethodResult {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            device: Option<String>,
            #[serde(default)]
            mode: Option<FormatMode>,
        }
        let Params { device, mode } = params(raw)?;
        let device = self.target(device)?;
        let mode = mode.unwrap_or(self.orchestrator.context().config.default_format_mode);

        let job_id = self.orchestrator.dispatcher().format_disc(&device, mode).await?;
        reply(JobStarted { job_id })
    }

    /// Without explicit `options` the project's own burn options apply.
    async fn burn_start(&self, raw: Value) -> MethodResult {
        #[derive(Deserialize)]
        struct Params {
            project: Project,
            #[serde(default)]
            device: Option<String>,
            #[serde(default)]
            options: Option<BurnOptions>,
        }
        let Params {
            project,
            device,
            options,
        } = params(raw)?;
        let device = self.target(device)?;
        let options = options.unwrap_or_else(|| project.burn_options.clone());

        let job_id = self
            .orchestrator
            .dispatcher()
            .start_burn(&project, &device, &options)
            .await?;
        reply(JobStarted { job_id })
    }

    async fn burn_cancel(&self) -> MethodResult {
        self.orchestrator.dispatcher().cancel_burn().await?;
        reply(self.orchestrator.current_job())
    }

    async fn job_refresh(&self) -> MethodResult {
        self.orchestrator.fetch_job_status().await?;
        reply(self.orchestrator.current_job())
    }

    /// Clearing a running job would orphan its events, so it is refused.
    fn job_reset(&self) -> MethodResult {
        if let Some(job) = self.orchestrator.current_job().filter(Job::is_busy) {
            return Err(OrchestratorError::DeviceBusy {
                device: job.device_path,
            }
            .into());
        }
        self.orchestrator.reset_job();
        reply(Value::Null)
    }
}
