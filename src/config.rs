//! Daemon configuration.
//!
//! Layers, lowest priority first: built-in defaults, the TOML file
//! (`$XBURN_CONFIG` or `/etc/xburn/config.toml`), `XBURN_` environment
//! variables (nested keys split on `__`), then command line overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::{BlankMode, FormatMode};
use crate::core::project::BurnOptions;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/xburn/config.toml";
pub const CONFIG_PATH_ENV: &str = "XBURN_CONFIG";
pub const DEFAULT_RPC_BIND: &str = "127.0.0.1:7460";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Invalid(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// The xorriso binary, looked up in `PATH` when relative.
    pub xorriso_path: PathBuf,
    pub rpc_bind: SocketAddr,
    /// Drive the in-memory backend instead of real drives.
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub device_poll_interval_secs: u64,
    /// Pull reconciliation period for the running job. Zero disables it.
    pub status_poll_interval_secs: u64,
    pub query_timeout_secs: u64,
    /// Limit for each xorriso pass of a burn, blank or format. Large BD
    /// burns at low speed take hours.
    pub operation_timeout_secs: u64,
    pub default_blank_mode: BlankMode,
    pub default_format_mode: FormatMode,
    pub default_burn: BurnOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            xorriso_path: PathBuf::from("xorriso"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7460)),
            simulation: false,
            verbose: false,
            json_logs: false,
            device_poll_interval_secs: 5,
            status_poll_interval_secs: 10,
            query_timeout_secs: 15,
            operation_timeout_secs: 4 * 60 * 60,
            default_blank_mode: BlankMode::default(),
            default_format_mode: FormatMode::default(),
            default_burn: BurnOptions::default(),
        }
    }
}

impl AppConfig {
    /// Load the layered configuration, with `overrides` (usually parsed
    /// command line flags) taking precedence over everything else.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path, overrides)
    }

    /// Like [`AppConfig::new`] with an explicit config file. A missing file
    /// is not an error.
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("XBURN_").split("__"));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device_poll_interval_secs == 0 {
            return Err(ConfigError::Zero {
                key: "device_poll_interval_secs",
            });
        }
        if self.query_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                key: "query_timeout_secs",
            });
        }
        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                key: "operation_timeout_secs",
            });
        }
        Ok(())
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[derive(Serialize)]
    struct Flags {
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rpc_bind: Option<String>,
    }

    fn file_with(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config =
            AppConfig::load(Path::new("/nonexistent/xburn.toml"), None::<&Flags>).unwrap();
        assert_eq!(config.rpc_bind.to_string(), DEFAULT_RPC_BIND);
        assert_eq!(config.device_poll_interval_secs, 5);
        assert!(config.default_burn.verify);
    }

    #[test]
    fn file_values_override_defaults() {
        let file = file_with(
            r#"
            xorriso_path = "/opt/xorriso/bin/xorriso"
            status_poll_interval_secs = 0
            default_blank_mode = "full"

            [default_burn]
            speed = "4"
            eject = false
            "#,
        );
        let config = AppConfig::load(file.path(), None::<&Flags>).unwrap();

        assert_eq!(config.xorriso_path, PathBuf::from("/opt/xorriso/bin/xorriso"));
        assert_eq!(config.status_poll_interval_secs, 0);
        assert_eq!(config.default_blank_mode, BlankMode::Full);
        assert_eq!(config.default_burn.speed, "4");
        assert!(!config.default_burn.eject);
        // Untouched nested keys keep their defaults.
        assert_eq!(config.default_burn.padding, 300);
    }

    #[test]
    fn flags_win_over_the_file() {
        let file = file_with("simulation = false\nrpc_bind = \"0.0.0.0:9000\"\n");
        let flags = Flags {
            simulation: Some(true),
            rpc_bind: None,
        };
        let config = AppConfig::load(file.path(), Some(&flags)).unwrap();

        assert!(config.simulation);
        assert_eq!(config.rpc_bind.to_string(), "0.0.0.0:9000");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let file = file_with("device_poll_interval_secs = 0\n");
        let err = AppConfig::load(file.path(), None::<&Flags>).unwrap_err();
        assert!(matches!(err, ConfigError::Zero { .. }));
    }

    #[test]
    fn bad_values_are_reported() {
        let file = file_with("rpc_bind = \"not an address\"\n");
        assert!(matches!(
            AppConfig::load(file.path(), None::<&Flags>),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn renders_as_toml() {
        let text = AppConfig::default().to_toml().unwrap();
        assert!(text.contains("xorriso_path = \"xorriso\""));
        assert!(text.contains("[default_burn]"));
    }
}
