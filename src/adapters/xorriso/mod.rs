//! Backend driving real drives through the `xorriso` command line tool.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::AppConfig;

mod backend;
pub mod commands;
pub mod executor;
pub mod parser;
pub mod progress;

pub use backend::XorrisoBackend;
pub use commands::XorrisoCommand;
pub use executor::{Executor, XorrisoError};

#[derive(Debug, Clone)]
pub struct XorrisoConfig {
    pub binary: PathBuf,
    /// Limit for inquiries (`-toc`, `-list_speeds`, eject, ...).
    pub query_timeout: Duration,
    /// Limit for each pass of a burn, blank or format (the write and the
    /// verify pass of a burn are bounded separately).
    pub operation_timeout: Duration,
    pub cdrom_info: PathBuf,
    pub sysfs_block: PathBuf,
}

impl Default for XorrisoConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("xorriso"),
            query_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(4 * 60 * 60),
            cdrom_info: PathBuf::from("/proc/sys/dev/cdrom/info"),
            sysfs_block: PathBuf::from("/sys/block"),
        }
    }
}

impl From<&AppConfig> for XorrisoConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            binary: config.xorriso_path.clone(),
            query_timeout: Duration::from_secs(config.query_timeout_secs.max(1)),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs.max(1)),
            ..Self::default()
        }
    }
}
