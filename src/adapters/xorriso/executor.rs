//! Runs xorriso processes one at a time.
//!
//! Every run gets `-pkt_output on` so each output line is tagged with its
//! channel. A run can be streamed line by line and cancelled; cancelling
//! kills the child process.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::BackendError;

use super::commands::XorrisoCommand;
use super::parser::{CmdOutput, PktLine};

#[derive(Debug, Error)]
pub enum XorrisoError {
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error talking to xorriso: {0}")]
    Io(#[from] io::Error),

    #[error("xorriso did not finish within {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{message}")]
    Failed { code: Option<i32>, message: String },
}

impl From<XorrisoError> for BackendError {
    fn from(err: XorrisoError) -> Self {
        match err {
            XorrisoError::Spawn { .. } | XorrisoError::Timeout(_) | XorrisoError::Io(_) => {
                BackendError::Unavailable(err.to_string())
            }
            XorrisoError::Cancelled | XorrisoError::Failed { .. } => {
                BackendError::Rejected(err.to_string())
            }
        }
    }
}

impl CmdOutput {
    /// Turn a non-zero exit into [`XorrisoError::Failed`].
    pub fn check(self) -> Result<Self, XorrisoError> {
        if self.success() {
            return Ok(self);
        }
        let code = self.exit_code;
        let message = self.failure_message().unwrap_or_else(|| match code {
            Some(code) => format!("xorriso exited with code {code}"),
            None => "xorriso was terminated by a signal".to_string(),
        });
        Err(XorrisoError::Failed { code, message })
    }
}

pub struct Executor {
    binary: PathBuf,
    lock: Mutex<()>,
}

impl Executor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run a short inquiry. The timeout covers waiting for a running
    /// operation to release the executor.
    pub async fn run(
        &self,
        cmd: &XorrisoCommand,
        limit: Duration,
    ) -> Result<CmdOutput, XorrisoError> {
        let never = CancellationToken::new();
        tokio::time::timeout(limit, self.run_streaming(cmd, &never, |_| {}))
            .await
            .map_err(|_| XorrisoError::Timeout(limit))?
    }

    /// Run a command, handing every packet line to `on_line` as it arrives.
    ///
    /// Returns the collected output whatever the exit status; callers use
    /// [`CmdOutput::check`] when a failure exit matters.
    pub async fn run_streaming<F>(
        &self,
        cmd: &XorrisoCommand,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<CmdOutput, XorrisoError>
    where
        F: FnMut(&PktLine) + Send,
    {
        let _guard = tokio::select! {
            guard = self.lock.lock() => guard,
            _ = cancel.cancelled() => return Err(XorrisoError::Cancelled),
        };

        debug!(binary = %self.binary.display(), args = ?cmd.args(), "Running xorriso");
        let mut child = Command::new(&self.binary)
            .args(["-pkt_output", "on"])
            .args(cmd.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| XorrisoError::Spawn {
                path: self.binary.display().to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("xorriso stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("xorriso stderr not captured"))?;

        // Drain stderr concurrently so a chatty child never blocks on it.
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut text).await;
            text
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut output = CmdOutput::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Cancelling running xorriso process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(XorrisoError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(pkt) = PktLine::parse(&line) {
                            on_line(&pkt);
                            output.push(pkt);
                        }
                    }
                    None => break,
                },
            }
        }

        let status = child.wait().await?;
        output.exit_code = status.code();

        let stderr = stderr_task.await.unwrap_or_default();
        if !stderr.trim().is_empty() {
            // Without pkt framing these are usually startup errors.
            output
                .info_lines
                .extend(stderr.lines().map(|l| l.trim().to_string()));
        }

        debug!(exit_code = ?output.exit_code, "xorriso finished");
        Ok(output)
    }
}
