use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a disc operation, assigned by the backend (or synthesized
/// locally for legacy blank/format producers).
pub type JobId = String;

/// An optical drive as reported by the backend.
///
/// Records are never patched: a registry refresh replaces the whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device node, e.g. `/dev/sr0`. Unique key.
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    /// Disc-type tags the drive can handle (`cd-r`, `dvd+rw`, `bd-re`, ...).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl Device {
    pub fn supports(&self, disc_type: &str) -> bool {
        self.capabilities.contains(&disc_type.to_ascii_lowercase())
    }
}

/// State of the medium loaded in the selected drive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaInfo {
    pub media_type: String,
    pub media_status: String,
    pub media_label: String,
    pub total_capacity: u64,
    pub free_space: u64,
    pub sessions: u32,
    pub tracks: u32,
}

impl MediaInfo {
    /// Enforce `free_space <= total_capacity`. An unknown (zero) total takes
    /// the free-space value.
    pub fn normalized(mut self) -> Self {
        if self.total_capacity == 0 {
            self.total_capacity = self.free_space;
        }
        self.free_space = self.free_space.min(self.total_capacity);
        self
    }

    pub fn has_media(&self) -> bool {
        !self.media_type.is_empty() && self.media_type != "none"
    }

    pub fn is_blank(&self) -> bool {
        self.media_status.eq_ignore_ascii_case("blank")
    }

    pub fn used_space(&self) -> u64 {
        self.total_capacity.saturating_sub(self.free_space)
    }
}

/// One selectable write speed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedOption {
    pub label: String,
    pub value: String,
}

impl SpeedOption {
    pub const AUTO: &'static str = "auto";

    pub fn auto() -> Self {
        Self {
            label: "Auto".to_string(),
            value: Self::AUTO.to_string(),
        }
    }

    pub fn is_auto(&self) -> bool {
        self.value.eq_ignore_ascii_case(Self::AUTO)
    }

    /// Numeric part of the value, used for ordering. `None` for `auto` or
    /// unparseable values.
    pub fn numeric(&self) -> Option<f64> {
        let digits: String = self
            .value
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        digits.parse().ok()
    }
}

/// Order speeds for display: `auto` first, then slowest to fastest.
pub fn order_speeds(speeds: Vec<SpeedOption>) -> Vec<SpeedOption> {
    let mut numeric: Vec<(f64, SpeedOption)> = speeds
        .into_iter()
        .filter(|s| !s.is_auto())
        .filter_map(|s| s.numeric().map(|n| (n, s)))
        .collect();
    numeric.sort_by(|a, b| a.0.total_cmp(&b.0));
    numeric.dedup_by(|a, b| a.0 == b.0);

    std::iter::once(SpeedOption::auto())
        .chain(numeric.into_iter().map(|(_, s)| s))
        .collect()
}

/// Kind of disc operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Burn,
    Blank,
    Format,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Burn => "burn",
            Self::Blank => "blank",
            Self::Format => "format",
        }
    }

    /// The state a freshly started job of this kind is in.
    pub fn initial_state(&self) -> JobState {
        match self {
            Self::Burn => JobState::Preparing,
            Self::Blank => JobState::Blanking,
            Self::Format => JobState::Formatting,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Preparing,
    Burning,
    Verifying,
    Blanking,
    Formatting,
    Complete,
    Error,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Burning => "burning",
            Self::Verifying => "verifying",
            Self::Blanking => "blanking",
            Self::Formatting => "formatting",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Burning | Self::Verifying | Self::Blanking | Self::Formatting
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Map a progress phase name onto the active state it stands for.
    pub fn from_phase(phase: &str) -> Option<Self> {
        match phase.trim().to_ascii_lowercase().as_str() {
            "preparing" => Some(Self::Preparing),
            "burning" => Some(Self::Burning),
            "verifying" => Some(Self::Verifying),
            "blanking" => Some(Self::Blanking),
            "formatting" => Some(Self::Formatting),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot of a running job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobProgress {
    pub phase: String,
    /// 0..=100
    pub percent: f64,
    /// Display string, e.g. `8x (36.0 MB/s)`.
    pub speed: String,
    pub bytes_written: u64,
    pub bytes_total: u64,
    /// Display string, e.g. `1m 20s`.
    pub eta: String,
    /// 0..=100
    pub fifo_fill: f64,
}

impl JobProgress {
    pub fn starting(state: JobState) -> Self {
        Self {
            phase: state.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn normalized(mut self) -> Self {
        self.percent = clamp_percent(self.percent);
        self.fifo_fill = clamp_percent(self.fifo_fill);
        if self.bytes_total > 0 {
            self.bytes_written = self.bytes_written.min(self.bytes_total);
        }
        self
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Outcome attached to a job once it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl JobResult {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            bytes_written: None,
            duration_secs: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            bytes_written: None,
            duration_secs: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::failed("Cancelled by user")
    }
}

/// One timestamped line of the current job's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogLine {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.timestamp.with_timezone(&Local);
        write!(f, "[{}] {}", local.format("%H:%M:%S"), self.text)
    }
}

/// Blank modes understood by the burning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlankMode {
    #[default]
    Fast,
    Full,
    AsNeeded,
    Deformat,
    DeformatQuickest,
}

impl BlankMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Full => "full",
            Self::AsNeeded => "as_needed",
            Self::Deformat => "deformat",
            Self::DeformatQuickest => "deformat_quickest",
        }
    }
}

impl fmt::Display for BlankMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlankMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "full" | "all" => Ok(Self::Full),
            "as_needed" => Ok(Self::AsNeeded),
            "deformat" => Ok(Self::Deformat),
            "deformat_quickest" => Ok(Self::DeformatQuickest),
            other => Err(format!("unknown blank mode: {other}")),
        }
    }
}

/// Format modes for BD-RE, DVD-RAM and DVD+RW media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatMode {
    #[default]
    AsNeeded,
    Full,
    Fast,
}

impl FormatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsNeeded => "as_needed",
            Self::Full => "full",
            Self::Fast => "fast",
        }
    }
}

impl fmt::Display for FormatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FormatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "as_needed" => Ok(Self::AsNeeded),
            "full" => Ok(Self::Full),
            "fast" => Ok(Self::Fast),
            other => Err(format!("unknown format mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speed(label: &str, value: &str) -> SpeedOption {
        SpeedOption {
            label: label.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn media_free_space_never_exceeds_capacity() {
        let info = MediaInfo {
            total_capacity: 100,
            free_space: 250,
            ..Default::default()
        }
        .normalized();
        assert_eq!(info.free_space, 100);

        let unknown_total = MediaInfo {
            free_space: 4096,
            ..Default::default()
        }
        .normalized();
        assert_eq!(unknown_total.total_capacity, 4096);
        assert_eq!(unknown_total.free_space, 4096);
    }

    #[test]
    fn speeds_put_auto_first_then_slowest() {
        let ordered = order_speeds(vec![
            speed("8x", "8"),
            speed("Auto", "auto"),
            speed("2x", "2"),
            speed("4x", "4"),
            speed("2x again", "2"),
        ]);
        let values: Vec<&str> = ordered.iter().map(|s| s.value.as_str()).collect();
        assert_eq!(values, vec!["auto", "2", "4", "8"]);
    }

    #[test]
    fn auto_is_present_even_without_backend_auto() {
        let ordered = order_speeds(vec![speed("1x BD", "4496")]);
        assert!(ordered[0].is_auto());
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn phase_names_map_onto_active_states() {
        assert_eq!(JobState::from_phase("burning"), Some(JobState::Burning));
        assert_eq!(JobState::from_phase("Verifying"), Some(JobState::Verifying));
        assert_eq!(JobState::from_phase("complete"), None);
        assert_eq!(JobState::from_phase("idle"), None);
    }

    #[test]
    fn progress_is_clamped() {
        let progress = JobProgress {
            percent: 140.0,
            fifo_fill: -3.0,
            bytes_written: 900,
            bytes_total: 800,
            ..Default::default()
        }
        .normalized();
        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.fifo_fill, 0.0);
        assert_eq!(progress.bytes_written, 800);
    }

    #[test]
    fn blank_mode_accepts_engine_alias() {
        assert_eq!("all".parse::<BlankMode>(), Ok(BlankMode::Full));
        assert_eq!("full".parse::<BlankMode>(), Ok(BlankMode::Full));
        assert!("bogus".parse::<BlankMode>().is_err());
    }
}
