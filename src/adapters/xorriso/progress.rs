//! Pacifier (`UPDATE`) lines emitted while xorriso works.
//!
//! ```text
//! xorriso : UPDATE : 1204 files added in 1 seconds
//! xorriso : UPDATE : Writing:    65536s   14.2%   fifo 100%  buf  98%    8.1xD
//! xorriso : UPDATE : Blanking  ( 37.5% done in 21 seconds )
//! xorriso : UPDATE : Formatting  ( 4.0% done in 12 seconds )
//! xorriso : UPDATE :   120384 blocks read in 30 seconds , 4.2xD
//! ```

use std::sync::LazyLock;

use regex::Regex;

use crate::core::models::JobState;

/// What one pacifier line says. Fields the line does not mention are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PacifierUpdate {
    pub phase: JobState,
    pub percent: Option<f64>,
    pub fifo_fill: Option<f64>,
    pub speed: Option<String>,
    /// Blocks written (or read back, when verifying).
    pub blocks: Option<u64>,
}

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("percent pattern"));
static FIFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"fifo\s+(\d+)%").expect("fifo pattern"));
static SPEED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?x[CDB]|\d+(?:\.\d+)?\s*[kMG]B/s)").expect("speed pattern")
});
static WRITTEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Writing:\s+(\d+)s").expect("written pattern"));
static READ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+blocks read").expect("read pattern"));

pub fn parse_pacifier(text: &str) -> Option<PacifierUpdate> {
    if !text.contains("UPDATE") {
        return None;
    }

    let (phase, blocks) = if let Some(caps) = WRITTEN.captures(text) {
        (JobState::Burning, caps[1].parse().ok())
    } else if text.contains("Writing") {
        (JobState::Burning, None)
    } else if text.contains("Blanking") {
        (JobState::Blanking, None)
    } else if text.contains("Formatting") {
        (JobState::Formatting, None)
    } else if let Some(caps) = READ.captures(text) {
        (JobState::Verifying, caps[1].parse().ok())
    } else if text.contains("files added") || text.contains("Thank you for being patient") {
        (JobState::Preparing, None)
    } else {
        return None;
    };

    // The first percentage is the overall one; fifo and buffer come after it.
    let percent = PERCENT
        .captures(text)
        .filter(|caps| !preceded_by(text, caps.get(0).map_or(0, |m| m.start()), &["fifo", "buf"]))
        .and_then(|caps| caps[1].parse().ok());
    let fifo_fill = FIFO.captures(text).and_then(|caps| caps[1].parse().ok());
    let speed = SPEED
        .captures(text)
        .map(|caps| caps[1].split_whitespace().collect::<String>());

    Some(PacifierUpdate {
        phase,
        percent,
        fifo_fill,
        speed,
        blocks,
    })
}

fn preceded_by(text: &str, at: usize, words: &[&str]) -> bool {
    let before = text[..at].trim_end();
    words.iter().any(|w| before.ends_with(w))
}

/// Remaining time from elapsed time and progress, e.g. `1m 20s`.
pub fn estimate_eta(elapsed_secs: u64, percent: f64) -> Option<String> {
    if !(percent > 0.0 && percent < 100.0) {
        return None;
    }
    let remaining = (elapsed_secs as f64 * (100.0 - percent) / percent).round() as u64;
    Some(format_duration(remaining))
}

pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m {s}s"),
        _ => format!("{h}h {m}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writing_line() {
        let update = parse_pacifier(
            "xorriso : UPDATE : Writing:    65536s   14.2%   fifo 100%  buf  98%    8.1xD",
        )
        .unwrap();

        assert_eq!(update.phase, JobState::Burning);
        assert_eq!(update.percent, Some(14.2));
        assert_eq!(update.fifo_fill, Some(100.0));
        assert_eq!(update.speed.as_deref(), Some("8.1xD"));
        assert_eq!(update.blocks, Some(65536));
    }

    #[test]
    fn blanking_and_formatting_lines() {
        let blank = parse_pacifier("xorriso : UPDATE : Blanking  ( 37.5% done in 21 seconds )").unwrap();
        assert_eq!(blank.phase, JobState::Blanking);
        assert_eq!(blank.percent, Some(37.5));

        let format = parse_pacifier("xorriso : UPDATE : Formatting  ( 4.0% done in 12 seconds )").unwrap();
        assert_eq!(format.phase, JobState::Formatting);
        assert_eq!(format.percent, Some(4.0));
    }

    #[test]
    fn verify_and_preparation_lines() {
        let read = parse_pacifier("xorriso : UPDATE :   120384 blocks read in 30 seconds , 4.2xD").unwrap();
        assert_eq!(read.phase, JobState::Verifying);
        assert_eq!(read.blocks, Some(120384));
        assert_eq!(read.percent, None);

        let added = parse_pacifier("xorriso : UPDATE : 1204 files added in 1 seconds").unwrap();
        assert_eq!(added.phase, JobState::Preparing);
    }

    #[test]
    fn fifo_only_is_not_a_percentage() {
        let update = parse_pacifier("xorriso : UPDATE : Writing:  fifo 50%").unwrap();
        assert_eq!(update.percent, None);
        assert_eq!(update.fifo_fill, Some(50.0));
    }

    #[test]
    fn other_lines_are_not_progress() {
        assert!(parse_pacifier("xorriso : NOTE : Writing to '/dev/sr0'").is_none());
        assert!(parse_pacifier("xorriso : UPDATE : Something new").is_none());
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(estimate_eta(60, 50.0).as_deref(), Some("1m 0s"));
        assert_eq!(estimate_eta(10, 0.0), None);
        assert_eq!(estimate_eta(10, 100.0), None);
        assert_eq!(format_duration(3725), "1h 2m");
        assert_eq!(format_duration(42), "42s");
    }
}
