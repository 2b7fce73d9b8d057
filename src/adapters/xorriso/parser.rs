//! Parsing of xorriso's `-pkt_output on` stream and of the reports of the
//! inquiry commands (`-device_links`, `-list_speeds`, `-list_profiles`,
//! `-toc`, `-tell_media_space`, `-check_media`).

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::models::{Device, SpeedOption};

/// Bytes per data block on optical media.
pub const BLOCK_SIZE: u64 = 2048;

/// Output channel of a packet line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Result,
    Info,
    Mark,
}

/// One line of `-pkt_output on`, e.g. `I:1:xorriso : UPDATE : ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktLine {
    pub channel: Channel,
    pub mode: u8,
    pub text: String,
}

impl PktLine {
    pub fn parse(line: &str) -> Option<Self> {
        let bytes = line.as_bytes();
        if bytes.len() < 4 || bytes[1] != b':' || bytes[3] != b':' {
            return None;
        }
        let channel = match bytes[0] {
            b'R' => Channel::Result,
            b'I' => Channel::Info,
            b'M' => Channel::Mark,
            _ => return None,
        };
        let mode = (bytes[2] as char).to_digit(10)? as u8;
        let text = line[4..].trim_end_matches(['\r', '\n']).to_string();

        Some(Self {
            channel,
            mode,
            text,
        })
    }
}

/// Collected output of one xorriso run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub result_lines: Vec<String>,
    pub info_lines: Vec<String>,
    pub mark_lines: Vec<String>,
    pub exit_code: Option<i32>,
}

impl CmdOutput {
    pub fn from_raw(raw: &str) -> Self {
        let mut output = Self::default();
        for pkt in raw.lines().filter_map(PktLine::parse) {
            output.push(pkt);
        }
        output
    }

    pub fn push(&mut self, pkt: PktLine) {
        match pkt.channel {
            Channel::Result => self.result_lines.push(pkt.text),
            Channel::Info => self.info_lines.push(pkt.text),
            Channel::Mark => self.mark_lines.push(pkt.text),
        }
    }

    /// Result and info lines; reports land on either depending on version.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.result_lines
            .iter()
            .chain(self.info_lines.iter())
            .map(String::as_str)
    }

    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }

    /// The most relevant complaint xorriso printed, for error messages.
    pub fn failure_message(&self) -> Option<String> {
        const SEVERITIES: [&str; 4] = [": FATAL :", ": FAILURE :", ": SORRY :", ": MISHAP :"];
        self.info_lines
            .iter()
            .rev()
            .find(|line| SEVERITIES.iter().any(|s| line.contains(s)))
            .or_else(|| self.info_lines.last())
            .map(|line| strip_prefix(line).to_string())
    }
}

/// Drop the `xorriso : SEVERITY : ` prefix of a message line.
pub fn strip_prefix(line: &str) -> &str {
    let mut parts = line.splitn(3, " : ");
    match (parts.next(), parts.next(), parts.next()) {
        (Some(program), Some(_severity), Some(rest)) if !program.contains(' ') => rest.trim(),
        _ => line.trim(),
    }
}

static DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+-dev\s+'([^']+)'\s+\S+\s+:\s+'([^']*)'\s+'([^']*)'")
        .expect("device line pattern")
});

/// Parse `-device_links` / `-devices` lines:
/// `0  -dev '/dev/sr0' rwrw-- :  'HL-DT-ST' 'BD-RE  BH16NS40'`
pub fn parse_device_links<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Device> {
    lines
        .into_iter()
        .filter_map(|line| DEVICE_LINE.captures(line))
        .map(|caps| {
            let vendor = caps[3].trim().to_string();
            let model = collapse_spaces(caps[4].trim());
            Device {
                path: caps[2].to_string(),
                name: display_name(&vendor, &model, &caps[2]),
                vendor,
                model,
                capabilities: BTreeSet::new(),
            }
        })
        .collect()
}

pub fn display_name(vendor: &str, model: &str, path: &str) -> String {
    let name = format!("{vendor} {model}");
    let name = name.trim();
    if name.is_empty() {
        path.to_string()
    } else {
        name.to_string()
    }
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drive names listed in `/proc/sys/dev/cdrom/info` (`drive name:  sr1 sr0`).
/// The kernel lists them newest first; they are returned in name order.
pub fn parse_cdrom_info(text: &str) -> Vec<String> {
    let mut names: Vec<String> = text
        .lines()
        .find_map(|line| line.strip_prefix("drive name:"))
        .map(|rest| rest.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    names.sort();
    names
}

static SPEED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)k\s*,\s*(\d+(?:\.\d+)?)x([CDB])").expect("speed line pattern")
});
static LEGACY_SPEED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)kB/s\s+\(([^)]+)\)").expect("legacy speed pattern"));

/// Parse `-list_speeds` write speeds:
/// `Write speed  :   4234k ,   1.0xB` (older releases:
/// `Write speed  :   4234kB/s  (BD  1x)`). Values are kB/s with a `k`
/// suffix, which `-speed` accepts as is.
pub fn parse_speeds<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<SpeedOption> {
    lines
        .into_iter()
        .filter(|line| line.trim_start().starts_with("Write speed"))
        .filter_map(|line| {
            if let Some(caps) = SPEED_LINE.captures(line) {
                let factor: f64 = caps[2].parse().ok()?;
                let media = match &caps[3] {
                    "C" => "CD",
                    "D" => "DVD",
                    _ => "BD",
                };
                return Some(SpeedOption {
                    label: format!("{media} {}x", trim_factor(factor)),
                    value: format!("{}k", &caps[1]),
                });
            }
            LEGACY_SPEED_LINE.captures(line).map(|caps| SpeedOption {
                label: collapse_spaces(&caps[2]),
                value: format!("{}k", &caps[1]),
            })
        })
        .collect()
}

fn trim_factor(factor: f64) -> String {
    if factor.fract() == 0.0 {
        format!("{factor:.0}")
    } else {
        format!("{factor:.1}")
    }
}

static PROFILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Profile\s*:\s*0x([0-9A-Fa-f]+)\s+\(([^)]+)\)").expect("profile pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub code: u16,
    pub name: String,
    pub current: bool,
}

/// Parse `-list_profiles` lines: `Profile      : 0x0041 (BD-R sequential recording) (current)`
pub fn parse_profiles<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Profile> {
    lines
        .into_iter()
        .filter_map(|line| {
            let caps = PROFILE_LINE.captures(line)?;
            Some(Profile {
                code: u16::from_str_radix(&caps[1], 16).ok()?,
                name: caps[2].trim().to_string(),
                current: line.contains("(current)"),
            })
        })
        .collect()
}

/// Disc-type tags for a drive's profiles: `BD-R sequential recording`
/// becomes `bd-r`.
pub fn capabilities(profiles: &[Profile]) -> BTreeSet<String> {
    profiles
        .iter()
        .filter_map(|p| p.name.split_whitespace().next())
        .map(str::to_ascii_lowercase)
        .collect()
}

static MEDIA_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Media space\s*:\s*(\d+)s").expect("media space pattern"));

/// Free blocks reported by `-tell_media_space` (`Media space  : 2295104s`).
pub fn parse_media_space<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<u64> {
    lines
        .into_iter()
        .find_map(|line| MEDIA_SPACE.captures(line))
        .and_then(|caps| caps[1].parse().ok())
}

static MEDIA_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Media summary\s*:\s*(\d+)\s+sessions?,\s*(\d+)\s+data blocks")
        .expect("media summary pattern")
});
static TRACK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(ISO session|Other session|Data track|Audio track)\s*:")
        .expect("track line pattern")
});

/// What `-toc` says about the loaded medium.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSummary {
    pub media_type: String,
    pub status: String,
    pub label: String,
    pub sessions: u32,
    pub tracks: u32,
    pub data_blocks: u64,
}

impl MediaSummary {
    pub fn has_media(&self) -> bool {
        !self.media_type.is_empty() && self.media_type != "none"
    }
}

pub fn parse_media_summary<'a>(lines: impl IntoIterator<Item = &'a str>) -> MediaSummary {
    let mut summary = MediaSummary::default();
    let mut tracks = 0;

    for line in lines {
        if let Some(value) = field(line, "Media current") {
            summary.media_type = if value.contains("not present") {
                "none".to_string()
            } else {
                value.to_string()
            };
        } else if let Some(value) = field(line, "Media status") {
            summary.status = media_status(value);
        } else if let Some(value) = field(line, "Volume id") {
            summary.label = value.trim_matches('\'').to_string();
        } else if let Some(caps) = MEDIA_SUMMARY.captures(line) {
            summary.sessions = caps[1].parse().unwrap_or(0);
            summary.data_blocks = caps[2].parse().unwrap_or(0);
        } else if TRACK_LINE.is_match(line) {
            tracks += 1;
        }
    }

    summary.tracks = tracks.max(summary.sessions);
    if summary.media_type == "none" {
        summary.status = "empty".to_string();
    }
    summary
}

/// Value of a `Key    : value` report line.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.trim_start().strip_prefix(key)?;
    let value = rest.trim_start().strip_prefix(':')?;
    Some(value.trim())
}

fn media_status(value: &str) -> String {
    let status = if value.contains("not present") {
        "empty"
    } else if value.contains("blank") {
        "blank"
    } else if value.contains("appendable") {
        "appendable"
    } else if value.contains("closed") {
        "closed"
    } else {
        value
    };
    status.to_string()
}

static MEDIA_REGION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Media region\s*:\s*(\d+)\s*,\s*(\d+)\s*,\s*([+-])\s*(\S+)")
        .expect("media region pattern")
});

/// Readability tally of a `-check_media` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub good_blocks: u64,
    pub bad_blocks: u64,
}

/// Parse `-check_media` region reports: `Media region :  0 , 2412544 , + good`
pub fn parse_check_media<'a>(lines: impl IntoIterator<Item = &'a str>) -> CheckSummary {
    let mut summary = CheckSummary::default();
    for caps in lines.into_iter().filter_map(|l| MEDIA_REGION.captures(l)) {
        let blocks: u64 = caps[2].parse().unwrap_or(0);
        if &caps[3] == "+" {
            summary.good_blocks += blocks;
        } else {
            summary.bad_blocks += blocks;
        }
    }
    summary
}
